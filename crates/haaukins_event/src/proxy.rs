// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Forwarding of `/guacamole/*` to the gateway's web application on the loopback interface.

use crate::keylog::KeyLogger;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use fastwebsockets::{
    handshake, upgrade, OpCode, WebSocket, WebSocketError, WebSocketRead, WebSocketWrite,
};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::spawn;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers the proxy sets itself on the upgrade request towards the gateway.
const IGNORED_UPGRADE_HEADERS: [HeaderName; 6] = [
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_VERSION,
    SEC_WEBSOCKET_KEY,
    CONNECTION,
    UPGRADE,
    HOST,
];

#[derive(thiserror::Error, Debug)]
pub(crate) enum ProxyError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WebSocketError),
    #[error("unable to reach the gateway: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unable to read the request body: {0}")]
    Body(#[from] axum::Error),
    #[error("invalid request: {0}")]
    Request(#[from] axum::http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        warn!(error = ?self, "gateway proxy error");
        (StatusCode::BAD_GATEWAY, "gateway unavailable").into_response()
    }
}

fn path_and_query(req: &Request) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

pub(crate) fn is_websocket(req: &Request) -> bool {
    upgrade::is_upgrade_request(req)
}

/// Bridges a WebSocket upgrade to the gateway. Frames from the browser are fed to `keylogger`.
pub(crate) async fn websocket(
    mut req: Request,
    port: u16,
    keylogger: Option<KeyLogger>,
) -> Result<Response, ProxyError> {
    let backend_addr = format!("127.0.0.1:{port}");
    let mut backend_req = hyper::Request::builder()
        .method("GET")
        .uri(path_and_query(&req))
        .header(HOST, backend_addr.as_str())
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13");
    for (name, value) in req.headers() {
        if IGNORED_UPGRADE_HEADERS.contains(name) || *name == ORIGIN {
            continue;
        }
        backend_req = backend_req.header(name, value);
    }
    backend_req = backend_req.header(ORIGIN, format!("http://{backend_addr}"));
    if let Some(host) = req.headers().get(HOST) {
        backend_req = backend_req.header(X_FORWARDED_HOST, host);
    }
    let backend_req = backend_req.body(Empty::<Bytes>::new())?;

    let stream = TcpStream::connect(&backend_addr).await?;
    let (backend, backend_res) =
        handshake::client(&TokioExecutor::new(), backend_req, stream).await?;

    let (mut response, upgrade_fut) = upgrade::upgrade(&mut req)?;
    if let Some(protocol) = backend_res.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    spawn(async move {
        let client = match upgrade_fut.await {
            Ok(client) => client,
            Err(error) => {
                warn!(?error, "unable to upgrade the client connection");
                return;
            }
        };
        relay(client, backend, keylogger).await;
    });

    Ok(response.into_response())
}

async fn relay(
    mut client: WebSocket<TokioIo<Upgraded>>,
    mut backend: WebSocket<TokioIo<Upgraded>>,
    keylogger: Option<KeyLogger>,
) {
    // Control frames are relayed as they are, each end answers its own peer.
    for ws in [&mut client, &mut backend] {
        ws.set_auto_close(false);
        ws.set_auto_pong(false);
    }
    let (client_rx, client_tx) = client.split(tokio::io::split);
    let (backend_rx, backend_tx) = backend.split(tokio::io::split);

    let mut set = JoinSet::new();
    set.spawn(pump(client_rx, backend_tx, keylogger));
    set.spawn(pump(backend_rx, client_tx, None));

    if let Some(res) = set.join_next().await {
        match res {
            Ok(Err(error)) => debug!(?error, "tunnel closed with error"),
            Err(error) => warn!(?error, "tunnel task failed"),
            Ok(Ok(())) => {}
        }
    }
    // Either side closing ends the tunnel
    set.abort_all();
}

async fn pump<R, W>(
    mut rx: WebSocketRead<R>,
    mut tx: WebSocketWrite<W>,
    keylogger: Option<KeyLogger>,
) -> Result<(), WebSocketError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = rx
            .read_frame(&mut |_| async { Ok::<(), WebSocketError>(()) })
            .await?;
        if let Some(keylogger) = &keylogger {
            if frame.opcode == OpCode::Text {
                keylogger.log_frame(&frame.payload);
            }
        }
        let close = frame.opcode == OpCode::Close;
        tx.write_frame(frame).await?;
        if close {
            return Ok(());
        }
    }
}

/// Forwards a plain HTTP request to the gateway and relays the response.
pub(crate) async fn forward(
    client: &reqwest::Client,
    req: Request,
    port: u16,
) -> Result<Response, ProxyError> {
    let url = format!("http://127.0.0.1:{port}{}", path_and_query(&req));
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE).await?;

    let mut headers = parts.headers;
    headers.remove(HOST);
    let res = client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let mut response = Response::builder().status(res.status());
    for (name, value) in res.headers() {
        if *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        response = response.header(name, value);
    }
    let body = res.bytes().await?;
    Ok(response.body(Body::from(body))?)
}

/// The cookie the gateway's web client reads its session from.
pub(crate) fn auth_cookie(raw_token: &str) -> HeaderValue {
    let escaped: String = form_urlencoded::byte_serialize(raw_token.as_bytes()).collect();
    HeaderValue::from_str(&format!("GUAC_AUTH={escaped}; Path=/guacamole/"))
        .unwrap_or_else(|_| HeaderValue::from_static("GUAC_AUTH=; Path=/guacamole/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connect_websocket, serve};
    use axum::extract::State;
    use axum::http::header::HeaderMap;
    use axum::http::Uri;
    use axum::routing::{any, post};
    use axum::Router;
    use fastwebsockets::{Frame, Payload};
    use std::time::Duration;
    use tokio::time::timeout;

    /// A gateway stand-in greeting every tunnel with `hello`, echoing text frames and closing on
    /// `bye`. Everything it reads is reported on the channel.
    async fn gateway_tunnel(State(seen): State<flume::Sender<String>>, mut req: Request) -> Response {
        let (response, fut) = upgrade::upgrade(&mut req).unwrap();
        spawn(async move {
            let mut ws = fut.await.unwrap();
            ws.set_auto_close(false);
            ws.write_frame(Frame::text(Payload::Borrowed(b"hello")))
                .await
                .unwrap();
            while let Ok(frame) = ws.read_frame().await {
                match frame.opcode {
                    OpCode::Close => {
                        seen.send("closed".to_string()).unwrap();
                        return;
                    }
                    OpCode::Text => {
                        let text = String::from_utf8(frame.payload.to_vec()).unwrap();
                        seen.send(text.clone()).unwrap();
                        if text == "bye" {
                            ws.write_frame(Frame::close(1000, b"")).await.unwrap();
                            return;
                        }
                        let echo = format!("echo:{text}").into_bytes();
                        ws.write_frame(Frame::text(Payload::Owned(echo)))
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        });
        response.into_response()
    }

    async fn tunnel() -> (std::net::SocketAddr, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        let gateway = serve(
            Router::new()
                .route("/guacamole/websocket-tunnel", any(gateway_tunnel))
                .with_state(tx),
        )
        .await;
        let proxy = serve(Router::new().route(
            "/guacamole/{*path}",
            any(move |req: Request| async move {
                websocket(req, gateway.port(), None).await.into_response()
            }),
        ))
        .await;
        (proxy, rx)
    }

    async fn read_text<S>(ws: &mut WebSocket<S>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = timeout(Duration::from_secs(5), ws.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        String::from_utf8(frame.payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn should_relay_frames_both_ways() {
        let (proxy, seen) = tunnel().await;
        let mut ws = connect_websocket(proxy, "/guacamole/websocket-tunnel").await;

        assert_eq!(read_text(&mut ws).await, "hello");
        ws.write_frame(Frame::text(Payload::Borrowed(b"4.key,5.65307,1.1;")))
            .await
            .unwrap();
        assert_eq!(read_text(&mut ws).await, "echo:4.key,5.65307,1.1;");
        assert_eq!(seen.recv_async().await.unwrap(), "4.key,5.65307,1.1;");

        ws.write_frame(Frame::close(1000, b"")).await.unwrap();
        let closed = timeout(Duration::from_secs(5), seen.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, "closed");
    }

    #[tokio::test]
    async fn should_close_the_client_when_the_gateway_closes() {
        let (proxy, seen) = tunnel().await;
        let mut ws = connect_websocket(proxy, "/guacamole/websocket-tunnel").await;
        assert_eq!(read_text(&mut ws).await, "hello");

        ws.write_frame(Frame::text(Payload::Borrowed(b"bye")))
            .await
            .unwrap();
        assert_eq!(seen.recv_async().await.unwrap(), "bye");
        let frame = timeout(Duration::from_secs(5), ws.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
    }

    async fn echo(uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
        let host = headers
            .get(HOST)
            .and_then(|host| host.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            StatusCode::CREATED,
            [
                ("x-query", uri.query().unwrap_or_default().to_string()),
                ("x-host", host),
            ],
            body,
        )
            .into_response()
    }

    #[tokio::test]
    async fn should_forward_plain_requests() {
        let gateway = serve(Router::new().route("/guacamole/api/tokens", post(echo))).await;
        let req = axum::http::Request::post("/guacamole/api/tokens?limit=1")
            .header(HOST, "demo.localhost")
            .body(Body::from("username=alpha"))
            .unwrap();

        let res = forward(&reqwest::Client::new(), req, gateway.port())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers().get("x-query").unwrap(), "limit=1");
        assert_eq!(
            res.headers().get("x-host").unwrap().to_str().unwrap(),
            format!("127.0.0.1:{}", gateway.port())
        );
        let body = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"username=alpha");
    }

    #[tokio::test]
    async fn should_answer_bad_gateway_when_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let req = axum::http::Request::get("/guacamole/")
            .body(Body::empty())
            .unwrap();
        let error = forward(&reqwest::Client::new(), req, port)
            .await
            .unwrap_err();
        assert!(matches!(error, ProxyError::Http(_)));
        assert_eq!(error.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn should_escape_gateway_token_cookie() {
        let cookie = auth_cookie(r#"{"authToken":"abc","username":"alpha"}"#);
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("GUAC_AUTH=%7B%22authToken%22"));
        assert!(cookie.ends_with("; Path=/guacamole/"));
        assert!(!cookie.contains('"'));
    }
}
