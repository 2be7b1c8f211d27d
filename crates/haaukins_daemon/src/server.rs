// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::metrics::{RouterMetrics, NOT_FOUND, ROUTED};
use crate::pool::EventPool;
use axum::body::{Bytes, HttpBody};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::BoxError;
use color_eyre::eyre;
use color_eyre::eyre::bail;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::debug;

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Not found</title>
</head>
<body>
<h1>404 Not Found</h1>
<p>There is no event at this address.</p>
</body>
</html>
"#;

#[derive(Clone)]
pub(crate) struct Ingress {
    pub pool: Arc<EventPool>,
    pub metrics: RouterMetrics,
}

/// Serves event portals until `cancellation_token` is cancelled.
pub(crate) async fn serve(
    listener: TcpListener,
    ingress: Ingress,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                return Ok(());
            },
            res = listener.accept() => {
                let (stream, client_socket) = res?;
                debug! {
                    ?client_socket,
                    "accepted a client"
                }
                let ingress = ingress.clone();
                spawn(async move {
                    if let Err(error) = handle_conn(stream, ingress).await {
                        debug! {
                            ?error,
                            "connection handling error"
                        }
                    }
                });
            }
        }
    }
}

async fn handle_conn(stream: TcpStream, ingress: Ingress) -> eyre::Result<()> {
    let io = TokioIo::new(stream);
    let res = Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(
            io,
            service_fn(move |req| handle_request(req, ingress.clone())),
        )
        .await;
    if let Err(err) = res {
        bail!("connection error: {err:?}");
    }
    Ok(())
}

fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
}

/// Hands the request to the portal of the event named by its host, or answers 404.
pub(crate) async fn handle_request<B>(
    req: Request<B>,
    ingress: Ingress,
) -> Result<Response, Infallible>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let route = request_host(&req).and_then(|host| ingress.pool.route(host));
    match route {
        Some((tag, handler)) => {
            ingress.metrics.record(tag.as_str(), ROUTED);
            handler.oneshot(req).await
        }
        None => {
            ingress.metrics.record("", NOT_FOUND);
            Ok((StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE)).into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RouterLabels;
    use crate::testing::{create_request, test_orchestrator};
    use axum::body::Body;
    use haaukins_virtual::Closer;

    fn get(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    fn count(metrics: &RouterMetrics, event: &str, outcome: &str) -> u64 {
        metrics
            .requests
            .get_or_create(&RouterLabels {
                event: event.to_string(),
                outcome: outcome.to_string(),
            })
            .get()
    }

    #[tokio::test]
    async fn should_route_requests_by_subdomain() {
        let test = test_orchestrator();
        let pool = test.orchestrator.pool().clone();
        pool.set_host("ntp-event.dk");
        test.orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        let ingress = Ingress {
            pool,
            metrics: RouterMetrics::default(),
        };

        let res = handle_request(get("demo.ntp-event.dk"), ingress.clone())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = handle_request(get("DEMO.ntp-event.dk:8080"), ingress.clone())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        for host in ["other.ntp-event.dk", "ntp-event.dk", "demo.example.org"] {
            let res = handle_request(get(host), ingress.clone()).await.unwrap();
            assert_eq!(res.status(), StatusCode::NOT_FOUND, "{host}");
        }

        assert_eq!(count(&ingress.metrics, "demo", ROUTED), 2);
        assert_eq!(count(&ingress.metrics, "", NOT_FOUND), 3);

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_redirect_to_the_suspended_page() {
        let test = test_orchestrator();
        test.orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        test.orchestrator.suspend_event("demo", true).await.unwrap();
        let ingress = Ingress {
            pool: test.orchestrator.pool().clone(),
            metrics: RouterMetrics::default(),
        };

        let res = handle_request(get("demo.localhost"), ingress.clone())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);

        test.orchestrator.suspend_event("demo", false).await.unwrap();
        let res = handle_request(get("demo.localhost"), ingress).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_serve_until_cancelled() {
        let test = test_orchestrator();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancellation_token = CancellationToken::new();
        let server = spawn(serve(
            listener,
            Ingress {
                pool: test.orchestrator.pool().clone(),
                metrics: RouterMetrics::default(),
            },
            cancellation_token.clone(),
        ));

        cancellation_token.cancel();
        server.await.unwrap().unwrap();
    }
}
