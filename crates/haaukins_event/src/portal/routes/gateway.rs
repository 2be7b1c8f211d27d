// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::portal::support::{session_team, AppError, Session};
use crate::proxy;
use axum::extract::{Request, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

/// Logs the team into the gateway and sends the browser on to the gateway's web client.
pub(crate) async fn login(
    State(event): State<Arc<Event>>,
    Session(team): Session,
) -> Result<impl IntoResponse, AppError> {
    let raw_token = event.gateway_login(&team).await?;
    Ok((
        StatusCode::FOUND,
        [
            (LOCATION, HeaderValue::from_static("/guacamole")),
            (SET_COOKIE, proxy::auth_cookie(&raw_token)),
        ],
    ))
}

/// Relays `/guacamole` to the gateway. Tunnels of logged-in teams are key logged.
pub(crate) async fn relay(State(event): State<Arc<Event>>, req: Request) -> Response {
    let port = event.gateway().web_port();
    if proxy::is_websocket(&req) {
        let keylogger = session_team(&event, req.headers())
            .and_then(|team| event.keylogger().logger(team.id()));
        proxy::websocket(req, port, keylogger).await.into_response()
    } else {
        proxy::forward(event.http(), req, port).await.into_response()
    }
}
