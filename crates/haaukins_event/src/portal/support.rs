// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::store::StoreError;
use crate::team::Team;
use crate::token::{self, TokenError, SESSION_COOKIE};
use crate::EventError;
use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{Form, FromRequest, FromRequestParts};
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use haaukins_common::models::responses::AppResponse;
use haaukins_lab::LabError;
use std::sync::Arc;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppError {
    #[error("{0}")]
    BadInput(String),
    #[error("requires authentication")]
    Unauthorized,
    #[error("Credentials does not match")]
    IncorrectCredentials,
    #[error("wrong secret key for this event, ask the event administrator for the key")]
    ProtectedEvent,
    #[error("capacity reached for this event")]
    CapacityReached,
    #[error("{0}")]
    JsonRejection(#[from] JsonRejection),
    #[error("{0}")]
    FormRejection(#[from] FormRejection),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("internal error")]
    Internal,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match &self {
            // User errors
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::BAD_REQUEST,
            AppError::IncorrectCredentials => StatusCode::UNAUTHORIZED,
            AppError::ProtectedEvent => StatusCode::FORBIDDEN,
            AppError::CapacityReached => StatusCode::CONFLICT,
            AppError::JsonRejection(_) => StatusCode::BAD_REQUEST,
            AppError::FormRejection(_) => StatusCode::BAD_REQUEST,
            AppError::Store(
                StoreError::TeamAlreadyExists
                | StoreError::EmailAlreadyExists
                | StoreError::CapacityReached,
            ) => StatusCode::CONFLICT,
            AppError::Store(
                StoreError::UnknownTeam(_) | StoreError::UnknownFlag | StoreError::FlagAlreadyCompleted,
            ) => StatusCode::BAD_REQUEST,

            AppError::Event(EventError::NoLab(_) | EventError::Lab(LabError::UnknownTag(_))) => {
                StatusCode::BAD_REQUEST
            }

            // Labs running out
            AppError::Event(
                EventError::NoAvailableLabs
                | EventError::MaxLabs
                | EventError::Suspended
                | EventError::Broken
                | EventError::Closed,
            ) => StatusCode::SERVICE_UNAVAILABLE,

            // Server errors
            AppError::Store(_) | AppError::Event(_) | AppError::Token(_) | AppError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = ?self, "portal request failed");
        }
        let res: AppResponse<()> = AppResponse::Error {
            message: self.to_string(),
        };
        let mut res = Json(res).into_response();
        *res.status_mut() = status;
        res
    }
}

#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub(crate) struct AppJson<T>(pub(crate) T);

impl<T> IntoResponse for AppJson<T>
where
    Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        Json(self.0).into_response()
    }
}

#[derive(FromRequest)]
#[from_request(via(Form), rejection(AppError))]
pub(crate) struct AppForm<T>(pub(crate) T);

/// Reads a cookie from the request headers.
pub(crate) fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

pub(crate) fn session_cookie(token: &str) -> Result<HeaderValue, AppError> {
    let max_age = token::token_validity().num_seconds();
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax"
    ))
    .map_err(|_| AppError::Internal)
}

pub(crate) fn expired_session_cookie() -> HeaderValue {
    HeaderValue::from_static("session=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

/// The team whose session cookie came with the request.
pub(crate) fn session_team(event: &Event, headers: &HeaderMap) -> Option<Arc<Team>> {
    let token = cookie(headers, SESSION_COOKIE)?;
    let claims = token::verify(event.signing_key(), &token).ok()?;
    event.store().team(&claims.id).ok()
}

/// A logged-in team.
pub(crate) struct Session(pub(crate) Arc<Team>);

impl FromRequestParts<Arc<Event>> for Session {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        event: &Arc<Event>,
    ) -> Result<Self, Self::Rejection> {
        session_team(event, &parts.headers)
            .map(Session)
            .ok_or(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_find_cookies_among_others() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; session=abc.def"));
        headers.append(COOKIE, HeaderValue::from_static("GUAC_AUTH=x"));
        assert_eq!(cookie(&headers, "session").as_deref(), Some("abc.def"));
        assert_eq!(cookie(&headers, "GUAC_AUTH").as_deref(), Some("x"));
        assert_eq!(cookie(&headers, "missing"), None);
    }
}
