// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::portal::support::{AppJson, Session};
use crate::store::Scoreboard;
use crate::team::TeamChallenge;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use haaukins_common::models::responses::{AppResponse, StatusResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub(crate) struct VerifyFlagRequest {
    tag: String,
    flag: String,
}

#[derive(Serialize)]
struct ErrorReply {
    error: String,
}

pub(crate) async fn list(Session(team): Session) -> Json<AppResponse<Vec<TeamChallenge>>> {
    Json(AppResponse::Ok(team.challenges()))
}

/// Answers `{"status":"ok"}` for a correct flag and `{"error": ...}` otherwise, both with 200.
pub(crate) async fn verify_flag(
    State(event): State<Arc<Event>>,
    Session(team): Session,
    AppJson(request): AppJson<VerifyFlagRequest>,
) -> Response {
    match event
        .store()
        .solve(team.id(), &request.tag, &request.flag)
        .await
    {
        Ok(_) => Json(StatusResponse::ok()).into_response(),
        Err(error) => Json(ErrorReply {
            error: error.to_string(),
        })
        .into_response(),
    }
}

pub(crate) async fn scoreboard(State(event): State<Arc<Event>>) -> Json<AppResponse<Scoreboard>> {
    Json(AppResponse::Ok(event.store().scoreboard()))
}
