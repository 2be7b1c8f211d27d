// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::portal::support::{AppError, AppJson, Session};
use axum::extract::State;
use axum::Json;
use haaukins_common::models::responses::StatusResponse;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize)]
pub(crate) struct ChallengeRequest {
    tag: String,
}

pub(crate) async fn reset_challenge(
    State(event): State<Arc<Event>>,
    Session(team): Session,
    AppJson(request): AppJson<ChallengeRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    event.reset_challenge(&team, request.tag.trim()).await?;
    info!(team = %team.id(), challenge = %request.tag, "team reset challenge");
    Ok(Json(StatusResponse::ok()))
}

/// Stops a running challenge, or starts one the team stopped.
pub(crate) async fn manage_challenge(
    State(event): State<Arc<Event>>,
    Session(team): Session,
    AppJson(request): AppJson<ChallengeRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    let running = event.toggle_challenge(&team, request.tag.trim()).await?;
    info!(team = %team.id(), challenge = %request.tag, running, "team managed challenge");
    Ok(Json(StatusResponse::ok()))
}

pub(crate) async fn reset_frontend(
    State(event): State<Arc<Event>>,
    Session(team): Session,
) -> Result<Json<StatusResponse>, AppError> {
    event.reset_team_frontends(&team).await?;
    Ok(Json(StatusResponse::ok()))
}
