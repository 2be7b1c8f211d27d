// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::portal::support::{expired_session_cookie, session_cookie, AppError, AppForm};
use crate::team::Team;
use crate::token;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::response::{AppendHeaders, IntoResponse, Redirect};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

const TEAM_NAME_MAX_LENGTH: usize = 20;
const PASSWORD_MIN_LENGTH: usize = 6;
const PASSWORD_MAX_LENGTH: usize = 40;

lazy_static! {
    static ref TEAM_NAME: Regex = Regex::new("^[A-Za-z0-9]+$").expect("valid team name regex");
}

#[derive(Deserialize)]
pub(crate) struct SignupForm {
    #[serde(rename = "team-name")]
    team_name: String,
    #[serde(default)]
    email: String,
    password: String,
    #[serde(rename = "password-repeat")]
    password_repeat: String,
    #[serde(rename = "secret-event-key", default)]
    secret_event_key: String,
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    #[serde(rename = "team-name")]
    team_name: String,
    password: String,
}

fn check_team_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() {
        return Err(AppError::BadInput("Team name can NOT be empty".to_string()));
    }
    if name.chars().count() > TEAM_NAME_MAX_LENGTH {
        return Err(AppError::BadInput("Team name is too long".to_string()));
    }
    if !TEAM_NAME.is_match(name) {
        return Err(AppError::BadInput(
            "Team name should NOT contain non-alphanumeric characters".to_string(),
        ));
    }
    Ok(())
}

fn check_password(password: &str, repeated: &str) -> Result<(), AppError> {
    let length = password.chars().count();
    if length < PASSWORD_MIN_LENGTH {
        return Err(AppError::BadInput(format!(
            "Password needs to be at least {PASSWORD_MIN_LENGTH} characters"
        )));
    }
    if length > PASSWORD_MAX_LENGTH {
        return Err(AppError::BadInput(format!(
            "The maximum password length is {PASSWORD_MAX_LENGTH} characters"
        )));
    }
    if password != repeated {
        return Err(AppError::BadInput("Password needs to match".to_string()));
    }
    Ok(())
}

fn check_secret(expected: Option<&str>, submitted: &str) -> Result<(), AppError> {
    let Some(expected) = expected.map(str::trim).filter(|secret| !secret.is_empty()) else {
        return Ok(());
    };
    if bool::from(submitted.trim().as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AppError::ProtectedEvent)
    }
}

/// Hands the team a lab now if one is ready. Teams without a lab get one on their next
/// gateway login.
async fn try_assign(event: &Event, team: &Team) {
    if let Err(error) = event.assign_next(team).await {
        warn!(?error, team = %team.id(), "unable to assign a lab");
    }
}

pub(crate) async fn signup(
    State(event): State<Arc<Event>>,
    AppForm(form): AppForm<SignupForm>,
) -> Result<impl IntoResponse, AppError> {
    let name = form.team_name.trim().to_string();
    check_team_name(&name)?;
    check_password(&form.password, &form.password_repeat)?;
    let config = event.config();
    check_secret(config.secret_key.as_deref(), &form.secret_event_key)?;
    // Saves the hashing when full. The store checks again under its lock.
    if event.store().team_count() >= config.capacity {
        return Err(AppError::CapacityReached);
    }

    let team = tokio::task::spawn_blocking(move || Team::new(&form.email, &name, &form.password))
        .await
        .map_err(|_| AppError::Internal)??;
    let team = event.store().save_team(team).await?;
    let cookie = session_cookie(&token::issue(event.signing_key(), &team)?)?;
    info!(event = %event.tag(), team = %team.id(), "team signed up");

    try_assign(&event, &team).await;
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), Redirect::to("/")))
}

pub(crate) async fn login(
    State(event): State<Arc<Event>>,
    AppForm(form): AppForm<LoginForm>,
) -> Result<impl IntoResponse, AppError> {
    let team = event
        .store()
        .team_by_name(&form.team_name)
        .ok_or(AppError::IncorrectCredentials)?;
    let verified = {
        let team = team.clone();
        tokio::task::spawn_blocking(move || team.verify_password(&form.password))
            .await
            .map_err(|_| AppError::Internal)?
    };
    if !verified {
        return Err(AppError::IncorrectCredentials);
    }

    event.store().touch(team.id()).await?;
    let cookie = session_cookie(&token::issue(event.signing_key(), &team)?)?;
    if let Err(error) = event.resume_team_lab(&team).await {
        warn!(?error, team = %team.id(), "unable to resume lab on login");
    }
    try_assign(&event, &team).await;
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), Redirect::to("/")))
}

pub(crate) async fn logout() -> impl IntoResponse {
    (
        AppendHeaders([(SET_COOKIE, expired_session_cookie())]),
        Redirect::to("/"),
    )
}
