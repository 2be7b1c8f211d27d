// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! The pages and endpoints teams use during an event.

mod routes;
mod support;

use crate::event::Event;
use crate::portal::routes::{account, challenges, gateway, lab, scores};
use crate::portal::support::session_team;
use axum::extract::{Request, State};
use axum::http::header::STRICT_TRANSPORT_SECURITY;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use haaukins_common::models::EventStatus;
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;

const SUSPENDED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="10">
<title>Event suspended</title>
</head>
<body>
<h1>307 Event Temporary Suspended</h1>
<p>The event is paused by its organizers. This page reloads by itself.</p>
</body>
</html>
"#;

pub(crate) fn router(event: Arc<Event>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/signup", post(account::signup))
        .route("/login", post(account::login))
        .route("/logout", get(account::logout))
        .route("/guaclogin", get(gateway::login))
        .route("/challenges", get(challenges::list))
        .route("/flags/verify", post(challenges::verify_flag))
        .route("/scoreboard", get(challenges::scoreboard))
        .route("/scores", get(scores::scores))
        .route("/reset/challenge", post(lab::reset_challenge))
        .route("/manage/challenge", post(lab::manage_challenge))
        .route("/reset/frontend", post(lab::reset_frontend))
        .route("/guacamole", any(gateway::relay))
        .route("/guacamole/{*path}", any(gateway::relay))
        .layer(middleware::from_fn_with_state(event.clone(), suspended))
        .layer(SetResponseHeaderLayer::overriding(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        .with_state(event)
}

async fn suspended(State(event): State<Arc<Event>>, req: Request, next: Next) -> Response {
    if event.status() == EventStatus::Suspended {
        return (StatusCode::TEMPORARY_REDIRECT, Html(SUSPENDED_PAGE)).into_response();
    }
    next.run(req).await
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn index(State(event): State<Arc<Event>>, headers: HeaderMap) -> Html<String> {
    let config = event.config();
    let body = match session_team(&event, &headers) {
        Some(team) => format!(
            r#"<p>Logged in as <b>{}</b>.</p>
<p><a href="/guaclogin">Open your lab</a> | <a href="/logout">Log out</a></p>"#,
            escape(team.name())
        ),
        None => r#"<form method="post" action="/login">
<input name="team-name" placeholder="Team name"> <input name="password" type="password" placeholder="Password">
<button>Log in</button>
</form>
<form method="post" action="/signup">
<input name="team-name" placeholder="Team name"> <input name="email" placeholder="Email">
<input name="password" type="password" placeholder="Password"> <input name="password-repeat" type="password" placeholder="Repeat password">
<input name="secret-event-key" placeholder="Event key">
<button>Sign up</button>
</form>"#
            .to_string(),
    };
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{name}</title></head>
<body>
<h1>{name}</h1>
{body}
<p><a href="/scoreboard">Scoreboard</a></p>
</body>
</html>
"#,
        name = escape(&config.name)
    ))
}
