// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::event::Event;
use crate::portal::support::AppError;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use color_eyre::eyre;
use color_eyre::eyre::Context;
use fastwebsockets::{upgrade, Frame, OpCode, Payload, WebSocketError};
use std::sync::Arc;
use tokio::spawn;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Pushes the scoreboard over a WebSocket, once on connect and again on every change.
pub(crate) async fn scores(
    State(event): State<Arc<Event>>,
    mut req: Request,
) -> Result<Response, AppError> {
    let (response, fut) = upgrade::upgrade(&mut req).map_err(|error| {
        debug!(?error, "invalid websocket upgrade");
        AppError::BadInput("expected a websocket upgrade".to_string())
    })?;

    spawn(async move {
        if let Err(error) = handle_client(fut, event).await {
            warn! {
                ?error,
                "scoreboard websocket error"
            }
        }
    });

    Ok(response.into_response())
}

async fn handle_client(fut: upgrade::UpgradeFut, event: Arc<Event>) -> eyre::Result<()> {
    let ws = fut.await?;
    let (mut ws_rx, mut ws_tx) = ws.split(tokio::io::split);

    let mut set = JoinSet::new();
    let mut changes = event.store().subscribe();
    set.spawn(async move {
        loop {
            let board = event.store().scoreboard();
            let bytes = serde_json::to_vec(&board).context("unable to encode the scoreboard")?;
            ws_tx
                .write_frame(Frame::text(Payload::Owned(bytes)))
                .await?;
            if changes.changed().await.is_err() {
                return Ok::<(), eyre::Report>(());
            }
        }
    });
    set.spawn(async move {
        loop {
            let frame = ws_rx
                .read_frame(&mut |_| async { Ok::<(), WebSocketError>(()) })
                .await?;
            if frame.opcode == OpCode::Close {
                return Ok::<(), eyre::Report>(());
            }
        }
    });

    if let Some(res) = set.join_next().await {
        if let Ok(Err(error)) = res {
            debug!(?error, "scoreboard client gone");
        }
    }
    // We abort when the first future returns
    set.abort_all();
    Ok(())
}
