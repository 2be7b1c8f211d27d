// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Key and mouse-click logging of the instructions teams send through the gateway.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use color_eyre::eyre;
use haaukins_virtual::Closer;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Parses the `<length>.<value>,...;` framing of Guacamole instructions. Every complete
/// instruction in `data` is returned as its opcode followed by its arguments.
pub fn parse_instructions(data: &str) -> Vec<Vec<String>> {
    let mut instructions = Vec::new();
    let mut elements = Vec::new();
    let mut chars = data.chars();

    loop {
        let mut length = String::new();
        let mut separator = None;
        for c in chars.by_ref() {
            if c == '.' {
                separator = Some(c);
                break;
            }
            length.push(c);
        }
        let (Some(_), Ok(length)) = (separator, length.trim_start().parse::<usize>()) else {
            return instructions;
        };

        let element: String = chars.by_ref().take(length).collect();
        if element.chars().count() != length {
            return instructions;
        }
        elements.push(element);

        match chars.next() {
            Some(',') => {}
            Some(';') => instructions.push(std::mem::take(&mut elements)),
            _ => return instructions,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeyLogEntry {
    Key { t: String, k: String, p: String },
    Mouse { t: String, x: String, y: String, b: String },
}

/// Turns an instruction into a log entry. Key presses and clicks of the left, middle and right
/// buttons are logged, everything else is dropped.
pub fn log_entry(instruction: &[String]) -> Option<KeyLogEntry> {
    let now = || Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match instruction {
        [opcode, key, pressed, ..] if opcode == "key" => {
            (pressed == "1").then(|| KeyLogEntry::Key {
                t: now(),
                k: key.clone(),
                p: pressed.clone(),
            })
        }
        [opcode, x, y, button, ..] if opcode == "mouse" => {
            matches!(button.as_str(), "1" | "2" | "4").then(|| KeyLogEntry::Mouse {
                t: now(),
                x: x.clone(),
                y: y.clone(),
                b: button.clone(),
            })
        }
        _ => None,
    }
}

/// A handle feeding one team's log file.
#[derive(Clone)]
pub struct KeyLogger {
    sender: flume::Sender<String>,
}

impl KeyLogger {
    /// Logs the key and mouse instructions of a frame sent by the team's browser.
    pub fn log_frame(&self, frame: &[u8]) {
        if !(frame.starts_with(b"3.key") || frame.starts_with(b"5.mouse")) {
            return;
        }
        let Ok(frame) = std::str::from_utf8(frame) else {
            return;
        };
        for instruction in parse_instructions(frame) {
            let Some(entry) = log_entry(&instruction) else {
                continue;
            };
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if self.sender.try_send(line).is_err() {
                        debug!("key log writer is gone, dropping entry");
                    }
                }
                Err(error) => warn!(?error, "unable to encode key log entry"),
            }
        }
    }
}

/// The key loggers of one event, each writing `<dir>/<team>.log` from a background task.
pub struct KeyLoggerPool {
    dir: Option<PathBuf>,
    loggers: Mutex<HashMap<String, KeyLogger>>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl KeyLoggerPool {
    pub fn new(dir: impl Into<PathBuf>) -> KeyLoggerPool {
        KeyLoggerPool {
            dir: Some(dir.into()),
            ..Self::disabled()
        }
    }

    /// A pool that hands out no loggers.
    pub fn disabled() -> KeyLoggerPool {
        KeyLoggerPool {
            dir: None,
            loggers: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn logger(&self, team_id: &str) -> Option<KeyLogger> {
        let dir = self.dir.as_ref()?;
        if self.cancellation_token.is_cancelled() {
            return None;
        }
        let mut loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(logger) = loggers.get(team_id) {
            return Some(logger.clone());
        }

        let (sender, receiver) = flume::bounded(1024);
        let path = dir.join(format!("{team_id}.log"));
        let cancellation_token = self.cancellation_token.clone();
        self.tracker.spawn(async move {
            if let Err(error) = write_log(&path, receiver, cancellation_token).await {
                warn!(?error, ?path, "key log writer failed");
            }
        });
        let logger = KeyLogger { sender };
        loggers.insert(team_id.to_string(), logger.clone());
        Some(logger)
    }
}

async fn write_log(
    path: &Path,
    receiver: flume::Receiver<String>,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    loop {
        let line = select! {
            _ = cancellation_token.cancelled() => break,
            line = receiver.recv_async() => match line {
                Ok(line) => line,
                Err(_) => break,
            },
        };
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }

    // Entries queued before the pool closed
    for line in receiver.drain() {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Closer for KeyLoggerPool {
    async fn close(&self) -> eyre::Result<()> {
        self.cancellation_token.cancel();
        self.loggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}
