// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::models::FrontendConfig;
use color_eyre::eyre;
use color_eyre::eyre::Context;
use futures::future::select_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::SignalKind;
use tokio::sync::{watch, RwLock};
use tokio::{select, signal, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Common state for components
#[derive(Clone)]
pub struct AppRuntime {
    pub config: SharedConfig,
    pub metrics_registry: Arc<RwLock<prometheus_client::registry::Registry>>,
    pub cancellation_token: CancellationToken,
}

/// A configuration reference that can be re-seated while the server is running. Readers take a
/// snapshot with [SharedConfig::current] and keep it for the duration of their operation.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<watch::Sender<Arc<AppConfig>>>,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        SharedConfig {
            inner: Arc::new(watch::Sender::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.inner.borrow().clone()
    }

    pub fn replace(&self, config: AppConfig) {
        self.inner.send_replace(Arc::new(config));
    }

    /// Notifies on every [SharedConfig::replace].
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.inner.subscribe()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    /// The base host. Events are served on `<event-tag>.<host>`.
    #[serde(default = "default_host")]
    pub host: String,
    /// The directory containing OVA files for frontends and VM exercises
    #[serde(default = "default_ova_dir")]
    pub ova_dir: PathBuf,
    /// The exercise catalog
    #[serde(default = "default_exercises_file")]
    pub exercises_file: PathBuf,
    /// The durable event catalog. Events are only kept in memory if this is not set.
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
    /// The directory for per-team key logs. Key logging is disabled if this is not set.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// The HMAC key used to sign session tokens
    pub signing_key: String,
    /// The address frontends bind their RDP servers to. Detected from the container runtime if
    /// this is not set.
    #[serde(default)]
    pub docker_host_ip: Option<String>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Memory and CPU settings for frontends, keyed by image
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    #[serde(default = "default_guacd_image")]
    pub guacd_image: String,
    #[serde(default = "default_web_image")]
    pub web_image: String,
    #[serde(default = "default_db_image")]
    pub db_image: String,
    /// The password the gateway administrator is rotated to on startup
    #[serde(default)]
    pub admin_password: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            guacd_image: default_guacd_image(),
            web_image: default_web_image(),
            db_image: default_db_image(),
            admin_password: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ova_dir() -> PathBuf {
    PathBuf::from("./vbox")
}

fn default_exercises_file() -> PathBuf {
    PathBuf::from("./exercises.toml")
}

fn default_guacd_image() -> String {
    "guacamole/guacd:1.2.0".to_string()
}

fn default_web_image() -> String {
    "registry.gitlab.com/haaukins/core-utils/guacamole".to_string()
}

fn default_db_image() -> String {
    "aaunetworksecurity/guacamole-mysql".to_string()
}

pub async fn read_app_config<P: AsRef<Path>>(path: P) -> eyre::Result<AppConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context("unable to read the configuration file")?;
    let config = toml::from_str(&content).context("unable to parse the configuration file")?;
    Ok(config)
}

pub fn create_shutdown_cancellation_token() -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let signal_cancellation_token = cancellation_token.clone();

    spawn(async move {
        let mut signals: Vec<signal::unix::Signal> = [
            signal::unix::signal(SignalKind::terminate()),
            signal::unix::signal(SignalKind::interrupt()),
        ]
        .into_iter()
        .filter_map(|maybe_signal| match maybe_signal {
            Ok(signal) => Some(signal),
            Err(error) => {
                error! {
                    ?error,
                    "unable to listen for shutdown signal"
                }
                None
            }
        })
        .collect();

        let signal_futures = signals.iter_mut().map(|signal| signal.recv().boxed());
        select_all(signal_futures).await;

        info!("shutdown signal received");
        signal_cancellation_token.cancel();
    });
    cancellation_token
}

/// Re-reads the configuration file on SIGHUP. A file that fails to parse leaves the current
/// configuration in place.
pub fn watch_reload_signal(
    path: PathBuf,
    config: SharedConfig,
    cancellation_token: CancellationToken,
) {
    spawn(async move {
        let mut hangup = match signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                error! {
                    ?error,
                    "unable to listen for the reload signal"
                }
                return;
            }
        };

        loop {
            select! {
                _ = cancellation_token.cancelled() => return,
                res = hangup.recv() => {
                    if res.is_none() {
                        return;
                    }
                }
            }

            info!("reload signal received, reading {path:?}");
            match read_app_config(&path).await {
                Ok(new_config) => {
                    config.replace(new_config);
                    info!("configuration reloaded");
                }
                Err(error) => {
                    warn! {
                        ?error,
                        "unable to reload the configuration, keeping the current one"
                    }
                }
            }
        }
    });
}
