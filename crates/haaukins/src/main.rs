// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use clap::Parser;
use color_eyre::eyre;
use haaukins_common::server::runtime::{
    create_shutdown_cancellation_token, read_app_config, watch_reload_signal, AppRuntime,
    SharedConfig,
};
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod args;
#[cfg(feature = "metrics")]
mod metrics;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = args::Args::parse();
    let config_file = PathBuf::from(&args.config_file);
    let app_config = read_app_config(&config_file).await?;

    let runtime = AppRuntime {
        config: SharedConfig::new(app_config),
        metrics_registry: Arc::new(RwLock::new(Registry::default())),
        cancellation_token: create_shutdown_cancellation_token(),
    };
    watch_reload_signal(
        config_file,
        runtime.config.clone(),
        runtime.cancellation_token.clone(),
    );

    info!("starting components");
    let mut set = JoinSet::new();

    #[cfg(feature = "daemon")]
    if args.components.enable_daemon || args.components.single {
        set.spawn(haaukins_daemon::main(runtime.clone(), args.daemon));
    }
    #[cfg(feature = "metrics")]
    if args.components.enable_metrics || args.components.single {
        set.spawn(metrics::main(runtime.clone(), args.metrics));
    }

    if set.is_empty() {
        warn!("no components enabled, see --help for a list of components");
        warn!("hint: use --single to enable the default components for a simple setup");
    }

    while let Some(res) = set.join_next().await {
        if let Err(error) = res? {
            runtime.cancellation_token.cancel();
            return Err(error);
        }
    }

    Ok(())
}
