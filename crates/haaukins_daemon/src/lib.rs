// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! The daemon: runs the events, routes their subdomains and carries out control plane commands.

pub mod config;
pub mod exercises;
mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
mod server;
#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::exercises::ExerciseLibrary;
use crate::metrics::RouterMetrics;
use crate::orchestrator::{apply_frontend_settings, GuacamoleProvider, Orchestrator};
use crate::pool::EventPool;
use crate::server::Ingress;
use color_eyre::eyre;
use color_eyre::eyre::Context;
use haaukins_common::server::runtime::AppRuntime;
use haaukins_common::{Tag, ValidationError};
use haaukins_event::gateway::GatewayError;
use haaukins_event::{Catalog, EventError, JsonFileCatalog, MemoryCatalog, StoreError};
use haaukins_lab::metrics::HubMetrics;
use haaukins_lab::{FrontendSettings, LabContext, LabError};
use haaukins_virtual::container::{ContainerRuntime, DockerCli};
use haaukins_virtual::vm::{VBoxManage, VmLibrary};
use haaukins_virtual::Closer;
use std::net::SocketAddr;
use std::ops::DerefMut;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::{select, spawn};
use tracing::info;

pub use monitor::{monitor_host, HostUsage};
pub use orchestrator::{CreateEventRequest, TeamProgress};

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("Event with that tag already exists")]
    DuplicateEvent(Tag),
    #[error("Unable to find event by that tag: {0}")]
    UnknownEvent(String),
    #[error("Reserved sub domain, change event tag: {0}")]
    ReservedDomain(Tag),
    #[error("unknown exercise {0}")]
    UnknownExercise(Tag),
    #[error("exercise tag {0} is used by more than one exercise")]
    DuplicateExercise(Tag),
    #[error("exercise {0} has no tags")]
    MissingTags(String),
    #[error("challenges {0:?} already exist on the event")]
    ChallengeExists(Vec<Tag>),
    #[error("unknown frontend {0}")]
    UnknownFrontend(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lab(#[from] LabError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid exercise catalog: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unable to read host statistics from {0}")]
    HostStats(&'static str),
}

pub async fn main(runtime: AppRuntime, config: Config) -> eyre::Result<()> {
    info!("starting daemon");

    let app = runtime.config.current();
    let addr: SocketAddr = config
        .http_listen
        .parse()
        .context("unable to parse the listening address")?;

    let catalog: Arc<dyn Catalog> = match &app.catalog_file {
        Some(path) => Arc::new(
            JsonFileCatalog::open(path)
                .await
                .context("unable to open the event catalog")?,
        ),
        None => {
            info!("no catalog file configured, events are kept in memory");
            Arc::new(MemoryCatalog::default())
        }
    };
    let exercises = ExerciseLibrary::read(&app.exercises_file)
        .await
        .context("unable to read the exercise catalog")?;

    let docker: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new());
    let host_ip = match &app.docker_host_ip {
        Some(host_ip) => host_ip.clone(),
        None => docker
            .host_ip()
            .await
            .context("unable to detect the docker host address")?,
    };
    let settings = FrontendSettings::default();
    apply_frontend_settings(&settings, &app.frontends);
    let context = LabContext {
        runtime: docker.clone(),
        library: Arc::new(VmLibrary::new(Arc::new(VBoxManage::new()), &app.ova_dir)),
        host_ip,
        settings,
    };

    let hub_metrics = HubMetrics::default();
    let router_metrics = RouterMetrics::default();
    {
        let mut registry = runtime.metrics_registry.write().await;
        hub_metrics.register(registry.deref_mut());
        router_metrics.register(registry.deref_mut());
    }

    let pool = Arc::new(EventPool::new(app.host.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        orchestrator::OrchestratorOptions {
            context,
            catalog,
            gateways: Arc::new(GuacamoleProvider::new(docker, app.gateway.clone())),
            exercises,
            log_dir: app.log_dir.clone(),
            signing_key: app.signing_key.clone(),
            hub_metrics,
        },
    ));
    orchestrator
        .reconcile()
        .await
        .context("unable to restore events from the catalog")?;

    let reloads = orchestrator.clone();
    let mut changes = runtime.config.subscribe();
    let reload_cancellation_token = runtime.cancellation_token.clone();
    spawn(async move {
        loop {
            select! {
                _ = reload_cancellation_token.cancelled() => return,
                res = changes.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            let config = changes.borrow_and_update().clone();
            reloads.reload(&config).await;
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .context("unable to start the http server, is the port taken?")?;
    info!("listening on {addr:?}");

    let res = server::serve(
        listener,
        Ingress {
            pool,
            metrics: router_metrics,
        },
        runtime.cancellation_token.clone(),
    )
    .await;
    orchestrator.close().await?;
    res
}
