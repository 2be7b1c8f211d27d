// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Event lifecycle commands of the control plane.
//!
//! Commands on a whole event are all-or-nothing: a failed [Orchestrator::create_event] leaves
//! nothing in the pool. Commands on the teams of an event report a [TeamProgress] per team and
//! carry on past failures of single teams.

use crate::exercises::ExerciseLibrary;
use crate::pool::EventPool;
use crate::DaemonError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre;
use futures::future::join_all;
use haaukins_common::models::{
    EventConfig, EventStatus, ExerciseConfig, FrontendConfig, LabSpec,
};
use haaukins_common::server::runtime::{AppConfig, GatewayConfig};
use haaukins_common::Tag;
use haaukins_event::gateway::Guacamole;
use haaukins_event::gateway::{Gateway, GatewayError};
use haaukins_event::keylog::KeyLoggerPool;
use haaukins_event::{Catalog, Event, EventError, EventOptions, EventStore};
use haaukins_lab::hub::HubOptions;
use haaukins_lab::metrics::HubMetrics;
use haaukins_lab::{FrontendSettings, Hub, LabBuilder, LabConfig, LabContext};
use haaukins_virtual::container::ContainerRuntime;
use haaukins_virtual::{Closer, InstanceInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Subdomains of the base host that are not available as event tags.
pub const RESERVED_SUBDOMAINS: [&str; 5] = ["docs", "admin", "grpc", "api", "vpn"];

const DEFAULT_AVAILABLE: usize = 5;
const DEFAULT_CAPACITY: usize = 10;
const DEFAULT_DURATION_DAYS: i64 = 15;
const STATUS_OK: &str = "ok";
const STATUS_NO_LAB: &str = "?";

/// Creates the RDP gateway of a new event.
#[async_trait]
pub trait GatewayProvider: Send + Sync {
    async fn gateway(&self, event: &Tag) -> Result<Arc<dyn Gateway>, GatewayError>;
}

/// Gives every event its own Guacamole deployment.
pub struct GuacamoleProvider {
    runtime: Arc<dyn ContainerRuntime>,
    config: GatewayConfig,
}

impl GuacamoleProvider {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: GatewayConfig) -> Self {
        GuacamoleProvider { runtime, config }
    }
}

#[async_trait]
impl GatewayProvider for GuacamoleProvider {
    async fn gateway(&self, event: &Tag) -> Result<Arc<dyn Gateway>, GatewayError> {
        let gateway = Guacamole::new(self.runtime.clone(), self.config.clone()).await?;
        debug!(%event, port = gateway.web_port(), "created gateway");
        Ok(Arc::new(gateway))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreateEventRequest {
    pub tag: String,
    pub name: String,
    /// Zero picks the default of 5
    #[serde(default)]
    pub available: usize,
    /// Zero picks the default of 10
    #[serde(default)]
    pub capacity: usize,
    pub frontends: Vec<FrontendConfig>,
    pub exercises: Vec<String>,
    /// Absent or past dates pick 15 days from now
    #[serde(default)]
    pub finish_expected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub created_by: String,
}

/// The outcome of a per-team command for one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamProgress {
    pub team_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventInfo {
    pub tag: Tag,
    pub name: String,
    pub status: EventStatus,
    pub available: usize,
    pub capacity: usize,
    pub teams: usize,
    pub labs: usize,
    pub exercises: Vec<Tag>,
    pub started_at: DateTime<Utc>,
    pub finish_expected: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamInfo {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
    pub solved: usize,
    pub has_lab: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrontendInfo {
    pub image: String,
    pub size: u64,
    pub memory_mb: u32,
    pub cpu: u32,
}

pub struct OrchestratorOptions {
    pub context: LabContext,
    pub catalog: Arc<dyn Catalog>,
    pub gateways: Arc<dyn GatewayProvider>,
    pub exercises: ExerciseLibrary,
    /// Key logs are written to `<log_dir>/<event-tag>` when set
    pub log_dir: Option<PathBuf>,
    pub signing_key: String,
    pub hub_metrics: HubMetrics,
}

pub struct Orchestrator {
    pool: Arc<EventPool>,
    context: LabContext,
    catalog: Arc<dyn Catalog>,
    gateways: Arc<dyn GatewayProvider>,
    exercises: RwLock<Arc<ExerciseLibrary>>,
    log_dir: Option<PathBuf>,
    signing_key: String,
    hub_metrics: HubMetrics,
    /// Serializes commands that add or remove events
    commands: Mutex<()>,
}

impl Orchestrator {
    pub fn new(pool: Arc<EventPool>, options: OrchestratorOptions) -> Orchestrator {
        Orchestrator {
            pool,
            context: options.context,
            catalog: options.catalog,
            gateways: options.gateways,
            exercises: RwLock::new(Arc::new(options.exercises)),
            log_dir: options.log_dir,
            signing_key: options.signing_key,
            hub_metrics: options.hub_metrics,
            commands: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    fn library(&self) -> Arc<ExerciseLibrary> {
        self.exercises
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_library(&self, library: ExerciseLibrary) {
        *self.exercises.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(library);
    }

    /// Picks up a reloaded configuration. Running events keep the settings they started with.
    pub async fn reload(&self, config: &AppConfig) {
        match ExerciseLibrary::read(&config.exercises_file).await {
            Ok(library) => self.set_library(library),
            Err(error) => {
                warn! {
                    ?error,
                    "unable to reload the exercise catalog, keeping the current one"
                }
            }
        }
        self.pool.set_host(config.host.clone());
        apply_frontend_settings(&self.context.settings, &config.frontends);
    }

    #[instrument(skip_all, fields(event = %request.tag))]
    pub async fn create_event(
        &self,
        request: CreateEventRequest,
    ) -> Result<Arc<Event>, DaemonError> {
        let tag = Tag::new(request.tag)?;
        if RESERVED_SUBDOMAINS.contains(&tag.as_str()) {
            return Err(DaemonError::ReservedDomain(tag));
        }
        let exercise_tags = request
            .exercises
            .into_iter()
            .map(Tag::new)
            .collect::<Result<Vec<Tag>, _>>()?;

        let now = Utc::now();
        let config = EventConfig {
            tag,
            name: request.name,
            available: if request.available == 0 {
                DEFAULT_AVAILABLE
            } else {
                request.available
            },
            capacity: if request.capacity == 0 {
                DEFAULT_CAPACITY
            } else {
                request.capacity
            },
            lab: LabSpec {
                frontends: request.frontends,
                exercises: exercise_tags,
            },
            started_at: now,
            finish_expected: request
                .finish_expected
                .filter(|at| *at > now)
                .unwrap_or(now + Duration::days(DEFAULT_DURATION_DAYS)),
            finished_at: None,
            status: EventStatus::Running,
            secret_key: request.secret_key.filter(|key| !key.trim().is_empty()),
            created_by: request.created_by,
        };
        config.validate()?;
        let exercises = self.library().get(&config.lab.exercises)?;

        let _guard = self.commands.lock().await;
        if self.pool.contains(config.tag.as_str()) {
            return Err(DaemonError::DuplicateEvent(config.tag));
        }

        let store = EventStore::new(config.clone(), self.catalog.clone());
        let event = self.launch(store, exercises).await?;
        if let Err(error) = self.catalog.add_event(&config).await {
            close(&event).await;
            return Err(error.into());
        }
        self.pool.add_event(event.clone())?;
        info!("created event");
        Ok(event)
    }

    /// Builds and starts an event. Nothing of it is left running on failure.
    async fn launch(
        &self,
        store: EventStore,
        exercises: Vec<ExerciseConfig>,
    ) -> Result<Arc<Event>, DaemonError> {
        let config = store.config();
        let gateway = self.gateways.gateway(&config.tag).await?;
        let hub = Hub::new(
            Arc::new(LabBuilder::new(
                self.context.clone(),
                LabConfig {
                    frontends: config.lab.frontends.clone(),
                    exercises,
                },
            )),
            HubOptions::new(config.available, config.capacity),
            config.tag.as_str(),
            self.hub_metrics.clone(),
        );
        let keylogger = match &self.log_dir {
            Some(dir) => KeyLoggerPool::new(dir.join(config.tag.as_str())),
            None => KeyLoggerPool::disabled(),
        };
        let event = Event::new(EventOptions {
            store,
            hub,
            gateway,
            keylogger,
            host_ip: self.context.host_ip.clone(),
            signing_key: self.signing_key.clone(),
        })?;
        if let Err(error) = event.start().await {
            close(&event).await;
            return Err(error.into());
        }
        Ok(event)
    }

    /// Closes the event and archives it under `<tag>-<unix seconds>`.
    #[instrument(skip(self))]
    pub async fn stop_event(&self, tag: &str) -> Result<(), DaemonError> {
        let _guard = self.commands.lock().await;
        let event = self.pool.remove_event(tag)?;
        close(&event).await;
        let archive_tag = Tag::new(format!("{}-{}", event.tag(), Utc::now().timestamp()))?;
        event.finish(&archive_tag).await?;
        info!(archive = %archive_tag, "stopped event");
        Ok(())
    }

    pub async fn suspend_event(&self, tag: &str, suspend: bool) -> Result<(), DaemonError> {
        let event = self.pool.get_event(tag)?;
        if suspend {
            event.suspend().await?;
        } else {
            event.resume().await?;
        }
        Ok(())
    }

    /// The requested teams, or every team of the event in registration order.
    fn team_ids(event: &Event, teams: Option<Vec<String>>) -> Vec<String> {
        teams.unwrap_or_else(|| {
            event
                .store()
                .teams()
                .iter()
                .map(|team| team.id().to_string())
                .collect()
        })
    }

    /// Replaces the instances of an exercise in the labs of `teams`, or of every team.
    pub async fn reset_exercise(
        &self,
        event_tag: &str,
        exercise_tag: &str,
        teams: Option<Vec<String>>,
        progress: &flume::Sender<TeamProgress>,
    ) -> Result<(), DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        for team_id in Self::team_ids(&event, teams) {
            let status = match event.lab(&team_id) {
                None => STATUS_NO_LAB.to_string(),
                Some(lab) => status_of(
                    &team_id,
                    lab.environment().reset_by_tag(exercise_tag).await,
                ),
            };
            report(progress, team_id, status).await;
        }
        Ok(())
    }

    /// Replaces the frontend VMs in the labs of `teams`, or of every team.
    pub async fn reset_frontends(
        &self,
        event_tag: &str,
        teams: Option<Vec<String>>,
        progress: &flume::Sender<TeamProgress>,
    ) -> Result<(), DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        for team_id in Self::team_ids(&event, teams) {
            let status = match event.lab(&team_id) {
                None => STATUS_NO_LAB.to_string(),
                Some(lab) => status_of(&team_id, lab.reset_frontends().await),
            };
            report(progress, team_id, status).await;
        }
        Ok(())
    }

    pub async fn restart_team_lab(&self, event_tag: &str, team_id: &str) -> Result<(), DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        let lab = event
            .lab(team_id)
            .ok_or_else(|| EventError::NoLab(team_id.to_string()))?;
        lab.restart().await?;
        info!(event = %event_tag, team = %team_id, "restarted lab");
        Ok(())
    }

    /// Adds exercises to a running event. Teams with a lab get them right away, the others
    /// when they are assigned one.
    pub async fn add_challenge(
        &self,
        event_tag: &str,
        tags: &[String],
        progress: &flume::Sender<TeamProgress>,
    ) -> Result<(), DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        let tags = tags
            .iter()
            .map(Tag::new)
            .collect::<Result<Vec<Tag>, _>>()?;
        let exercises = self.library().get(&tags)?;

        let existing = event.exercise_tags();
        let duplicates: Vec<Tag> = exercises
            .iter()
            .flat_map(|exercise| exercise.tags.iter())
            .filter(|tag| existing.contains(tag))
            .cloned()
            .collect();
        if !duplicates.is_empty() {
            return Err(DaemonError::ChallengeExists(duplicates));
        }

        event.extend_exercises(&exercises);
        for team in event.store().teams() {
            if event.lab(team.id()).is_none() {
                continue;
            }
            let status = status_of(
                team.id(),
                event.install_exercises(team.id(), &exercises).await,
            );
            report(progress, team.id().to_string(), status).await;
        }
        info!(event = %event_tag, ?tags, "added challenges");
        Ok(())
    }

    /// Events with `status`, or all of them.
    pub fn list_events(&self, status: Option<EventStatus>) -> Vec<EventInfo> {
        self.pool
            .events()
            .iter()
            .filter(|event| status.map_or(true, |status| event.status() == status))
            .map(|event| {
                let config = event.config();
                EventInfo {
                    tag: config.tag,
                    name: config.name,
                    status: config.status,
                    available: config.available,
                    capacity: config.capacity,
                    teams: event.store().team_count(),
                    labs: event.labs().len(),
                    exercises: event.exercise_tags(),
                    started_at: config.started_at,
                    finish_expected: config.finish_expected,
                    created_by: config.created_by,
                }
            })
            .collect()
    }

    pub fn list_event_teams(&self, event_tag: &str) -> Result<Vec<TeamInfo>, DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        Ok(event
            .store()
            .teams()
            .iter()
            .map(|team| {
                let record = team.record();
                TeamInfo {
                    has_lab: event.lab(&record.id).is_some(),
                    solved: record.solved.len(),
                    id: record.id,
                    name: record.name,
                    email: record.email,
                    created_at: record.created_at,
                    last_access: record.last_access,
                }
            })
            .collect())
    }

    /// The containers and VMs of a team's lab.
    pub async fn get_team_info(
        &self,
        event_tag: &str,
        team_id: &str,
    ) -> Result<Vec<InstanceInfo>, DaemonError> {
        let event = self.pool.get_event(event_tag)?;
        event.store().team(team_id)?;
        let lab = event
            .lab(team_id)
            .ok_or_else(|| EventError::NoLab(team_id.to_string()))?;
        Ok(lab.instance_info().await)
    }

    /// The OVA images available as frontends, with the settings new frontends get.
    pub async fn list_frontends(&self) -> Result<Vec<FrontendInfo>, DaemonError> {
        let mut frontends = Vec::new();
        let mut entries = tokio::fs::read_dir(self.context.library.dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |extension| extension != "ova") {
                continue;
            }
            let Some(image) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let settings = self.context.settings.apply(&FrontendConfig {
                image: image.to_string(),
                memory_mb: 0,
                cpu: 0,
            });
            frontends.push(FrontendInfo {
                image: settings.image,
                size: entry.metadata().await?.len(),
                memory_mb: settings.memory_mb,
                cpu: settings.cpu,
            });
        }
        frontends.sort_by(|a, b| a.image.cmp(&b.image));
        Ok(frontends)
    }

    pub async fn set_frontend_memory(&self, image: &str, memory_mb: u32) -> Result<(), DaemonError> {
        self.known_frontend(image).await?;
        self.context.settings.set_memory(image, memory_mb);
        info!(image, memory_mb, "updated frontend memory");
        Ok(())
    }

    pub async fn set_frontend_cpu(&self, image: &str, cpu: u32) -> Result<(), DaemonError> {
        self.known_frontend(image).await?;
        self.context.settings.set_cpu(image, cpu);
        info!(image, cpu, "updated frontend cpu");
        Ok(())
    }

    async fn known_frontend(&self, image: &str) -> Result<(), DaemonError> {
        if !image.ends_with(".ova") || !self.context.library.is_available(image).await {
            return Err(DaemonError::UnknownFrontend(image.to_string()));
        }
        Ok(())
    }

    /// Brings back the unfinished events of the catalog with their teams. Events that fail to
    /// come back are marked as errored.
    pub async fn reconcile(&self) -> Result<(), DaemonError> {
        let configs = self.catalog.unfinished_events().await?;
        for config in configs {
            let tag = config.tag.clone();
            if config.status == EventStatus::Booked {
                info!(event = %tag, "skipping booked event");
                continue;
            }
            match self.restore(config).await {
                Ok(event) => {
                    info! {
                        event = %tag,
                        teams = event.store().team_count(),
                        "restored event"
                    }
                }
                Err(error) => {
                    warn!(?error, event = %tag, "unable to restore event");
                    if let Err(error) = self
                        .catalog
                        .update_event_status(&tag, EventStatus::Error)
                        .await
                    {
                        warn!(?error, event = %tag, "unable to mark event as errored");
                    }
                }
            }
        }
        Ok(())
    }

    async fn restore(&self, config: EventConfig) -> Result<Arc<Event>, DaemonError> {
        let exercises = self.library().get(&config.lab.exercises)?;
        let suspended = config.status == EventStatus::Suspended;
        let store = EventStore::load(config, self.catalog.clone()).await?;

        let _guard = self.commands.lock().await;
        if self.pool.contains(store.tag().as_str()) {
            return Err(DaemonError::DuplicateEvent(store.tag()));
        }
        let event = self.launch(store, exercises).await?;
        if suspended {
            if let Err(error) = event.suspend().await {
                close(&event).await;
                return Err(error.into());
            }
        }
        self.pool.add_event(event.clone())?;
        Ok(event)
    }
}

#[async_trait]
impl Closer for Orchestrator {
    /// Closes every event without finishing it, so they come back on the next start.
    async fn close(&self) -> eyre::Result<()> {
        let _guard = self.commands.lock().await;
        let events = self.pool.drain();
        join_all(events.iter().map(close)).await;
        info!(events = events.len(), "closed events");
        Ok(())
    }
}

async fn close(event: &Arc<Event>) {
    if let Err(error) = event.close().await {
        warn!(?error, event = %event.tag(), "unable to close event");
    }
}

fn status_of<E: std::fmt::Debug + std::fmt::Display>(team_id: &str, res: Result<(), E>) -> String {
    match res {
        Ok(()) => STATUS_OK.to_string(),
        Err(error) => {
            warn!(?error, team = %team_id, "team command failed");
            error.to_string()
        }
    }
}

async fn report(progress: &flume::Sender<TeamProgress>, team_id: String, status: String) {
    if progress
        .send_async(TeamProgress { team_id, status })
        .await
        .is_err()
    {
        debug!("progress receiver is gone");
    }
}

/// Applies the memory and CPU settings of the configuration. Zero values are left alone.
pub fn apply_frontend_settings(settings: &FrontendSettings, frontends: &[FrontendConfig]) {
    for frontend in frontends {
        if frontend.memory_mb > 0 {
            settings.set_memory(&frontend.image, frontend.memory_mb);
        }
        if frontend.cpu > 0 {
            settings.set_cpu(&frontend.image, frontend.cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_request, drain, test_orchestrator, test_orchestrator_with};
    use haaukins_event::testing::{event_config, quick_team, wait_for_queued};
    use haaukins_event::{MemoryCatalog, StoreError};
    use haaukins_lab::HubError;
    use haaukins_virtual::InstanceKind;
    use std::collections::HashSet;

    async fn assign(event: &Event, name: &str) -> Arc<haaukins_event::Team> {
        let team = event.store().save_team(quick_team(name)).await.unwrap();
        event.assign_next(&team).await.unwrap();
        team
    }

    #[tokio::test]
    async fn should_bind_a_prebuilt_lab_to_the_first_team() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 1).await;

        let t1 = assign(&event, "t1").await;

        let gateway = test.gateways.of("demo");
        let names: Vec<String> = gateway.connections().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec![format!("{}-client1", t1.id())]);
        let challenges = t1.challenges();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].tag.as_str(), "ftp");
        assert!(challenges[0].value.starts_with("HKN{"));
        assert!(test.orchestrator.pool().route("demo.localhost").is_some());

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_refuse_teams_beyond_capacity() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 2, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 2).await;

        assign(&event, "t1").await;
        assign(&event, "t2").await;
        assert!(matches!(
            event.store().save_team(quick_team("t3")).await,
            Err(StoreError::CapacityReached)
        ));
        assert!(matches!(event.hub().get(), Err(HubError::MaxLabs)));
        assert_eq!(event.labs().len(), 2);
        assert_eq!(event.store().team_count(), 2);

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reset_an_exercise_for_one_team() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["sql"], 2, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 2).await;
        let t1 = assign(&event, "t1").await;
        let t2 = assign(&event, "t2").await;

        let sql_ids = |lab: Arc<haaukins_lab::Lab>| async move {
            lab.environment()
                .instance_info()
                .await
                .into_iter()
                .filter(|info| info.kind == InstanceKind::Docker && info.image == "aau/sql")
                .map(|info| info.id)
                .collect::<Vec<String>>()
        };
        let t1_lab = event.lab(t1.id()).unwrap();
        let t2_lab = event.lab(t2.id()).unwrap();
        let t1_before = sql_ids(t1_lab.clone()).await;
        let t2_before = sql_ids(t2_lab.clone()).await;
        let records_before = t1_lab.environment().dns_records().await;

        let (tx, rx) = flume::unbounded();
        test.orchestrator
            .reset_exercise("demo", "sql", Some(vec![t1.id().to_string()]), &tx)
            .await
            .unwrap();

        assert_eq!(
            drain(&rx),
            vec![TeamProgress {
                team_id: t1.id().to_string(),
                status: "ok".to_string(),
            }]
        );
        let t1_after = sql_ids(t1_lab.clone()).await;
        assert_eq!(t1_after.len(), t1_before.len());
        assert!(t1_after.iter().all(|id| !t1_before.contains(id)));
        assert_eq!(sql_ids(t2_lab).await, t2_before);
        assert_eq!(t1_lab.environment().dns_records().await, records_before);

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_report_every_team_on_reset() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 1).await;
        let t1 = assign(&event, "t1").await;
        let t2 = event.store().save_team(quick_team("t2")).await.unwrap();

        let (tx, rx) = flume::unbounded();
        test.orchestrator
            .reset_exercise("demo", "ftp", None, &tx)
            .await
            .unwrap();
        test.orchestrator
            .reset_exercise("demo", "xss", Some(vec![t1.id().to_string()]), &tx)
            .await
            .unwrap();
        test.orchestrator
            .reset_frontends("demo", None, &tx)
            .await
            .unwrap();

        let progress = drain(&rx);
        let statuses: Vec<(&str, &str)> = progress
            .iter()
            .map(|p| (p.team_id.as_str(), p.status.as_str()))
            .collect();
        assert_eq!(statuses[0], (t1.id(), "ok"));
        assert_eq!(statuses[1], (t2.id(), "?"));
        assert_eq!(statuses[2], (t1.id(), "unknown tag xss"));
        assert_eq!(statuses[3], (t1.id(), "ok"));
        assert_eq!(statuses[4], (t2.id(), "?"));

        assert!(matches!(
            test.orchestrator
                .reset_exercise("missing", "ftp", None, &tx)
                .await,
            Err(DaemonError::UnknownEvent(_))
        ));
        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_hold_registrations_while_suspended() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 1).await;

        test.orchestrator.suspend_event("demo", true).await.unwrap();
        assert_eq!(event.status(), EventStatus::Suspended);
        assert!(matches!(event.hub().get(), Err(HubError::Suspended)));

        let team = event.store().save_team(quick_team("t1")).await.unwrap();
        let pending = {
            let event = event.clone();
            let team = team.clone();
            tokio::spawn(async move {
                let lab = event.hub().next().await.unwrap();
                event.assign_lab(&team, lab).await.unwrap();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        test.orchestrator.suspend_event("demo", false).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(10), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status(), EventStatus::Running);
        assert!(event.lab(team.id()).is_some());

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_issue_distinct_flags_to_many_teams() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 10, 100))
            .await
            .unwrap();

        let mut flags = HashSet::new();
        for i in 0..100 {
            let team = event
                .store()
                .save_team(quick_team(&format!("team{i}")))
                .await
                .unwrap();
            let lab = event.hub().next().await.unwrap();
            event.assign_lab(&team, lab).await.unwrap();
            flags.insert(team.challenges()[0].value.clone());
        }
        assert_eq!(flags.len(), 100);

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_apply_defaults_when_creating_events() {
        let test = test_orchestrator();
        let mut request = create_request("demo", &["ftp"], 0, 0);
        request.finish_expected = Some(Utc::now() - Duration::days(1));
        request.secret_key = Some(" ".to_string());
        let event = test.orchestrator.create_event(request).await.unwrap();

        let config = event.config();
        assert_eq!(config.available, 5);
        assert_eq!(config.capacity, 10);
        assert!(config.finish_expected > Utc::now() + Duration::days(14));
        assert!(config.secret_key.is_none());
        assert!(test.gateways.of("demo").started());

        let stored = test.catalog.unfinished_events().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].tag.as_str(), "demo");

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_invalid_events() {
        let test = test_orchestrator();
        let orchestrator = &test.orchestrator;

        assert!(matches!(
            orchestrator
                .create_event(create_request("admin", &["ftp"], 1, 1))
                .await,
            Err(DaemonError::ReservedDomain(_))
        ));
        assert!(matches!(
            orchestrator
                .create_event(create_request("Demo!", &["ftp"], 1, 1))
                .await,
            Err(DaemonError::Validation(_))
        ));
        assert!(matches!(
            orchestrator
                .create_event(create_request("demo", &["xss"], 1, 1))
                .await,
            Err(DaemonError::UnknownExercise(_))
        ));
        assert!(matches!(
            orchestrator
                .create_event(create_request("demo", &["ftp"], 3, 2))
                .await,
            Err(DaemonError::Validation(_))
        ));

        orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator
                .create_event(create_request("demo", &["ftp"], 1, 1))
                .await,
            Err(DaemonError::DuplicateEvent(_))
        ));

        orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_leave_nothing_behind_when_the_gateway_fails() {
        let test = test_orchestrator();
        test.gateways.fail_start();

        let res = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await;

        assert!(matches!(
            res,
            Err(DaemonError::Event(EventError::StartingGateway(_)))
        ));
        assert!(!test.orchestrator.pool().contains("demo"));
        assert!(test.catalog.unfinished_events().await.unwrap().is_empty());
        assert_eq!(test.gateways.of("demo").closed(), 1);
    }

    #[tokio::test]
    async fn should_archive_stopped_events() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();

        test.orchestrator.stop_event("demo").await.unwrap();

        assert!(!test.orchestrator.pool().contains("demo"));
        assert_eq!(event.status(), EventStatus::Closed);
        assert_eq!(event.hub().status(), haaukins_lab::HubStatus::Closed);
        assert!(test.catalog.unfinished_events().await.unwrap().is_empty());
        assert!(matches!(
            test.orchestrator.stop_event("demo").await,
            Err(DaemonError::UnknownEvent(_))
        ));

        test.orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_restart_team_labs() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 1).await;
        let t1 = assign(&event, "t1").await;
        let t2 = event.store().save_team(quick_team("t2")).await.unwrap();

        test.orchestrator
            .restart_team_lab("demo", t1.id())
            .await
            .unwrap();
        assert!(matches!(
            test.orchestrator.restart_team_lab("demo", t2.id()).await,
            Err(DaemonError::Event(EventError::NoLab(_)))
        ));

        let info = test
            .orchestrator
            .get_team_info("demo", t1.id())
            .await
            .unwrap();
        assert!(info.iter().any(|i| i.image == "aau/ftp"));
        assert!(info.iter().any(|i| i.kind == InstanceKind::Vbox));
        assert!(matches!(
            test.orchestrator.get_team_info("demo", "missing").await,
            Err(DaemonError::Store(_))
        ));

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_add_challenges_to_running_events() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 2))
            .await
            .unwrap();
        wait_for_queued(event.hub(), 1).await;
        let t1 = assign(&event, "t1").await;

        let (tx, rx) = flume::unbounded();
        test.orchestrator
            .add_challenge("demo", &["sql".to_string()], &tx)
            .await
            .unwrap();

        assert_eq!(
            drain(&rx),
            vec![TeamProgress {
                team_id: t1.id().to_string(),
                status: "ok".to_string(),
            }]
        );
        assert!(t1.has_challenge(&Tag::new("sql").unwrap()));

        let t2 = event.store().save_team(quick_team("t2")).await.unwrap();
        let lab = event.hub().next().await.unwrap();
        event.assign_lab(&t2, lab).await.unwrap();
        assert!(t2.has_challenge(&Tag::new("sql").unwrap()));

        assert!(matches!(
            test.orchestrator
                .add_challenge("demo", &["sql".to_string()], &tx)
                .await,
            Err(DaemonError::ChallengeExists(_))
        ));
        assert!(matches!(
            test.orchestrator
                .add_challenge("demo", &["xss".to_string()], &tx)
                .await,
            Err(DaemonError::UnknownExercise(_))
        ));

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_list_events_and_teams() {
        let test = test_orchestrator();
        let event = test
            .orchestrator
            .create_event(create_request("demo", &["ftp"], 1, 1))
            .await
            .unwrap();
        test.orchestrator
            .create_event(create_request("other", &["sql"], 1, 1))
            .await
            .unwrap();
        test.orchestrator.suspend_event("other", true).await.unwrap();
        wait_for_queued(event.hub(), 1).await;
        let t1 = assign(&event, "t1").await;

        let all = test.orchestrator.list_events(None);
        let tags: Vec<&str> = all.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["demo", "other"]);
        assert_eq!(all[0].teams, 1);
        assert_eq!(all[0].labs, 1);

        let suspended = test
            .orchestrator
            .list_events(Some(EventStatus::Suspended));
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].tag.as_str(), "other");

        let teams = test.orchestrator.list_event_teams("demo").unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].id, t1.id());
        assert_eq!(teams[0].email, "t1@example.org");
        assert!(teams[0].has_lab);
        assert!(matches!(
            test.orchestrator.list_event_teams("missing"),
            Err(DaemonError::UnknownEvent(_))
        ));

        test.orchestrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_manage_frontend_settings() {
        let test = test_orchestrator();
        std::fs::write(test.drivers.dir.path().join("notes.txt"), b"x").unwrap();

        let frontends = test.orchestrator.list_frontends().await.unwrap();
        assert_eq!(
            frontends,
            vec![FrontendInfo {
                image: "kali.ova".to_string(),
                size: 4,
                memory_mb: 0,
                cpu: 0,
            }]
        );

        test.orchestrator
            .set_frontend_memory("kali.ova", 4096)
            .await
            .unwrap();
        test.orchestrator.set_frontend_cpu("kali.ova", 2).await.unwrap();
        let frontends = test.orchestrator.list_frontends().await.unwrap();
        assert_eq!(frontends[0].memory_mb, 4096);
        assert_eq!(frontends[0].cpu, 2);

        assert!(matches!(
            test.orchestrator.set_frontend_memory("win10.ova", 1024).await,
            Err(DaemonError::UnknownFrontend(_))
        ));
        assert!(matches!(
            test.orchestrator.set_frontend_cpu("notes.txt", 1).await,
            Err(DaemonError::UnknownFrontend(_))
        ));
    }

    #[tokio::test]
    async fn should_restore_unfinished_events_with_their_teams() {
        let catalog = Arc::new(MemoryCatalog::default());
        let config = event_config("demo", 1, 2);
        catalog.add_event(&config).await.unwrap();
        let team = quick_team("alpha");
        catalog.add_team(&config.tag, &team.record()).await.unwrap();

        let mut suspended = event_config("paused", 1, 1);
        suspended.status = EventStatus::Suspended;
        catalog.add_event(&suspended).await.unwrap();

        let mut broken = event_config("broken", 1, 1);
        broken.lab.exercises = vec![Tag::new("xss").unwrap()];
        catalog.add_event(&broken).await.unwrap();

        let test = test_orchestrator_with(catalog.clone());
        test.orchestrator.reconcile().await.unwrap();

        let event = test.orchestrator.pool().get_event("demo").unwrap();
        assert!(event.lab(team.id()).is_some());
        assert_eq!(test.gateways.of("demo").users().len(), 1);

        let paused = test.orchestrator.pool().get_event("paused").unwrap();
        assert_eq!(paused.status(), EventStatus::Suspended);

        assert!(!test.orchestrator.pool().contains("broken"));
        let stored = catalog.unfinished_events().await.unwrap();
        let broken = stored.iter().find(|c| c.tag.as_str() == "broken").unwrap();
        assert_eq!(broken.status, EventStatus::Error);

        test.orchestrator.close().await.unwrap();
        assert!(test.orchestrator.pool().events().is_empty());
        assert_eq!(catalog.unfinished_events().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn should_reload_the_exercise_catalog_and_host() {
        let test = test_orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exercises.toml");
        std::fs::write(
            &path,
            r#"
            [[exercises]]
            tags = ["xss"]
            name = "Cross-site scripting"

            [[exercises.instances]]
            image = "aau/xss"
            "#,
        )
        .unwrap();
        let mut config: AppConfig = toml::from_str(r#"signing_key = "key""#).unwrap();
        config.host = "ntp-event.dk".to_string();
        config.exercises_file = path;
        config.frontends = vec![FrontendConfig {
            image: "kali.ova".to_string(),
            memory_mb: 2048,
            cpu: 0,
        }];

        test.orchestrator.reload(&config).await;

        assert_eq!(test.orchestrator.pool().host(), "ntp-event.dk");
        assert_eq!(test.orchestrator.library().len(), 1);
        assert!(test
            .orchestrator
            .library()
            .get(&[Tag::new("xss").unwrap()])
            .is_ok());
        let frontends = test.orchestrator.list_frontends().await.unwrap();
        assert_eq!(frontends[0].memory_mb, 2048);

        config.exercises_file = dir.path().join("missing.toml");
        test.orchestrator.reload(&config).await;
        assert_eq!(test.orchestrator.library().len(), 1);
    }
}
