// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::gateway::{Gateway, GatewayError, GatewayUser, GatewayUserStore, RdpConnection};
use crate::keylog::KeyLoggerPool;
use crate::store::{EventStore, StoreError};
use crate::team::Team;
use crate::EventError;
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::join_all;
use haaukins_common::models::{EventConfig, EventStatus, ExerciseConfig};
use haaukins_common::Tag;
use haaukins_lab::{Hub, HubError, Lab};
use haaukins_virtual::{Closer, InstanceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const SUSPEND_TIMEOUT: Duration = Duration::from_secs(30);
const LAB_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventOptions {
    pub store: EventStore,
    pub hub: Hub,
    pub gateway: Arc<dyn Gateway>,
    pub keylogger: KeyLoggerPool,
    /// The address the gateway reaches frontends on
    pub host_ip: String,
    /// The key session tokens are signed with
    pub signing_key: String,
}

/// A running event. Teams get a lab from the hub the first time they need one, and keep it until
/// the event closes.
pub struct Event {
    store: EventStore,
    hub: Hub,
    gateway: Arc<dyn Gateway>,
    users: GatewayUserStore,
    keylogger: KeyLoggerPool,
    host_ip: String,
    signing_key: String,
    http: reqwest::Client,
    labs: RwLock<HashMap<String, Arc<Lab>>>,
    /// Exercises added after the event was created
    extra_exercises: RwLock<Vec<ExerciseConfig>>,
    assigning: Mutex<()>,
    closed: AtomicBool,
}

impl Event {
    pub fn new(options: EventOptions) -> Result<Arc<Event>, EventError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(GatewayError::Http)?;
        Ok(Arc::new(Event {
            store: options.store,
            hub: options.hub,
            gateway: options.gateway,
            users: GatewayUserStore::default(),
            keylogger: options.keylogger,
            host_ip: options.host_ip,
            signing_key: options.signing_key,
            http,
            labs: RwLock::new(HashMap::new()),
            extra_exercises: RwLock::new(Vec::new()),
            assigning: Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn tag(&self) -> Tag {
        self.store.tag()
    }

    pub fn config(&self) -> EventConfig {
        self.store.config()
    }

    pub fn status(&self) -> EventStatus {
        self.store.status()
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub(crate) fn signing_key(&self) -> &str {
        &self.signing_key
    }

    pub(crate) fn keylogger(&self) -> &KeyLoggerPool {
        &self.keylogger
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Starts the gateway and hands a lab to every team already registered.
    #[instrument(skip_all, fields(event = %self.tag()))]
    pub async fn start(&self) -> Result<(), EventError> {
        self.gateway
            .start()
            .await
            .map_err(EventError::StartingGateway)?;

        let _guard = self.assigning.lock().await;
        for team in self.store.teams() {
            if self.lab(team.id()).is_some() {
                continue;
            }
            let lab = self.wait_for_lab().await?;
            self.assign_lab(&team, lab).await?;
        }
        info!(teams = self.store.team_count(), "started event");
        Ok(())
    }

    async fn wait_for_lab(&self) -> Result<Lab, EventError> {
        loop {
            match self.hub.get() {
                Ok(lab) => return Ok(lab),
                Err(HubError::NoAvailableLabs | HubError::Suspended) => {}
                Err(error) => return Err(error.into()),
            }
            select! {
                lab = self.hub.next() => return lab.ok_or(EventError::Closed),
                _ = tokio::time::sleep(LAB_POLL_INTERVAL) => {}
            }
        }
    }

    /// Binds `lab` to `team`: a gateway user for the team, an RDP connection per frontend, and
    /// the lab's challenges on the team. The lab is closed if any step fails.
    #[instrument(skip_all, fields(team = %team.id(), lab = %lab.tag()))]
    pub async fn assign_lab(&self, team: &Team, lab: Lab) -> Result<(), EventError> {
        let lab = Arc::new(lab);
        if let Err(error) = self.bind_lab(team, &lab).await {
            if let Err(error) = lab.close().await {
                warn!(?error, "unable to close unassigned lab");
            }
            return Err(error);
        }
        info!("assigned lab");
        Ok(())
    }

    async fn bind_lab(&self, team: &Team, lab: &Arc<Lab>) -> Result<(), EventError> {
        let ports = lab.rdp_conn_ports().await;
        if ports.is_empty() {
            return Err(EventError::RdpConf);
        }

        let extra = self.extra_exercises().clone();
        install_missing(lab, &extra).await?;

        let user = GatewayUser {
            username: team.name().to_string(),
            password: team.hashed_password().to_string(),
        };
        self.gateway.create_user(&user).await?;
        self.users.create_user_for_team(team.id(), user.clone());

        for (i, port) in ports.into_iter().enumerate() {
            let conn = RdpConnection {
                name: format!("{}-client{}", team.id(), i + 1),
                host: self.host_ip.clone(),
                port,
                gateway_user: user.username.clone(),
                enable_wallpaper: true,
                ..Default::default()
            };
            self.gateway.create_rdp_conn(&conn).await?;
        }

        self.issue_challenges(team, lab).await?;
        self.labs_mut().insert(team.id().to_string(), lab.clone());
        Ok(())
    }

    async fn issue_challenges(&self, team: &Team, lab: &Lab) -> Result<(), EventError> {
        for challenge in lab.environment().challenges().await {
            if team.has_challenge(&challenge.tag) {
                continue;
            }
            team.add_challenge(&challenge)?;
        }
        self.store.notify();
        Ok(())
    }

    /// Hands the next queued lab to `team` unless it already has one.
    pub async fn assign_next(&self, team: &Team) -> Result<(), EventError> {
        let _guard = self.assigning.lock().await;
        if self.lab(team.id()).is_some() {
            return Ok(());
        }
        let lab = self.hub.get()?;
        self.assign_lab(team, lab).await
    }

    /// Logs the team's gateway user in and returns the token document for the gateway's web
    /// client.
    pub async fn gateway_login(&self, team: &Team) -> Result<String, EventError> {
        self.assign_next(team).await?;
        let user = self.users.get_user_for_team(team.id())?;
        Ok(self.gateway.raw_login(&user).await?)
    }

    pub fn lab(&self, team_id: &str) -> Option<Arc<Lab>> {
        self.labs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(team_id)
            .cloned()
    }

    /// Assigned labs by team id.
    pub fn labs(&self) -> Vec<(String, Arc<Lab>)> {
        self.labs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(team, lab)| (team.clone(), lab.clone()))
            .collect()
    }

    fn labs_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Lab>>> {
        self.labs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn extra_exercises(&self) -> std::sync::RwLockReadGuard<'_, Vec<ExerciseConfig>> {
        self.extra_exercises
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tags of the exercises the event was created with and of those added since.
    pub fn exercise_tags(&self) -> Vec<Tag> {
        let mut tags = self.config().lab.exercises;
        for exercise in self.extra_exercises().iter() {
            tags.extend(exercise.tags.iter().cloned());
        }
        tags
    }

    /// Records exercises that labs assigned from now on receive on assignment.
    pub fn extend_exercises(&self, exercises: &[ExerciseConfig]) {
        self.extra_exercises
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(exercises);
    }

    /// Adds exercises to the lab of a team and issues their challenges to the team.
    pub async fn install_exercises(
        &self,
        team_id: &str,
        exercises: &[ExerciseConfig],
    ) -> Result<(), EventError> {
        let team = self.store.team(team_id)?;
        let lab = self
            .lab(team_id)
            .ok_or_else(|| EventError::NoLab(team_id.to_string()))?;
        install_missing(&lab, exercises).await?;
        self.issue_challenges(&team, &lab).await
    }

    fn team_lab(&self, team: &Team) -> Result<Arc<Lab>, EventError> {
        self.lab(team.id())
            .ok_or_else(|| EventError::NoLab(team.id().to_string()))
    }

    /// Resets the exercise behind `tag` in the team's lab. A challenge the team had stopped runs
    /// again afterwards.
    #[instrument(skip(self, team), fields(team = %team.id()))]
    pub async fn reset_challenge(&self, team: &Team, tag: &str) -> Result<(), EventError> {
        let lab = self.team_lab(team)?;
        lab.environment().reset_by_tag(tag).await?;
        team.set_challenge_stopped(tag, false);
        Ok(())
    }

    /// Stops the exercise behind `tag` in the team's lab, or starts it again if the team stopped
    /// it before. Returns whether the exercise is running now.
    #[instrument(skip(self, team), fields(team = %team.id()))]
    pub async fn toggle_challenge(&self, team: &Team, tag: &str) -> Result<bool, EventError> {
        let lab = self.team_lab(team)?;
        let running = if team.challenge_stopped(tag) {
            lab.environment().start_by_tag(tag).await?;
            true
        } else {
            lab.environment().stop_by_tag(tag).await?;
            false
        };
        team.set_challenge_stopped(tag, !running);
        Ok(running)
    }

    /// Gives the team fresh frontend VMs. The gateway connections stay as they are.
    #[instrument(skip_all, fields(team = %team.id()))]
    pub async fn reset_team_frontends(&self, team: &Team) -> Result<(), EventError> {
        self.team_lab(team)?.reset_frontends().await?;
        Ok(())
    }

    /// Resumes the team's lab if any of its instances is suspended.
    pub async fn resume_team_lab(&self, team: &Team) -> Result<(), EventError> {
        let Some(lab) = self.lab(team.id()) else {
            return Ok(());
        };
        let suspended = lab
            .instance_info()
            .await
            .iter()
            .any(|info| info.state == InstanceState::Suspended);
        if suspended {
            lab.resume().await?;
            info!(team = %team.id(), "resumed team lab");
        }
        Ok(())
    }

    /// Stops lab builds and pauses the labs of every team.
    #[instrument(skip_all, fields(event = %self.tag()))]
    pub async fn suspend(&self) -> Result<(), EventError> {
        self.hub.suspend(SUSPEND_TIMEOUT).await;
        let labs = self.labs();
        for ((team, _), result) in labs
            .iter()
            .zip(join_all(labs.iter().map(|(_, lab)| lab.suspend())).await)
        {
            if let Err(error) = result {
                warn!(?error, %team, "unable to suspend lab");
            }
        }
        self.store.set_status(EventStatus::Suspended).await?;
        info!("suspended event");
        Ok(())
    }

    #[instrument(skip_all, fields(event = %self.tag()))]
    pub async fn resume(&self) -> Result<(), EventError> {
        let labs = self.labs();
        for ((team, _), result) in labs
            .iter()
            .zip(join_all(labs.iter().map(|(_, lab)| lab.resume())).await)
        {
            if let Err(error) = result {
                warn!(?error, %team, "unable to resume lab");
            }
        }
        self.hub.resume();
        self.store.set_status(EventStatus::Running).await?;
        info!("resumed event");
        Ok(())
    }

    /// Archives the event under `archive_tag`. Finishing twice is a no-op.
    pub async fn finish(&self, archive_tag: &Tag) -> Result<(), StoreError> {
        if self.store.finish(archive_tag).await? {
            info!(event = %self.tag(), archive = %archive_tag, "finished event");
        }
        Ok(())
    }

    /// The team portal of the event.
    pub fn handler(self: &Arc<Self>) -> axum::Router {
        crate::portal::router(self.clone())
    }
}

async fn install_missing(lab: &Lab, exercises: &[ExerciseConfig]) -> Result<(), EventError> {
    let installed = lab.environment().tags().await;
    for exercise in exercises {
        if exercise.tags.iter().any(|tag| installed.contains(tag)) {
            continue;
        }
        lab.environment().add(exercise).await?;
    }
    Ok(())
}

#[async_trait]
impl Closer for Event {
    async fn close(&self) -> eyre::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let labs: Vec<Arc<Lab>> = self.labs_mut().drain().map(|(_, lab)| lab).collect();
        let mut closing = vec![
            self.gateway.close(),
            self.hub.close(),
            self.keylogger.close(),
        ];
        closing.extend(labs.iter().map(|lab| lab.close()));
        for error in join_all(closing)
            .await
            .into_iter()
            .filter_map(Result::err)
        {
            warn!(?error, event = %self.tag(), "error while closing event");
        }
        info!(event = %self.tag(), "closed event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event_config, exercise, quick_team, test_event, test_event_with};
    use haaukins_lab::HubStatus;
    use std::collections::HashSet;

    #[tokio::test]
    async fn should_assign_labs_to_registered_teams_on_start() {
        let test = test_event(1, 3).await;
        let alpha = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        let bravo = test.event.store().save_team(quick_team("bravo")).await.unwrap();

        test.event.start().await.unwrap();

        assert!(test.gateway.started());
        assert!(test.event.lab(alpha.id()).is_some());
        assert!(test.event.lab(bravo.id()).is_some());
        assert_eq!(test.gateway.users().len(), 2);

        let names: HashSet<String> = test
            .gateway
            .connections()
            .into_iter()
            .map(|conn| conn.name)
            .collect();
        assert!(names.contains(&format!("{}-client1", alpha.id())));
        assert!(names.contains(&format!("{}-client1", bravo.id())));

        let challenges = alpha.challenges();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].tag.as_str(), "ftp");
        assert!(challenges[0].value.starts_with("HKN{"));
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_fail_to_start_without_gateway() {
        let test = test_event(1, 1).await;
        test.gateway.fail_start();
        assert!(matches!(
            test.event.start().await,
            Err(EventError::StartingGateway(_))
        ));
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_assign_a_lab_once() {
        let test = test_event(1, 2).await;
        test.event.start().await.unwrap();
        crate::testing::wait_for_queued(test.event.hub(), 1).await;

        let team = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        test.event.assign_next(&team).await.unwrap();
        let lab = test.event.lab(team.id()).unwrap();
        test.event.assign_next(&team).await.unwrap();
        assert_eq!(test.event.lab(team.id()).unwrap().tag(), lab.tag());
        assert_eq!(test.gateway.users().len(), 1);

        let token = test.event.gateway_login(&team).await.unwrap();
        assert!(token.contains("token-alpha"));
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_give_every_team_its_own_flags() {
        let teams = 12;
        let test = test_event(3, teams).await;
        test.event.start().await.unwrap();

        let mut flags = HashSet::new();
        for i in 0..teams {
            let team = test
                .event
                .store()
                .save_team(quick_team(&format!("team{i}")))
                .await
                .unwrap();
            let lab = test.event.wait_for_lab().await.unwrap();
            test.event.assign_lab(&team, lab).await.unwrap();
            for challenge in team.challenges() {
                assert!(flags.insert(challenge.value));
            }
        }
        assert_eq!(flags.len(), teams);
        assert!(matches!(test.event.hub().get(), Err(HubError::MaxLabs)));
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_labs_without_frontends() {
        let mut config = event_config("demo", 1, 1);
        config.lab.frontends.clear();
        let test = test_event_with(config, vec![exercise("ftp", "aau/ftp")]).await;
        test.event.start().await.unwrap();
        crate::testing::wait_for_queued(test.event.hub(), 1).await;

        let team = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        assert!(matches!(
            test.event.assign_next(&team).await,
            Err(EventError::RdpConf)
        ));
        assert!(test.event.lab(team.id()).is_none());
        assert!(test.gateway.users().is_empty());
        assert!(team.challenges().is_empty());
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_suspend_and_resume() {
        let test = test_event(1, 2).await;
        test.event.start().await.unwrap();

        test.event.suspend().await.unwrap();
        assert_eq!(test.event.status(), EventStatus::Suspended);
        assert_eq!(test.event.hub().status(), HubStatus::Suspended);

        let team = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        assert!(matches!(
            test.event.assign_next(&team).await,
            Err(EventError::Suspended)
        ));

        test.event.resume().await.unwrap();
        assert_eq!(test.event.status(), EventStatus::Running);
        assert_eq!(test.event.hub().status(), HubStatus::Running);
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_install_added_exercises() {
        let test = test_event(1, 2).await;
        let alpha = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        test.event.start().await.unwrap();

        let sql = vec![exercise("sql", "aau/sql")];
        test.event.extend_exercises(&sql);
        test.event.install_exercises(alpha.id(), &sql).await.unwrap();
        assert!(alpha.has_challenge(&Tag::new("sql").unwrap()));
        test.event.install_exercises(alpha.id(), &sql).await.unwrap();
        assert_eq!(
            test.event.exercise_tags(),
            vec![Tag::new("ftp").unwrap(), Tag::new("sql").unwrap()]
        );

        let bravo = test.event.store().save_team(quick_team("bravo")).await.unwrap();
        let lab = test.event.wait_for_lab().await.unwrap();
        test.event.assign_lab(&bravo, lab).await.unwrap();
        assert!(bravo.has_challenge(&Tag::new("sql").unwrap()));
        assert!(bravo.has_challenge(&Tag::new("ftp").unwrap()));

        assert!(matches!(
            test.event.install_exercises("missing", &sql).await,
            Err(EventError::Store(StoreError::UnknownTeam(_)))
        ));
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_finish_once() {
        let test = test_event(1, 1).await;
        let archive = Tag::new("demo-1700000000").unwrap();
        test.event.finish(&archive).await.unwrap();
        test.event.finish(&archive).await.unwrap();
        assert_eq!(test.event.status(), EventStatus::Closed);
        test.event.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_close_once() {
        let test = test_event(1, 1).await;
        let team = test.event.store().save_team(quick_team("alpha")).await.unwrap();
        test.event.start().await.unwrap();
        assert!(test.event.lab(team.id()).is_some());

        test.event.close().await.unwrap();
        test.event.close().await.unwrap();
        assert_eq!(test.gateway.closed(), 1);
        assert_eq!(test.event.hub().status(), HubStatus::Closed);
        assert!(test.event.labs().is_empty());
    }
}
