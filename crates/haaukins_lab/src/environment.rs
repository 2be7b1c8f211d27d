// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::dhcp::DhcpServer;
use crate::dns::DnsServer;
use crate::exercise::Exercise;
use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::{join_all, try_join_all};
use haaukins_common::models::{Challenge, ExerciseConfig, RecordConfig};
use haaukins_common::Tag;
use haaukins_virtual::container::ContainerRuntime;
use haaukins_virtual::network::{Network, DHCP_OCTET, DNS_OCTET};
use haaukins_virtual::vm::VmLibrary;
use haaukins_virtual::{Closer, InstanceInfo};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct EnvironmentState {
    exercises: Vec<Arc<Exercise>>,
    tags: HashMap<Tag, Arc<Exercise>>,
    dns: Option<DnsServer>,
    dhcp: Option<DhcpServer>,
    started: bool,
    closed: bool,
}

/// The network side of a lab: a private network with DHCP and DNS, and the exercises living on
/// it. Mutations are serialized.
pub struct Environment {
    runtime: Arc<dyn ContainerRuntime>,
    library: Arc<VmLibrary>,
    network: Arc<Network>,
    state: Mutex<EnvironmentState>,
}

impl Environment {
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        library: Arc<VmLibrary>,
    ) -> Result<Environment, LabError> {
        let network = Network::new(runtime.clone()).await?;
        Ok(Environment {
            runtime,
            library,
            network: Arc::new(network),
            state: Mutex::new(EnvironmentState::default()),
        })
    }

    async fn state(&self) -> Result<MutexGuard<'_, EnvironmentState>, LabError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(LabError::Closed);
        }
        Ok(state)
    }

    /// Adds an exercise. Once the environment is started the exercise is started as well and the
    /// DNS zone is serving its records when this returns. DNS is left alone if the exercise
    /// fails to start.
    #[instrument(skip_all, fields(exercise = %conf.name))]
    pub async fn add(&self, conf: &ExerciseConfig) -> Result<(), LabError> {
        let mut state = self.state().await?;

        if conf.tags.is_empty() {
            return Err(LabError::MissingTags);
        }
        let mut seen = HashSet::new();
        for tag in &conf.tags {
            if state.tags.contains_key(tag) || !seen.insert(tag) {
                return Err(LabError::DuplicateTag(tag.clone()));
            }
        }

        let exercise = Arc::new(Exercise::new(
            conf,
            self.runtime.clone(),
            self.library.clone(),
            self.network.clone(),
            &self.network.format_ip(DNS_OCTET),
        ));
        if let Err(error) = self.install(&mut state, &exercise).await {
            if let Err(error) = exercise.close().await {
                warn! {
                    ?error,
                    exercise = %conf.name,
                    "unable to close exercise after failed add"
                }
            }
            return Err(error);
        }

        for tag in &conf.tags {
            state.tags.insert(tag.clone(), exercise.clone());
        }
        state.exercises.push(exercise);
        debug!(exercise = %conf.name, "added exercise");
        Ok(())
    }

    async fn install(
        &self,
        state: &mut EnvironmentState,
        exercise: &Exercise,
    ) -> Result<(), LabError> {
        exercise.create().await?;
        if state.started {
            exercise.start().await?;
            let mut records = collect_records(&state.exercises).await;
            records.extend(exercise.records().await);
            self.refresh_dns(state, records).await?;
        }
        Ok(())
    }

    /// Replaces the DNS server with one serving `records`. The new container takes over the DNS
    /// address of the old one.
    async fn refresh_dns(
        &self,
        state: &mut EnvironmentState,
        records: Vec<RecordConfig>,
    ) -> Result<(), LabError> {
        let dns = DnsServer::new(self.runtime.clone(), records).await?;
        let id = dns.container().create().await?;

        if let Some(old) = state.dns.take() {
            if let Some(old_id) = old.container().id().await {
                self.network.forget(&old_id);
            }
            if let Err(error) = old.close().await {
                warn!(?error, "unable to close previous dns server");
            }
        }

        let attached = async {
            self.network.connect(&id, Some(DNS_OCTET)).await?;
            dns.run().await
        };
        if let Err(error) = attached.await {
            self.network.forget(&id);
            if let Err(error) = dns.close().await {
                warn!(?error, "unable to close dns server");
            }
            return Err(error);
        }

        state.dns = Some(dns);
        Ok(())
    }

    async fn start_dhcp(&self, state: &mut EnvironmentState) -> Result<(), LabError> {
        if let Some(dhcp) = &state.dhcp {
            return dhcp.run().await;
        }

        let dhcp = DhcpServer::new(self.runtime.clone(), &self.network).await?;
        let attached = async {
            let id = dhcp.container().create().await?;
            self.network.connect(&id, Some(DHCP_OCTET)).await?;
            dhcp.run().await
        };
        if let Err(error) = attached.await {
            if let Some(id) = dhcp.container().id().await {
                self.network.forget(&id);
            }
            if let Err(error) = dhcp.close().await {
                warn!(?error, "unable to close dhcp server");
            }
            return Err(error);
        }

        state.dhcp = Some(dhcp);
        Ok(())
    }

    /// Starts DNS and DHCP, then every exercise in parallel.
    pub async fn start(&self) -> Result<(), LabError> {
        let mut state = self.state().await?;
        let records = collect_records(&state.exercises).await;
        self.refresh_dns(&mut state, records).await?;
        self.start_dhcp(&mut state).await?;
        try_join_all(state.exercises.iter().map(|exercise| exercise.start())).await?;
        state.started = true;
        info! {
            subnet = %self.network.subnet(),
            exercises = state.exercises.len(),
            "started environment"
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LabError> {
        let mut state = self.state().await?;
        try_join_all(state.exercises.iter().map(|exercise| exercise.stop())).await?;
        if let Some(dhcp) = &state.dhcp {
            dhcp.stop().await?;
        }
        if let Some(dns) = &state.dns {
            dns.stop().await?;
        }
        state.started = false;
        Ok(())
    }

    /// Pauses the exercises. DNS and DHCP keep running.
    pub async fn suspend(&self) -> Result<(), LabError> {
        let state = self.state().await?;
        try_join_all(state.exercises.iter().map(|exercise| exercise.suspend())).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), LabError> {
        let state = self.state().await?;
        try_join_all(state.exercises.iter().map(|exercise| exercise.start())).await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), LabError> {
        let state = self.state().await?;
        try_join_all(state.exercises.iter().map(|exercise| exercise.restart())).await?;
        Ok(())
    }

    /// The exercise known by `tag`, either one of its own tags or the tag of one of its
    /// challenges.
    fn exercise_by_tag(state: &EnvironmentState, tag: &str) -> Result<Arc<Exercise>, LabError> {
        let unknown = || LabError::UnknownTag(tag.to_string());
        let tag = Tag::new(tag).map_err(|_| unknown())?;
        if let Some(exercise) = state.tags.get(&tag) {
            return Ok(exercise.clone());
        }
        state
            .exercises
            .iter()
            .find(|exercise| exercise.challenges().iter().any(|c| c.tag == tag))
            .cloned()
            .ok_or_else(unknown)
    }

    /// Replaces the instances of the exercise known by `tag` with fresh ones.
    pub async fn reset_by_tag(&self, tag: &str) -> Result<(), LabError> {
        let state = self.state().await?;
        let exercise = Self::exercise_by_tag(&state, tag)?;
        exercise.reset().await?;
        info!(exercise = %exercise.name(), "reset exercise");
        Ok(())
    }

    pub async fn start_by_tag(&self, tag: &str) -> Result<(), LabError> {
        let state = self.state().await?;
        let exercise = Self::exercise_by_tag(&state, tag)?;
        exercise.start().await?;
        info!(exercise = %exercise.name(), "started exercise");
        Ok(())
    }

    pub async fn stop_by_tag(&self, tag: &str) -> Result<(), LabError> {
        let state = self.state().await?;
        let exercise = Self::exercise_by_tag(&state, tag)?;
        exercise.stop().await?;
        info!(exercise = %exercise.name(), "stopped exercise");
        Ok(())
    }

    /// The challenges of every exercise, in the order the exercises were added.
    pub async fn challenges(&self) -> Vec<Challenge> {
        let state = self.state.lock().await;
        state
            .exercises
            .iter()
            .flat_map(|exercise| exercise.challenges().iter().cloned())
            .collect()
    }

    pub async fn tags(&self) -> Vec<Tag> {
        let state = self.state.lock().await;
        state
            .exercises
            .iter()
            .flat_map(|exercise| exercise.tags().iter().cloned())
            .collect()
    }

    pub async fn instance_info(&self) -> Vec<InstanceInfo> {
        let state = self.state.lock().await;
        join_all(state.exercises.iter().map(|exercise| exercise.instance_info()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// The records currently served by the lab DNS.
    pub async fn dns_records(&self) -> Vec<RecordConfig> {
        let state = self.state.lock().await;
        state
            .dns
            .as_ref()
            .map(|dns| dns.records().to_vec())
            .unwrap_or_default()
    }

    pub fn network_interface(&self) -> String {
        self.network.interface()
    }

    pub fn lab_subnet(&self) -> String {
        self.network.subnet()
    }

    pub fn lab_dns(&self) -> String {
        self.network.format_ip(DNS_OCTET)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

async fn collect_records(exercises: &[Arc<Exercise>]) -> Vec<RecordConfig> {
    join_all(exercises.iter().map(|exercise| exercise.records()))
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[async_trait]
impl Closer for Environment {
    /// Tears down services and exercises, then the network. Closing twice is a no-op.
    async fn close(&self) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut closers: Vec<&dyn Closer> = Vec::new();
        if let Some(dhcp) = &state.dhcp {
            closers.push(dhcp);
        }
        if let Some(dns) = &state.dns {
            closers.push(dns);
        }
        for exercise in &state.exercises {
            closers.push(exercise.as_ref());
        }
        for error in join_all(closers.into_iter().map(|closer| closer.close()))
            .await
            .into_iter()
            .filter_map(Result::err)
        {
            warn!(?error, "error while closing environment");
        }

        state.tags.clear();
        state.exercises.clear();
        state.dhcp = None;
        state.dns = None;
        self.network.close().await
    }
}
