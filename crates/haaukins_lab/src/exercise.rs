// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::{join_all, try_join_all};
use haaukins_common::models::{Challenge, ExerciseConfig, InstanceConfig, RecordConfig};
use haaukins_common::{Flag, Tag};
use haaukins_virtual::container::{Container, ContainerConfig, ContainerRuntime, Resources};
use haaukins_virtual::network::Network;
use haaukins_virtual::vm::{Vm, VmLibrary, VmOption};
use haaukins_virtual::{Closer, InstanceInfo, InstanceState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A running instance of an exercise.
pub enum Machine {
    Container(Container),
    Vm(Vm),
}

impl Machine {
    async fn start(&self) -> Result<(), LabError> {
        match self {
            Machine::Container(container) => container.start().await?,
            Machine::Vm(vm) => vm.start().await?,
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), LabError> {
        match self {
            Machine::Container(container) => container.stop().await?,
            Machine::Vm(vm) => vm.stop().await?,
        }
        Ok(())
    }

    async fn suspend(&self) -> Result<(), LabError> {
        match self {
            Machine::Container(container) => container.suspend().await?,
            Machine::Vm(vm) => vm.suspend().await?,
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), LabError> {
        match self {
            Machine::Container(container) => match container.info().await.state {
                InstanceState::Running => {
                    container.stop().await?;
                    container.start().await?;
                }
                InstanceState::Suspended => {
                    container.start().await?;
                    container.stop().await?;
                    container.start().await?;
                }
                InstanceState::Stopped | InstanceState::Error => container.start().await?,
            },
            Machine::Vm(vm) => vm.restart().await?,
        }
        Ok(())
    }

    pub async fn info(&self) -> InstanceInfo {
        match self {
            Machine::Container(container) => container.info().await,
            Machine::Vm(vm) => vm.info().await,
        }
    }
}

#[async_trait]
impl Closer for Machine {
    async fn close(&self) -> eyre::Result<()> {
        match self {
            Machine::Container(container) => container.close().await,
            Machine::Vm(vm) => vm.close().await,
        }
    }
}

struct ContainerSpec {
    config: ContainerConfig,
    records: Vec<RecordConfig>,
}

#[derive(Default)]
struct ExerciseState {
    /// Last octets of the containers, kept across resets so DNS records stay valid
    octets: Option<Vec<u8>>,
    machines: Vec<Machine>,
    records: Vec<RecordConfig>,
}

/// The containers and VMs of one exercise in one lab. Flags are drawn once, when the exercise is
/// constructed, and survive resets.
pub struct Exercise {
    tags: Vec<Tag>,
    name: String,
    containers: Vec<ContainerSpec>,
    vms: Vec<InstanceConfig>,
    challenges: Vec<Challenge>,
    runtime: Arc<dyn ContainerRuntime>,
    library: Arc<VmLibrary>,
    network: Arc<Network>,
    state: Mutex<ExerciseState>,
}

impl Exercise {
    pub fn new(
        conf: &ExerciseConfig,
        runtime: Arc<dyn ContainerRuntime>,
        library: Arc<VmLibrary>,
        network: Arc<Network>,
        dns_addr: &str,
    ) -> Exercise {
        let mut containers = Vec::new();
        let mut vms = Vec::new();
        let mut challenges = Vec::new();

        for instance in &conf.instances {
            if instance.is_vm() {
                for flag in &instance.flags {
                    challenges.push(Challenge {
                        tag: flag.tag.clone(),
                        name: flag.name.clone(),
                        value: flag.static_flag.clone().unwrap_or_default(),
                    });
                }
                vms.push(instance.clone());
                continue;
            }

            let mut env = BTreeMap::new();
            for flag in &instance.flags {
                let value = match &flag.static_flag {
                    Some(value) => value.clone(),
                    None => Flag::new().to_string(),
                };
                if let Some(var) = &flag.env_var {
                    env.insert(var.clone(), value.clone());
                }
                challenges.push(Challenge {
                    tag: flag.tag.clone(),
                    name: flag.name.clone(),
                    value,
                });
            }
            for var in &instance.envs {
                env.insert(var.name.clone(), var.value.clone());
            }

            containers.push(ContainerSpec {
                config: ContainerConfig {
                    image: instance.image.clone(),
                    env,
                    dns: vec![dns_addr.to_string()],
                    resources: Some(Resources {
                        memory_mb: instance.memory_mb,
                        cpu: instance.cpu,
                    }),
                    labels: BTreeMap::from([("hkn".to_string(), "lab_exercise".to_string())]),
                    ..Default::default()
                },
                records: instance.records.clone(),
            });
        }

        Exercise {
            tags: conf.tags.clone(),
            name: conf.name.clone(),
            containers,
            vms,
            challenges,
            runtime,
            library,
            network,
            state: Mutex::new(ExerciseState::default()),
        }
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    /// The DNS records published by the exercise, with addresses filled in.
    pub async fn records(&self) -> Vec<RecordConfig> {
        self.state.lock().await.records.clone()
    }

    pub async fn instance_info(&self) -> Vec<InstanceInfo> {
        let state = self.state.lock().await;
        join_all(state.machines.iter().map(Machine::info)).await
    }

    /// Creates every instance and connects the containers to the lab network. Instances created
    /// before a failure are torn down again.
    pub async fn create(&self) -> Result<(), LabError> {
        let mut state = self.state.lock().await;
        let mut machines = Vec::new();
        match self.create_machines(&state, &mut machines).await {
            Ok((octets, records)) => {
                state.octets.get_or_insert(octets);
                state.records = records;
                state.machines = machines;
                Ok(())
            }
            Err(error) => {
                self.close_machines(&machines).await;
                Err(error)
            }
        }
    }

    async fn create_machines(
        &self,
        state: &ExerciseState,
        machines: &mut Vec<Machine>,
    ) -> Result<(Vec<u8>, Vec<RecordConfig>), LabError> {
        let mut octets = Vec::new();
        let mut records = Vec::new();

        for (i, spec) in self.containers.iter().enumerate() {
            let container = Container::new(self.runtime.clone(), spec.config.clone());
            let id = container.create().await?;
            machines.push(Machine::Container(container));

            let preferred = state
                .octets
                .as_ref()
                .and_then(|octets| octets.get(i).copied());
            let octet = self.network.connect(&id, preferred).await?;
            octets.push(octet);

            let ip = self.network.format_ip(octet);
            records.extend(spec.records.iter().map(|record| RecordConfig {
                rdata: if record.rdata.is_empty() {
                    ip.clone()
                } else {
                    record.rdata.clone()
                },
                ..record.clone()
            }));
        }

        for instance in &self.vms {
            let mut options = vec![VmOption::Bridge(self.network.interface())];
            if instance.cpu > 0.0 {
                options.push(VmOption::Cpu(instance.cpu.ceil() as u32));
            }
            if instance.memory_mb > 0 {
                options.push(VmOption::Ram(instance.memory_mb));
            }
            let vm = self.library.get_copy(&instance.image, &options).await?;
            machines.push(Machine::Vm(vm));
        }

        Ok((octets, records))
    }

    async fn close_machines(&self, machines: &[Machine]) {
        let results = join_all(machines.iter().map(|machine| async move {
            if let Machine::Container(container) = machine {
                if let Some(id) = container.id().await {
                    self.network.forget(&id);
                }
            }
            machine.close().await
        }))
        .await;
        for error in results.into_iter().filter_map(Result::err) {
            warn! {
                ?error,
                exercise = %self.name,
                "error while closing exercise"
            }
        }
    }

    pub async fn start(&self) -> Result<(), LabError> {
        let state = self.state.lock().await;
        try_join_all(state.machines.iter().map(Machine::start)).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LabError> {
        let state = self.state.lock().await;
        try_join_all(state.machines.iter().map(Machine::stop)).await?;
        Ok(())
    }

    pub async fn suspend(&self) -> Result<(), LabError> {
        let state = self.state.lock().await;
        try_join_all(state.machines.iter().map(Machine::suspend)).await?;
        Ok(())
    }

    /// Restarts every instance according to its current state.
    pub async fn restart(&self) -> Result<(), LabError> {
        let broken = self
            .instance_info()
            .await
            .iter()
            .any(|info| info.state == InstanceState::Error);
        if broken {
            return self.reset().await;
        }

        let state = self.state.lock().await;
        try_join_all(state.machines.iter().map(Machine::restart)).await?;
        Ok(())
    }

    /// Replaces every instance with a fresh one on the same addresses.
    pub async fn reset(&self) -> Result<(), LabError> {
        self.close_all().await;
        self.create().await?;
        self.start().await?;
        debug!(exercise = %self.name, "reset exercise");
        Ok(())
    }

    async fn close_all(&self) {
        let mut state = self.state.lock().await;
        let machines = std::mem::take(&mut state.machines);
        self.close_machines(&machines).await;
    }
}

#[async_trait]
impl Closer for Exercise {
    async fn close(&self) -> eyre::Result<()> {
        self.close_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ftp_exercise;
    use haaukins_common::models::ChallengeConfig;
    use haaukins_virtual::testing::{FakeHypervisor, FakeRuntime};

    async fn setup() -> (Arc<FakeRuntime>, Arc<Network>, Arc<VmLibrary>) {
        let runtime = Arc::new(FakeRuntime::default());
        let network = Arc::new(Network::new(runtime.clone()).await.unwrap());
        let library = Arc::new(VmLibrary::new(
            Arc::new(FakeHypervisor::default()),
            "/nonexistent",
        ));
        (runtime, network, library)
    }

    #[tokio::test]
    async fn should_install_flags_as_environment_variables() {
        let (runtime, network, library) = setup().await;
        let exercise = Exercise::new(
            &ftp_exercise(),
            runtime.clone(),
            library,
            network.clone(),
            &network.format_ip(3),
        );
        exercise.create().await.unwrap();

        let challenges = exercise.challenges();
        assert_eq!(challenges.len(), 2);
        assert!(challenges[0].value.starts_with("HKN{"));
        assert_eq!(challenges[1].value, "HKN{static}");

        let id = runtime.containers_of("aau/ftp").remove(0);
        let config = runtime.config_of(&id).unwrap();
        assert_eq!(config.env["APP_FLAG"], challenges[0].value);
        assert_eq!(config.env["BANNER_FLAG"], "HKN{static}");
        assert_eq!(config.env["MODE"], "anonymous");
        assert_eq!(config.dns, vec![network.format_ip(3)]);
        assert_eq!(config.labels["hkn"], "lab_exercise");
    }

    #[tokio::test]
    async fn should_fill_empty_records_with_container_address() {
        let (runtime, network, library) = setup().await;
        let exercise = Exercise::new(
            &ftp_exercise(),
            runtime.clone(),
            library,
            network.clone(),
            &network.format_ip(3),
        );
        exercise.create().await.unwrap();

        let id = runtime.containers_of("aau/ftp").remove(0);
        let records = exercise.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(Some(records[0].rdata.clone()), runtime.ip_of(network.id(), &id));
    }

    #[tokio::test]
    async fn should_keep_addresses_and_flags_across_reset() {
        let (runtime, network, library) = setup().await;
        let exercise = Exercise::new(
            &ftp_exercise(),
            runtime.clone(),
            library,
            network.clone(),
            &network.format_ip(3),
        );
        exercise.create().await.unwrap();
        exercise.start().await.unwrap();
        let before = runtime.containers_of("aau/ftp").remove(0);
        let records = exercise.records().await;
        let flag = exercise.challenges()[0].value.clone();

        exercise.reset().await.unwrap();
        let after = runtime.containers_of("aau/ftp").remove(0);
        assert_ne!(before, after);
        assert_eq!(exercise.records().await, records);
        assert_eq!(exercise.challenges()[0].value, flag);
        assert_eq!(runtime.container_count(), 1);
        assert_eq!(runtime.state_of(&after), Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn should_tear_down_partially_created_exercises() {
        let (runtime, network, library) = setup().await;
        let mut conf = ftp_exercise();
        conf.instances.push(InstanceConfig {
            image: "aau/broken".to_string(),
            ..Default::default()
        });
        runtime.fail_image("aau/broken");
        let exercise = Exercise::new(&conf, runtime.clone(), library, network.clone(), "x");

        assert!(exercise.create().await.is_err());
        assert_eq!(runtime.container_count(), 0);
        assert!(exercise.instance_info().await.is_empty());
    }

    #[tokio::test]
    async fn should_emit_static_challenges_for_vms() {
        let (runtime, network, library) = setup().await;
        let conf = ExerciseConfig {
            tags: vec![Tag::new("forensics").unwrap()],
            name: "Forensics".to_string(),
            instances: vec![InstanceConfig {
                image: "forensics.ova".to_string(),
                flags: vec![ChallengeConfig {
                    tag: Tag::new("forensics").unwrap(),
                    name: "Find the file".to_string(),
                    env_var: None,
                    static_flag: Some("HKN{disk}".to_string()),
                    points: 10,
                }],
                ..Default::default()
            }],
        };
        let exercise = Exercise::new(&conf, runtime, library, network, "x");
        assert_eq!(exercise.challenges()[0].value, "HKN{disk}");
    }
}
