// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::environment::Environment;
use crate::hub::LabCreator;
use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::{join_all, try_join_all};
use haaukins_common::models::{ExerciseConfig, FrontendConfig};
use haaukins_virtual::container::ContainerRuntime;
use haaukins_virtual::vm::{Vm, VmLibrary, VmOption};
use haaukins_virtual::{get_available_port, Closer, InstanceInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FrontendOverride {
    memory_mb: Option<u32>,
    cpu: Option<u32>,
}

/// Memory and CPU overrides per frontend image, applied to frontends created afterwards.
#[derive(Clone, Default)]
pub struct FrontendSettings(Arc<RwLock<HashMap<String, FrontendOverride>>>);

impl FrontendSettings {
    pub fn set_memory(&self, image: &str, memory_mb: u32) {
        let mut overrides = self.0.write().unwrap_or_else(PoisonError::into_inner);
        overrides.entry(image.to_string()).or_default().memory_mb = Some(memory_mb);
    }

    pub fn set_cpu(&self, image: &str, cpu: u32) {
        let mut overrides = self.0.write().unwrap_or_else(PoisonError::into_inner);
        overrides.entry(image.to_string()).or_default().cpu = Some(cpu);
    }

    pub fn apply(&self, conf: &FrontendConfig) -> FrontendConfig {
        let overrides = self.0.read().unwrap_or_else(PoisonError::into_inner);
        let found = overrides.get(&conf.image).copied().unwrap_or_default();
        FrontendConfig {
            image: conf.image.clone(),
            memory_mb: found.memory_mb.unwrap_or(conf.memory_mb),
            cpu: found.cpu.unwrap_or(conf.cpu),
        }
    }
}

/// Everything a lab needs from the host.
#[derive(Clone)]
pub struct LabContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub library: Arc<VmLibrary>,
    /// The address frontends serve RDP on
    pub host_ip: String,
    pub settings: FrontendSettings,
}

#[derive(Debug, Clone, Default)]
pub struct LabConfig {
    pub frontends: Vec<FrontendConfig>,
    pub exercises: Vec<ExerciseConfig>,
}

struct Frontend {
    port: u16,
    config: FrontendConfig,
    vm: Vm,
}

/// A team's lab: an environment and the desktop VMs the team reaches over RDP.
pub struct Lab {
    tag: String,
    context: LabContext,
    environment: Environment,
    frontends: Mutex<Vec<Frontend>>,
    closed: AtomicBool,
}

impl Lab {
    /// Builds a lab without starting it. A partially built lab is closed again on failure.
    #[instrument(skip_all, fields(lab = tracing::field::Empty))]
    pub async fn build(context: &LabContext, config: &LabConfig) -> Result<Lab, LabError> {
        let environment = Environment::new(context.runtime.clone(), context.library.clone()).await?;
        let mut tag = uuid::Uuid::new_v4().simple().to_string();
        tag.truncate(8);
        tracing::Span::current().record("lab", tag.as_str());

        let lab = Lab {
            tag,
            context: context.clone(),
            environment,
            frontends: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let populated = async {
            for exercise in &config.exercises {
                lab.environment.add(exercise).await?;
            }
            for frontend in &config.frontends {
                lab.add_frontend(frontend).await?;
            }
            Ok::<(), LabError>(())
        };
        if let Err(error) = populated.await {
            if let Err(error) = lab.close().await {
                warn!(?error, lab = %lab.tag, "unable to close partially built lab");
            }
            return Err(error);
        }

        info! {
            lab = %lab.tag,
            exercises = config.exercises.len(),
            frontends = config.frontends.len(),
            "built lab"
        }
        Ok(lab)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    async fn create_frontend(&self, conf: &FrontendConfig, port: u16) -> Result<Vm, LabError> {
        let conf = self.context.settings.apply(conf);
        let mut options = vec![
            VmOption::Bridge(self.environment.network_interface()),
            VmOption::LocalRdp {
                ip: self.context.host_ip.clone(),
                port,
            },
        ];
        if conf.memory_mb > 0 {
            options.push(VmOption::Ram(conf.memory_mb));
        }
        if conf.cpu > 0 {
            options.push(VmOption::Cpu(conf.cpu));
        }
        Ok(self.context.library.get_copy(&conf.image, &options).await?)
    }

    /// Adds a frontend VM served over RDP on a free local port.
    pub async fn add_frontend(&self, conf: &FrontendConfig) -> Result<u16, LabError> {
        let port = get_available_port().await?;
        let vm = self.create_frontend(conf, port).await?;
        self.frontends.lock().await.push(Frontend {
            port,
            config: conf.clone(),
            vm,
        });
        Ok(port)
    }

    /// The RDP ports of the frontends, in the order the frontends were added.
    pub async fn rdp_conn_ports(&self) -> Vec<u16> {
        let frontends = self.frontends.lock().await;
        frontends.iter().map(|frontend| frontend.port).collect()
    }

    pub async fn start(&self) -> Result<(), LabError> {
        self.environment.start().await?;
        let frontends = self.frontends.lock().await;
        try_join_all(frontends.iter().map(|frontend| frontend.vm.start())).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LabError> {
        self.environment.stop().await?;
        let frontends = self.frontends.lock().await;
        try_join_all(frontends.iter().map(|frontend| frontend.vm.stop())).await?;
        Ok(())
    }

    pub async fn suspend(&self) -> Result<(), LabError> {
        self.environment.suspend().await?;
        let frontends = self.frontends.lock().await;
        try_join_all(frontends.iter().map(|frontend| frontend.vm.suspend())).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), LabError> {
        self.environment.resume().await?;
        let frontends = self.frontends.lock().await;
        try_join_all(frontends.iter().map(|frontend| frontend.vm.start())).await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), LabError> {
        self.environment.restart().await?;
        let frontends = self.frontends.lock().await;
        try_join_all(frontends.iter().map(|frontend| frontend.vm.restart())).await?;
        Ok(())
    }

    /// Replaces every frontend with a fresh clone listening on the same port.
    pub async fn reset_frontends(&self) -> Result<(), LabError> {
        let mut frontends = self.frontends.lock().await;
        for frontend in frontends.iter_mut() {
            if let Err(error) = frontend.vm.close().await {
                warn!(?error, vm = %frontend.vm.id(), "unable to close frontend");
            }
            frontend.vm = self.create_frontend(&frontend.config, frontend.port).await?;
            frontend.vm.start().await?;
        }
        info!(lab = %self.tag, "reset frontends");
        Ok(())
    }

    pub async fn instance_info(&self) -> Vec<InstanceInfo> {
        let mut info = self.environment.instance_info().await;
        let frontends = self.frontends.lock().await;
        info.extend(join_all(frontends.iter().map(|frontend| frontend.vm.info())).await);
        info
    }
}

#[async_trait]
impl Closer for Lab {
    async fn close(&self) -> eyre::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let frontends = self.frontends.lock().await;
        let mut closers: Vec<&dyn Closer> = vec![&self.environment];
        closers.extend(frontends.iter().map(|frontend| &frontend.vm as &dyn Closer));
        for error in join_all(closers.into_iter().map(|closer| closer.close()))
            .await
            .into_iter()
            .filter_map(Result::err)
        {
            warn!(?error, lab = %self.tag, "error while closing lab");
        }
        Ok(())
    }
}

/// Builds labs from a fixed configuration.
pub struct LabBuilder {
    context: LabContext,
    config: LabConfig,
}

impl LabBuilder {
    pub fn new(context: LabContext, config: LabConfig) -> Self {
        LabBuilder { context, config }
    }
}

#[async_trait]
impl LabCreator for LabBuilder {
    async fn create_lab(&self) -> Result<Lab, LabError> {
        Lab::build(&self.context, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, ftp_exercise};
    use haaukins_virtual::{InstanceKind, InstanceState};

    fn kali() -> FrontendConfig {
        FrontendConfig {
            image: "kali.ova".to_string(),
            memory_mb: 2048,
            cpu: 0,
        }
    }

    fn config() -> LabConfig {
        LabConfig {
            frontends: vec![kali()],
            exercises: vec![ftp_exercise()],
        }
    }

    #[tokio::test]
    async fn should_bridge_frontends_onto_the_lab_network() {
        let test = context();
        let lab = Lab::build(&test.context, &config()).await.unwrap();

        let ports = lab.rdp_conn_ports().await;
        assert_eq!(ports.len(), 1);
        assert_eq!(test.hypervisor.clone_count(), 1);

        let frontends = lab.frontends.lock().await;
        let options = test.hypervisor.options_of(frontends[0].vm.id());
        assert_eq!(
            options,
            vec![
                VmOption::Bridge(lab.environment().network_interface()),
                VmOption::LocalRdp {
                    ip: "172.17.0.1".to_string(),
                    port: ports[0],
                },
                VmOption::Ram(2048),
            ]
        );
        drop(frontends);
        lab.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_report_instances_of_exercises_and_frontends() {
        let test = context();
        let lab = Lab::build(&test.context, &config()).await.unwrap();
        lab.start().await.unwrap();

        let info = lab.instance_info().await;
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].kind, InstanceKind::Docker);
        assert_eq!(info[0].image, "aau/ftp");
        assert_eq!(info[1].kind, InstanceKind::Vbox);
        assert!(info.iter().all(|info| info.state == InstanceState::Running));

        lab.suspend().await.unwrap();
        assert!(lab
            .instance_info()
            .await
            .iter()
            .all(|info| info.state == InstanceState::Suspended));
        lab.resume().await.unwrap();
        assert_eq!(test.hypervisor.running_count(), 1);
        lab.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reset_frontends_on_the_same_ports() {
        let test = context();
        let lab = Lab::build(&test.context, &config()).await.unwrap();
        lab.start().await.unwrap();
        let ports = lab.rdp_conn_ports().await;
        let before = lab.instance_info().await[1].id.clone();

        lab.reset_frontends().await.unwrap();
        let info = lab.instance_info().await;
        assert_ne!(info[1].id, before);
        assert_eq!(info[1].state, InstanceState::Running);
        assert_eq!(lab.rdp_conn_ports().await, ports);
        assert_eq!(test.hypervisor.clone_count(), 1);
        lab.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_apply_frontend_overrides() {
        let test = context();
        test.context.settings.set_memory("kali.ova", 4096);
        test.context.settings.set_cpu("kali.ova", 2);
        let lab = Lab::build(&test.context, &config()).await.unwrap();

        let frontends = lab.frontends.lock().await;
        let options = test.hypervisor.options_of(frontends[0].vm.id());
        assert!(options.contains(&VmOption::Ram(4096)));
        assert!(options.contains(&VmOption::Cpu(2)));
        drop(frontends);
        lab.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_close_partially_built_labs() {
        let test = context();
        let mut config = config();
        config.frontends.push(FrontendConfig {
            image: "missing.ova".to_string(),
            memory_mb: 0,
            cpu: 0,
        });

        assert!(Lab::build(&test.context, &config).await.is_err());
        assert_eq!(test.runtime.container_count(), 0);
        assert_eq!(test.runtime.network_count(), 0);
        assert_eq!(test.hypervisor.clone_count(), 0);
    }

    #[tokio::test]
    async fn should_close_once() {
        let test = context();
        let lab = Lab::build(&test.context, &config()).await.unwrap();
        lab.start().await.unwrap();

        lab.close().await.unwrap();
        assert_eq!(test.runtime.container_count(), 0);
        assert_eq!(test.hypervisor.clone_count(), 0);
        let removals = test.hypervisor.removals();
        lab.close().await.unwrap();
        assert_eq!(test.hypervisor.removals(), removals);
    }
}
