// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

mod docker;

pub use docker::DockerCli;

use crate::{Closer, InstanceInfo, InstanceKind, InstanceState, VirtualError};
use async_trait::async_trait;
use color_eyre::eyre;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Resources {
    pub memory_mb: u32,
    pub cpu: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Container port (`8080/tcp`) to host address (`127.0.0.1:4000`)
    pub port_bindings: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// `<host path>:<container path>`
    pub mounts: Vec<String>,
    pub resources: Option<Resources>,
    pub cmd: Vec<String>,
    pub dns: Vec<String>,
    /// Ports exposed without a binding, e.g. `67/udp`
    pub used_ports: Vec<String>,
    /// Keep the container on the shared bridge network instead of isolating it
    pub use_bridge: bool,
    pub user: Option<String>,
}

/// The narrow interface the platform needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a stopped container and returns its id.
    async fn create(&self, config: &ContainerConfig) -> Result<String, VirtualError>;
    async fn start(&self, id: &str) -> Result<(), VirtualError>;
    async fn stop(&self, id: &str) -> Result<(), VirtualError>;
    async fn pause(&self, id: &str) -> Result<(), VirtualError>;
    async fn unpause(&self, id: &str) -> Result<(), VirtualError>;
    /// Force-removes a container. Removing an unknown container is not an error.
    async fn remove(&self, id: &str) -> Result<(), VirtualError>;
    async fn state(&self, id: &str) -> Result<InstanceState, VirtualError>;
    /// Creates an isolated network for the given `/24` and returns its id. Overlapping subnets
    /// fail with [VirtualError::SubnetOverlap].
    async fn create_network(&self, name: &str, subnet: &str) -> Result<String, VirtualError>;
    async fn remove_network(&self, id: &str) -> Result<(), VirtualError>;
    async fn connect(&self, network: &str, container: &str, ip: &str)
        -> Result<(), VirtualError>;
    async fn disconnect(&self, network: &str, container: &str) -> Result<(), VirtualError>;
    /// Makes a bridged container reachable from other bridged containers under `alias`.
    async fn bridge_alias(&self, container: &str, alias: &str) -> Result<(), VirtualError>;
    /// The address of the host on the runtime's default bridge.
    async fn host_ip(&self) -> Result<String, VirtualError>;
}

/// A single container. It is created lazily and may be closed and re-created.
pub struct Container {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    id: Mutex<Option<String>>,
}

impl Container {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        Container {
            runtime,
            config,
            id: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub async fn id(&self) -> Option<String> {
        self.id.lock().await.clone()
    }

    pub async fn create(&self) -> Result<String, VirtualError> {
        let mut id = self.id.lock().await;
        if let Some(id) = id.as_ref() {
            return Ok(id.clone());
        }

        let created = self.runtime.create(&self.config).await?;
        info! {
            id = short_id(&created),
            image = %self.config.image,
            "created new container"
        }
        *id = Some(created.clone());
        Ok(created)
    }

    /// Starts the container, resuming it if it was paused.
    pub async fn start(&self) -> Result<(), VirtualError> {
        let id = self.id().await.ok_or(VirtualError::NotCreated)?;
        match self.runtime.state(&id).await? {
            InstanceState::Running => Ok(()),
            InstanceState::Suspended => self.runtime.unpause(&id).await,
            _ => self.runtime.start(&id).await,
        }
    }

    /// Creates and starts the container.
    pub async fn run(&self) -> Result<(), VirtualError> {
        self.create().await?;
        self.start().await
    }

    pub async fn stop(&self) -> Result<(), VirtualError> {
        let id = self.id().await.ok_or(VirtualError::NotCreated)?;
        self.runtime.stop(&id).await
    }

    pub async fn suspend(&self) -> Result<(), VirtualError> {
        let id = self.id().await.ok_or(VirtualError::NotCreated)?;
        if self.runtime.state(&id).await? == InstanceState::Running {
            self.runtime.pause(&id).await?;
        }
        Ok(())
    }

    pub async fn bridge_alias(&self, alias: &str) -> Result<(), VirtualError> {
        let id = self.id().await.ok_or(VirtualError::NotCreated)?;
        self.runtime.bridge_alias(&id, alias).await
    }

    pub async fn info(&self) -> InstanceInfo {
        let id = self.id().await;
        let state = match &id {
            Some(id) => self
                .runtime
                .state(id)
                .await
                .unwrap_or(InstanceState::Error),
            None => InstanceState::Stopped,
        };
        InstanceInfo {
            image: self.config.image.clone(),
            kind: InstanceKind::Docker,
            id: id.map(|id| short_id(&id).to_string()).unwrap_or_default(),
            state,
        }
    }

    /// Removes the container. Closing a container twice is a no-op.
    pub async fn remove(&self) -> Result<(), VirtualError> {
        let mut id = self.id.lock().await;
        if let Some(existing) = id.take() {
            if let Err(error) = self.runtime.remove(&existing).await {
                *id = Some(existing);
                return Err(error);
            }
            debug! {
                id = short_id(&existing),
                "removed container"
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Closer for Container {
    async fn close(&self) -> eyre::Result<()> {
        self.remove().await?;
        Ok(())
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
