// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Drivers for the container runtime and the hypervisor, and the resources built on top of them:
//! containers, lab networks and linked-clone VMs.

mod command;
pub mod container;
pub mod network;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vm;

use async_trait::async_trait;
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum VirtualError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{action} timed out")]
    Timeout { action: String },
    #[error("{action} failed: {output}")]
    Command { action: String, output: String },
    #[error("instance has not been created")]
    NotCreated,
    #[error("no available ip addresses in the network")]
    NoAvailableIps,
    #[error("ip address octet {0} is already in use")]
    IpInUse(u8),
    #[error("the subnet {0} overlaps with an existing network")]
    SubnetOverlap(String),
    #[error("unable to find a free subnet")]
    NoFreeSubnet,
    #[error("unexpected runtime response: {0}")]
    Unexpected(String),
}

/// The capability shared by everything a lab or an event tears down.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> eyre::Result<()>;
}

#[derive(Debug, Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum InstanceState {
    Running = 0,
    Stopped = 1,
    Suspended = 2,
    Error = 3,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Docker,
    Vbox,
}

/// A snapshot of a container or VM, as reported in team information.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct InstanceInfo {
    pub image: String,
    #[serde(rename = "type")]
    pub kind: InstanceKind,
    pub id: String,
    pub state: InstanceState,
}

/// Asks the OS for a free TCP port. The port is released before returning, so a concurrent
/// caller may still race for it.
pub async fn get_available_port() -> Result<u16, VirtualError> {
    let listener = TcpListener::bind("0.0.0.0:0").await?;
    Ok(listener.local_addr()?.port())
}
