// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! A CTF event: its teams and their labs, the RDP gateway, and the portal teams sign up on.

pub mod catalog;
pub mod event;
pub mod gateway;
pub mod keylog;
mod portal;
mod proxy;
pub mod store;
pub mod team;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod token;

pub use catalog::{Catalog, JsonFileCatalog, MemoryCatalog};
pub use event::{Event, EventOptions};
pub use store::{EventStore, StoreError};
pub use team::Team;

use gateway::GatewayError;
use haaukins_lab::{HubError, LabError};

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("error too few rdp connections")]
    RdpConf,
    #[error("unable to start the gateway: {0}")]
    StartingGateway(#[source] GatewayError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lab(#[from] LabError),
    #[error("the lab hub is broken")]
    Broken,
    #[error("no labs available, try again in a moment")]
    NoAvailableLabs,
    #[error("maximum amount of allowed labs has been reached")]
    MaxLabs,
    #[error("the event is suspended")]
    Suspended,
    #[error("the event has been closed")]
    Closed,
    #[error("team {0} has no lab")]
    NoLab(String),
}

impl From<HubError> for EventError {
    fn from(error: HubError) -> Self {
        match error {
            HubError::MaxLabs => EventError::MaxLabs,
            HubError::NoAvailableLabs => EventError::NoAvailableLabs,
            HubError::Suspended => EventError::Suspended,
            HubError::Broken => EventError::Broken,
            HubError::Closed => EventError::Closed,
        }
    }
}
