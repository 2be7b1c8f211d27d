// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Per-team labs: the lab network with its DHCP and DNS services, exercises, desktop frontends,
//! and the hub keeping labs warm for an event.

pub mod dhcp;
pub mod dns;
pub mod environment;
pub mod exercise;
pub mod hub;
pub mod lab;
pub mod metrics;
#[cfg(test)]
mod testing;

pub use environment::Environment;
pub use hub::{Hub, HubError, HubStatus, LabCreator};
pub use lab::{FrontendSettings, Lab, LabBuilder, LabConfig, LabContext};

use haaukins_common::{Tag, ValidationError};
use haaukins_virtual::VirtualError;

#[derive(thiserror::Error, Debug)]
pub enum LabError {
    #[error(transparent)]
    Virtual(#[from] VirtualError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no tags, need at least one tag")]
    MissingTags,
    #[error("tag {0} already exists")]
    DuplicateTag(Tag),
    #[error("unknown tag {0}")]
    UnknownTag(String),
    #[error("the lab has been closed")]
    Closed,
}
