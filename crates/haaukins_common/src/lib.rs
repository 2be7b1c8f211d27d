// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

pub mod flag;
pub mod models;
#[cfg(feature = "server")]
pub mod server;
pub mod tag;

pub use flag::Flag;
pub use tag::{Tag, ValidationError};
