// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

pub(crate) mod account;
pub(crate) mod challenges;
pub(crate) mod gateway;
pub(crate) mod lab;
pub(crate) mod scores;
