// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

pub mod runtime;
