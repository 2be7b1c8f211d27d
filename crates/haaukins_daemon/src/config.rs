// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use clap_derive::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
#[group(skip)]
pub struct Config {
    /// The socket address event portals are served on
    #[arg(env, long, default_value = "[::]:8080")]
    pub(crate) http_listen: String,
}
