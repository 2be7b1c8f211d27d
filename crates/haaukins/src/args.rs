// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use clap_derive::{Args, Parser};

/// A self-service platform for Capture-the-Flag training events
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// The path to the configuration file
    #[arg(env, long, default_value = "config.toml", value_name = "CONFIG_FILE")]
    pub config_file: String,

    #[command(flatten, next_help_heading = "Component selection options")]
    pub components: Components,

    #[cfg(feature = "daemon")]
    #[command(flatten, next_help_heading = "Daemon configuration options")]
    pub daemon: haaukins_daemon::config::Config,

    #[cfg(feature = "metrics")]
    #[command(flatten, next_help_heading = "Metrics exporter configuration options")]
    pub metrics: OpenMetricsConfig,
}

/// Components
#[derive(Args, Debug)]
#[group()]
pub(crate) struct Components {
    /// Enable the default components for a simple single-instance setup
    #[arg(env, long)]
    pub single: bool,

    /// Enable the event daemon
    #[cfg(feature = "daemon")]
    #[arg(env, long)]
    pub enable_daemon: bool,

    /// Enable the OpenMetrics exporter
    #[cfg(feature = "metrics")]
    #[arg(env, long)]
    pub enable_metrics: bool,
}

#[cfg(feature = "metrics")]
#[derive(Args, Debug, Clone)]
#[group(skip)]
pub(crate) struct OpenMetricsConfig {
    /// The address the OpenMetrics exporter listens on
    #[arg(env, long, default_value = "[::]:9090")]
    pub openmetrics_listen: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn should_parse_component_flags() {
        let args = Args::try_parse_from(["haaukins", "--single", "--config-file", "haaukins.toml"])
            .unwrap();
        assert!(args.components.single);
        assert_eq!(args.config_file, "haaukins.toml");
        #[cfg(feature = "metrics")]
        assert_eq!(args.metrics.openmetrics_listen, "[::]:9090");
    }
}
