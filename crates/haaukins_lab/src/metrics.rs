// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HubLabels {
    pub event: String,
}

/// Counters shared by the hubs of every event. Cloning shares the underlying families.
#[derive(Clone, Default)]
pub struct HubMetrics {
    pub built: Family<HubLabels, Counter>,
    pub failures: Family<HubLabels, Counter>,
    pub handed_out: Family<HubLabels, Counter>,
}

impl HubMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "haaukins_hub_labs_built",
            "The number of labs built and started",
            self.built.clone(),
        );
        registry.register(
            "haaukins_hub_build_failures",
            "The number of failed lab builds",
            self.failures.clone(),
        );
        registry.register(
            "haaukins_hub_labs_handed_out",
            "The number of labs taken from the hub",
            self.handed_out.clone(),
        );
    }
}
