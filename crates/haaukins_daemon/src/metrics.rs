// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct RouterLabels {
    pub event: String,
    pub outcome: String,
}

pub(crate) const ROUTED: &str = "routed";
pub(crate) const NOT_FOUND: &str = "not_found";

#[derive(Clone, Default)]
pub(crate) struct RouterMetrics {
    pub requests: Family<RouterLabels, Counter>,
}

impl RouterMetrics {
    pub(crate) fn register(&self, registry: &mut Registry) {
        registry.register(
            "haaukins_router_requests",
            "The number of requests received by the event router",
            self.requests.clone(),
        );
    }

    pub(crate) fn record(&self, event: &str, outcome: &str) {
        self.requests
            .get_or_create(&RouterLabels {
                event: event.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
