// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::exercises::ExerciseLibrary;
use crate::orchestrator::{
    CreateEventRequest, GatewayProvider, Orchestrator, OrchestratorOptions,
};
use crate::pool::EventPool;
use async_trait::async_trait;
use haaukins_common::Tag;
use haaukins_event::gateway::{Gateway, GatewayError};
use haaukins_event::testing::{drivers, exercise, frontend, FakeGateway, TestDrivers};
use haaukins_event::MemoryCatalog;
use haaukins_lab::metrics::HubMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Hands out a [FakeGateway] per event.
#[derive(Default)]
pub(crate) struct FakeGateways {
    gateways: Mutex<HashMap<Tag, Arc<FakeGateway>>>,
    fail_start: AtomicBool,
}

impl FakeGateways {
    pub(crate) fn of(&self, event: &str) -> Arc<FakeGateway> {
        self.gateways
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_else(|| panic!("no gateway for {event}"))
    }

    /// Gateways handed out from now on fail to start.
    pub(crate) fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GatewayProvider for FakeGateways {
    async fn gateway(&self, event: &Tag) -> Result<Arc<dyn Gateway>, GatewayError> {
        let gateway = Arc::new(FakeGateway::default());
        if self.fail_start.load(Ordering::SeqCst) {
            gateway.fail_start();
        }
        self.gateways
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.clone(), gateway.clone());
        Ok(gateway)
    }
}

pub(crate) struct TestOrchestrator {
    pub orchestrator: Orchestrator,
    pub gateways: Arc<FakeGateways>,
    pub catalog: Arc<MemoryCatalog>,
    pub drivers: TestDrivers,
}

/// An orchestrator on fake drivers knowing the `ftp` and `sql` exercises.
pub(crate) fn test_orchestrator() -> TestOrchestrator {
    test_orchestrator_with(Arc::new(MemoryCatalog::default()))
}

pub(crate) fn test_orchestrator_with(catalog: Arc<MemoryCatalog>) -> TestOrchestrator {
    let drivers = drivers();
    let gateways = Arc::new(FakeGateways::default());
    let exercises = ExerciseLibrary::new(vec![
        exercise("ftp", "aau/ftp"),
        exercise("sql", "aau/sql"),
    ])
    .unwrap_or_else(|error| panic!("{error}"));
    let orchestrator = Orchestrator::new(
        Arc::new(EventPool::new("localhost")),
        OrchestratorOptions {
            context: drivers.context.clone(),
            catalog: catalog.clone(),
            gateways: gateways.clone(),
            exercises,
            log_dir: None,
            signing_key: "signing-key".to_string(),
            hub_metrics: HubMetrics::default(),
        },
    );
    TestOrchestrator {
        orchestrator,
        gateways,
        catalog,
        drivers,
    }
}

pub(crate) fn create_request(
    tag: &str,
    exercises: &[&str],
    available: usize,
    capacity: usize,
) -> CreateEventRequest {
    CreateEventRequest {
        tag: tag.to_string(),
        name: tag.to_uppercase(),
        available,
        capacity,
        frontends: vec![frontend()],
        exercises: exercises.iter().map(|tag| tag.to_string()).collect(),
        created_by: "admin".to_string(),
        ..Default::default()
    }
}

/// Collects what was sent on a progress channel so far.
pub(crate) fn drain<T>(rx: &flume::Receiver<T>) -> Vec<T> {
    rx.drain().collect()
}
