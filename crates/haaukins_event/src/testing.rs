// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! An in-memory gateway and fixtures for building events on fake drivers.

use crate::catalog::{Catalog, MemoryCatalog};
use crate::event::{Event, EventOptions};
use crate::gateway::{Gateway, GatewayError, GatewayUser, RdpConnection};
use crate::keylog::KeyLoggerPool;
use crate::store::EventStore;
use crate::team::Team;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use color_eyre::eyre;
use haaukins_common::models::{
    ChallengeConfig, EventConfig, EventStatus, ExerciseConfig, FrontendConfig, InstanceConfig,
    LabSpec, RecordConfig,
};
use haaukins_common::Tag;
use haaukins_lab::hub::HubOptions;
use haaukins_lab::metrics::HubMetrics;
use haaukins_lab::{FrontendSettings, Hub, LabBuilder, LabConfig, LabContext};
use haaukins_virtual::testing::{FakeHypervisor, FakeRuntime};
use haaukins_virtual::vm::VmLibrary;
use haaukins_virtual::Closer;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct GatewayState {
    started: bool,
    closed: usize,
    fail_start: bool,
    users: Vec<GatewayUser>,
    connections: Vec<RdpConnection>,
}

/// A [Gateway] recording users and connections in memory.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    web_port: AtomicU16,
}

impl FakeGateway {
    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started(&self) -> bool {
        self.state().started
    }

    pub fn closed(&self) -> usize {
        self.state().closed
    }

    pub fn fail_start(&self) {
        self.state().fail_start = true;
    }

    pub fn users(&self) -> Vec<GatewayUser> {
        self.state().users.clone()
    }

    pub fn connections(&self) -> Vec<RdpConnection> {
        self.state().connections.clone()
    }

    pub fn set_web_port(&self, port: u16) {
        self.web_port.store(port, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn start(&self) -> Result<(), GatewayError> {
        let mut state = self.state();
        if state.fail_start {
            return Err(GatewayError::NotReady);
        }
        state.started = true;
        Ok(())
    }

    async fn create_user(&self, user: &GatewayUser) -> Result<(), GatewayError> {
        let mut state = self.state();
        if state.users.iter().any(|u| u.username == user.username) {
            return Err(GatewayError::Remote("User already exists".to_string()));
        }
        state.users.push(user.clone());
        Ok(())
    }

    async fn create_rdp_conn(&self, conn: &RdpConnection) -> Result<(), GatewayError> {
        let conn = conn.clone().normalized()?;
        self.state().connections.push(conn);
        Ok(())
    }

    async fn raw_login(&self, user: &GatewayUser) -> Result<String, GatewayError> {
        let state = self.state();
        if !state.users.contains(user) {
            return Err(GatewayError::UnexpectedStatus(403));
        }
        Ok(json!({
            "authToken": format!("token-{}", user.username),
            "username": user.username,
            "dataSource": "mysql",
        })
        .to_string())
    }

    fn web_port(&self) -> u16 {
        self.web_port.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Closer for FakeGateway {
    async fn close(&self) -> eyre::Result<()> {
        self.state().closed += 1;
        Ok(())
    }
}

/// A team hashed with the cheapest bcrypt cost. Its password is `password`.
pub fn quick_team(name: &str) -> Team {
    Team::with_cost(&format!("{name}@example.org"), name, "password", 4)
        .unwrap_or_else(|error| panic!("unable to create team {name}: {error}"))
}

fn tag(value: &str) -> Tag {
    Tag::new(value).unwrap_or_else(|error| panic!("{error}"))
}

/// An exercise of one container publishing `<tag>.hkn` with a dynamic flag in `APP_FLAG`.
pub fn exercise(name: &str, image: &str) -> ExerciseConfig {
    ExerciseConfig {
        tags: vec![tag(name)],
        name: name.to_uppercase(),
        instances: vec![InstanceConfig {
            image: image.to_string(),
            records: vec![RecordConfig {
                name: format!("{name}.hkn"),
                kind: "A".to_string(),
                rdata: String::new(),
            }],
            flags: vec![ChallengeConfig {
                tag: tag(name),
                name: format!("{name} challenge"),
                env_var: Some("APP_FLAG".to_string()),
                static_flag: None,
                points: 10,
            }],
            ..Default::default()
        }],
    }
}

pub fn frontend() -> FrontendConfig {
    FrontendConfig {
        image: "kali.ova".to_string(),
        memory_mb: 0,
        cpu: 0,
    }
}

pub fn event_config(event: &str, available: usize, capacity: usize) -> EventConfig {
    let now = Utc::now();
    EventConfig {
        tag: tag(event),
        name: event.to_uppercase(),
        available,
        capacity,
        lab: LabSpec {
            frontends: vec![frontend()],
            exercises: vec![tag("ftp")],
        },
        started_at: now,
        finish_expected: now + Duration::days(15),
        finished_at: None,
        status: EventStatus::Running,
        secret_key: None,
        created_by: "admin".to_string(),
    }
}

/// Fake drivers and a VM library holding `kali.ova`.
pub struct TestDrivers {
    pub runtime: Arc<FakeRuntime>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub context: LabContext,
    pub dir: tempfile::TempDir,
}

pub fn drivers() -> TestDrivers {
    let dir = tempfile::tempdir().unwrap_or_else(|error| panic!("{error}"));
    std::fs::write(dir.path().join("kali.ova"), b"kali").unwrap_or_else(|error| panic!("{error}"));

    let runtime = Arc::new(FakeRuntime::default());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let context = LabContext {
        runtime: runtime.clone(),
        library: Arc::new(VmLibrary::new(hypervisor.clone(), dir.path())),
        host_ip: "172.17.0.1".to_string(),
        settings: FrontendSettings::default(),
    };
    TestDrivers {
        runtime,
        hypervisor,
        context,
        dir,
    }
}

pub struct TestEvent {
    pub event: Arc<Event>,
    pub gateway: Arc<FakeGateway>,
    pub catalog: Arc<MemoryCatalog>,
    pub drivers: TestDrivers,
}

/// An event named `demo` whose labs hold the `ftp` exercise and one `kali.ova` frontend.
pub async fn test_event(available: usize, capacity: usize) -> TestEvent {
    test_event_with(event_config("demo", available, capacity), vec![exercise("ftp", "aau/ftp")])
        .await
}

pub async fn test_event_with(config: EventConfig, exercises: Vec<ExerciseConfig>) -> TestEvent {
    let drivers = drivers();
    let catalog = Arc::new(MemoryCatalog::default());
    catalog
        .add_event(&config)
        .await
        .unwrap_or_else(|error| panic!("{error}"));

    let lab_config = LabConfig {
        frontends: config.lab.frontends.clone(),
        exercises,
    };
    let hub = Hub::new(
        Arc::new(LabBuilder::new(drivers.context.clone(), lab_config)),
        HubOptions::new(config.available, config.capacity),
        config.tag.as_str(),
        HubMetrics::default(),
    );
    let gateway = Arc::new(FakeGateway::default());
    let event = Event::new(EventOptions {
        store: EventStore::new(config, catalog.clone()),
        hub,
        gateway: gateway.clone(),
        keylogger: KeyLoggerPool::disabled(),
        host_ip: "172.17.0.1".to_string(),
        signing_key: "signing-key".to_string(),
    })
    .unwrap_or_else(|error| panic!("{error}"));

    TestEvent {
        event,
        gateway,
        catalog,
        drivers,
    }
}

/// Waits until the hub has `count` labs queued.
pub async fn wait_for_queued(hub: &Hub, count: usize) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while hub.queued() < count {
        if tokio::time::Instant::now() > deadline {
            panic!("hub queued {} labs, expected {count}", hub.queued());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Serves `router` on a free loopback port until the test ends.
pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|error| panic!("{error}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|error| panic!("{error}"));
    tokio::spawn(async move { axum::serve(listener, router).await });
    addr
}

/// Opens a WebSocket to `path` on `addr`. Close frames are handed to the caller unanswered.
pub async fn connect_websocket(
    addr: SocketAddr,
    path: &str,
) -> fastwebsockets::WebSocket<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>> {
    use axum::http::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};

    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .unwrap_or_else(|error| panic!("{error}"));
    let req = hyper::Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, format!("demo.localhost:{}", addr.port()))
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, fastwebsockets::handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13")
        .body(http_body_util::Empty::<hyper::body::Bytes>::new())
        .unwrap_or_else(|error| panic!("{error}"));
    let (mut ws, _) =
        fastwebsockets::handshake::client(&hyper_util::rt::TokioExecutor::new(), req, stream)
            .await
            .unwrap_or_else(|error| panic!("{error}"));
    ws.set_auto_close(false);
    ws
}
