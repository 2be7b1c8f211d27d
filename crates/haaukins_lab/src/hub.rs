// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::lab::Lab;
use crate::metrics::{HubLabels, HubMetrics};
use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::join_all;
use haaukins_virtual::Closer;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Builds labs for a hub.
#[async_trait]
pub trait LabCreator: Send + Sync {
    async fn create_lab(&self) -> Result<Lab, LabError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("maximum amount of allowed labs has been reached")]
    MaxLabs,
    #[error("no labs available in the queue")]
    NoAvailableLabs,
    #[error("the lab hub is suspended")]
    Suspended,
    #[error("the lab hub stopped building labs after repeated failures")]
    Broken,
    #[error("the lab hub has been closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    Running,
    Suspended,
    Closed,
    Error,
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Labs kept ready in the queue
    pub available: usize,
    /// Labs ever built, failed builds excluded
    pub capacity: usize,
    /// Concurrent builders
    pub creation_limit: usize,
    /// Failed builds after which the hub gives up
    pub failure_threshold: usize,
}

impl HubOptions {
    pub fn new(available: usize, capacity: usize) -> Self {
        HubOptions {
            available,
            capacity,
            creation_limit: 3,
            failure_threshold: 10,
        }
    }
}

#[derive(Default)]
struct HubState {
    built: usize,
    in_flight: usize,
    failures: usize,
}

struct HubInner {
    creator: Arc<dyn LabCreator>,
    options: HubOptions,
    labels: HubLabels,
    sender: flume::Sender<Lab>,
    receiver: flume::Receiver<Lab>,
    state: Mutex<HubState>,
    status: watch::Sender<HubStatus>,
    creation_limit: Semaphore,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    idle: Notify,
    metrics: HubMetrics,
}

/// A pool of started labs for one event. Builders run in the background, keeping `available`
/// labs queued until `capacity` labs have been built. Labs leave the hub in the order they were
/// queued.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(
        creator: Arc<dyn LabCreator>,
        options: HubOptions,
        event: &str,
        metrics: HubMetrics,
    ) -> Hub {
        let (sender, receiver) = flume::bounded(options.available.max(1));
        let inner = Arc::new(HubInner {
            creator,
            creation_limit: Semaphore::new(options.creation_limit.max(1)),
            options,
            labels: HubLabels {
                event: event.to_string(),
            },
            sender,
            receiver,
            state: Mutex::new(HubState::default()),
            status: watch::Sender::new(HubStatus::Running),
            cancellation_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            idle: Notify::new(),
            metrics,
        });
        inner.fill();
        Hub { inner }
    }

    pub fn status(&self) -> HubStatus {
        self.inner.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<HubStatus> {
        self.inner.status.subscribe()
    }

    pub fn available(&self) -> usize {
        self.inner.options.available
    }

    pub fn capacity(&self) -> usize {
        self.inner.options.capacity
    }

    /// Labs built and started so far.
    pub fn built(&self) -> usize {
        self.inner.state().built
    }

    pub fn failures(&self) -> usize {
        self.inner.state().failures
    }

    /// Labs ready to be taken.
    pub fn queued(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Takes a lab without waiting. [HubError::MaxLabs] means every lab has been built and
    /// handed out; labs still on their way to the queue give [HubError::NoAvailableLabs].
    pub fn get(&self) -> Result<Lab, HubError> {
        loop {
            match self.status() {
                HubStatus::Closed => return Err(HubError::Closed),
                HubStatus::Suspended => return Err(HubError::Suspended),
                HubStatus::Running | HubStatus::Error => {}
            }
            match self.inner.receiver.try_recv() {
                Ok(lab) => {
                    self.inner.on_receive();
                    return Ok(lab);
                }
                Err(flume::TryRecvError::Disconnected) => return Err(HubError::Closed),
                Err(flume::TryRecvError::Empty) => {}
            }

            // Builders leave `in_flight` only after queueing their lab
            let state = self.inner.state();
            if !self.inner.receiver.is_empty() {
                continue;
            }
            return if state.built >= self.inner.options.capacity && state.in_flight == 0 {
                Err(HubError::MaxLabs)
            } else if self.status() == HubStatus::Error {
                Err(HubError::Broken)
            } else {
                Err(HubError::NoAvailableLabs)
            };
        }
    }

    /// Waits for the next lab. Waits through suspension and returns `None` once the hub is
    /// closed.
    pub async fn next(&self) -> Option<Lab> {
        let mut status = self.inner.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                HubStatus::Closed => return None,
                HubStatus::Suspended => status.changed().await.ok()?,
                HubStatus::Running | HubStatus::Error => {
                    select! {
                        lab = self.inner.receiver.recv_async() => {
                            let lab = lab.ok()?;
                            self.inner.on_receive();
                            return Some(lab);
                        }
                        changed = status.changed() => changed.ok()?,
                    }
                }
            }
        }
    }

    /// Stops new builds and waits up to `timeout` for running builders. Queued labs are kept.
    pub async fn suspend(&self, timeout: Duration) {
        let suspended = self.inner.status.send_if_modified(|status| {
            let running = *status == HubStatus::Running;
            if running {
                *status = HubStatus::Suspended;
            }
            running
        });
        if !suspended {
            return;
        }

        let idle = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.inner.state().in_flight == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, idle).await.is_err() {
            warn! {
                event = %self.inner.labels.event,
                "builders still running after suspension timeout"
            }
        }
        info!(event = %self.inner.labels.event, "suspended lab hub");
    }

    pub fn resume(&self) {
        let resumed = self.inner.status.send_if_modified(|status| {
            let suspended = *status == HubStatus::Suspended;
            if suspended {
                *status = HubStatus::Running;
            }
            suspended
        });
        if resumed {
            info!(event = %self.inner.labels.event, "resumed lab hub");
            self.inner.fill();
        }
    }
}

impl HubInner {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> HubStatus {
        *self.status.borrow()
    }

    fn on_receive(self: &Arc<Self>) {
        self.metrics.handed_out.get_or_create(&self.labels).inc();
        self.fill();
    }

    /// Spawns builders until the queue and the running builders cover `available`, without
    /// going over `capacity`.
    fn fill(self: &Arc<Self>) {
        if self.status() != HubStatus::Running {
            return;
        }
        let mut state = self.state();
        while self.receiver.len() + state.in_flight < self.options.available
            && state.built + state.in_flight < self.options.capacity
        {
            state.in_flight += 1;
            let hub = self.clone();
            self.tracker.spawn(async move { hub.build().await });
        }
    }

    async fn build(self: Arc<Self>) {
        if let Some(lab) = self.create().await {
            if self.cancellation_token.is_cancelled() {
                close_lab(&lab).await;
            } else if let Err(error) = self.sender.send_async(lab).await {
                close_lab(&error.into_inner()).await;
            }
        }

        {
            let mut state = self.state();
            state.in_flight -= 1;
            if state.in_flight == 0 {
                self.idle.notify_waiters();
            }
        }
        self.fill();
    }

    async fn create(&self) -> Option<Lab> {
        let _permit = select! {
            _ = self.cancellation_token.cancelled() => return None,
            permit = self.creation_limit.acquire() => permit.ok()?,
        };
        if self.status() != HubStatus::Running {
            return None;
        }

        let lab = match self.creator.create_lab().await {
            Ok(lab) => lab,
            Err(error) => {
                self.failed(error);
                return None;
            }
        };
        if let Err(error) = lab.start().await {
            close_lab(&lab).await;
            self.failed(error);
            return None;
        }

        let built = {
            let mut state = self.state();
            state.built += 1;
            state.built
        };
        self.metrics.built.get_or_create(&self.labels).inc();
        debug! {
            event = %self.labels.event,
            lab = %lab.tag(),
            built,
            "built lab"
        }
        Some(lab)
    }

    fn failed(&self, error: LabError) {
        self.metrics.failures.get_or_create(&self.labels).inc();
        let failures = {
            let mut state = self.state();
            state.failures += 1;
            state.failures
        };
        warn! {
            ?error,
            event = %self.labels.event,
            failures,
            "unable to build lab"
        }

        if failures >= self.options.failure_threshold {
            let broken = self.status.send_if_modified(|status| {
                let running = *status == HubStatus::Running;
                if running {
                    *status = HubStatus::Error;
                }
                running
            });
            if broken {
                error! {
                    event = %self.labels.event,
                    failures,
                    "lab hub stopped building after repeated failures"
                }
            }
        }
    }
}

async fn close_lab(lab: &Lab) {
    if let Err(error) = lab.close().await {
        warn!(?error, lab = %lab.tag(), "unable to close lab");
    }
}

#[async_trait]
impl Closer for Hub {
    /// Cancels the builders, waits for them and closes every queued lab.
    async fn close(&self) -> eyre::Result<()> {
        if self.inner.status.send_replace(HubStatus::Closed) == HubStatus::Closed {
            return Ok(());
        }
        self.inner.cancellation_token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let labs: Vec<Lab> = self.inner.receiver.drain().collect();
        join_all(labs.iter().map(close_lab)).await;
        info! {
            event = %self.inner.labels.event,
            closed = labs.len(),
            "closed lab hub"
        }
        Ok(())
    }
}
