// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::DaemonError;
use axum::Router;
use haaukins_common::Tag;
use haaukins_event::Event;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct PoolState {
    host: String,
    events: HashMap<Tag, Arc<Event>>,
    handlers: HashMap<Tag, Router>,
}

/// The running events, and the portal of each served on `<event-tag>.<host>`.
pub struct EventPool {
    state: RwLock<PoolState>,
}

impl EventPool {
    pub fn new(host: impl Into<String>) -> EventPool {
        EventPool {
            state: RwLock::new(PoolState {
                host: host.into(),
                events: HashMap::new(),
                handlers: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host(&self) -> String {
        self.state().host.clone()
    }

    /// Re-seats the base host. Events keep their tags.
    pub fn set_host(&self, host: impl Into<String>) {
        self.state_mut().host = host.into();
    }

    pub fn add_event(&self, event: Arc<Event>) -> Result<(), DaemonError> {
        let tag = event.tag();
        let mut state = self.state_mut();
        if state.events.contains_key(&tag) {
            return Err(DaemonError::DuplicateEvent(tag));
        }
        state.handlers.insert(tag.clone(), event.handler());
        state.events.insert(tag, event);
        Ok(())
    }

    pub fn remove_event(&self, tag: &str) -> Result<Arc<Event>, DaemonError> {
        let mut state = self.state_mut();
        let event = state
            .events
            .remove(tag)
            .ok_or_else(|| DaemonError::UnknownEvent(tag.to_string()))?;
        state.handlers.remove(tag);
        Ok(event)
    }

    pub fn get_event(&self, tag: &str) -> Result<Arc<Event>, DaemonError> {
        self.state()
            .events
            .get(tag)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownEvent(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.state().events.contains_key(tag)
    }

    /// Events ordered by tag.
    pub fn events(&self) -> Vec<Arc<Event>> {
        let mut events: Vec<Arc<Event>> = self.state().events.values().cloned().collect();
        events.sort_by_key(|event| event.tag());
        events
    }

    /// Empties the pool.
    pub fn drain(&self) -> Vec<Arc<Event>> {
        let mut state = self.state_mut();
        state.handlers.clear();
        state.events.drain().map(|(_, event)| event).collect()
    }

    /// The event and portal a request for `host` goes to. The host must be an event tag followed
    /// by the base host, optionally with a port.
    pub fn route(&self, host: &str) -> Option<(Tag, Router)> {
        let host = host.to_lowercase();
        let (sub, domain) = host.split_once('.')?;
        let state = self.state();
        let base = state.host.to_lowercase();
        if domain != base && strip_port(domain) != base {
            return None;
        }
        let tag = Tag::new(sub).ok()?;
        let handler = state.handlers.get(&tag)?.clone();
        Some((tag, handler))
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
