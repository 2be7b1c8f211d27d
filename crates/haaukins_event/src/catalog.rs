// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! The durable record of events, teams and solves. Events are reloaded from it on startup.

use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haaukins_common::models::{EventConfig, EventStatus};
use haaukins_common::Tag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SolvedChallenge {
    pub tag: Tag,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TeamRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_access: Option<DateTime<Utc>>,
    #[serde(default)]
    pub solved: Vec<SolvedChallenge>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn add_event(&self, config: &EventConfig) -> Result<(), StoreError>;
    async fn add_team(&self, event: &Tag, team: &TeamRecord) -> Result<(), StoreError>;
    async fn get_event_teams(&self, event: &Tag) -> Result<Vec<TeamRecord>, StoreError>;
    async fn update_team_solved_challenge(
        &self,
        event: &Tag,
        team_id: &str,
        solved: &SolvedChallenge,
    ) -> Result<(), StoreError>;
    async fn update_team_last_access(
        &self,
        event: &Tag,
        team_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn update_event_status(&self, event: &Tag, status: EventStatus)
        -> Result<(), StoreError>;
    /// Marks the event as finished and moves it to `archive_tag`, freeing its tag.
    async fn update_event_finish_date(
        &self,
        event: &Tag,
        archive_tag: &Tag,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn unfinished_events(&self) -> Result<Vec<EventConfig>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CatalogEntry {
    config: EventConfig,
    #[serde(default)]
    teams: Vec<TeamRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct CatalogState {
    events: BTreeMap<Tag, CatalogEntry>,
}

impl CatalogState {
    fn entry(&mut self, event: &Tag) -> Result<&mut CatalogEntry, StoreError> {
        self.events
            .get_mut(event)
            .ok_or_else(|| StoreError::UnknownEvent(event.to_string()))
    }

    fn team(&mut self, event: &Tag, team_id: &str) -> Result<&mut TeamRecord, StoreError> {
        self.entry(event)?
            .teams
            .iter_mut()
            .find(|team| team.id == team_id)
            .ok_or_else(|| StoreError::UnknownTeam(team_id.to_string()))
    }

    fn add_event(&mut self, config: &EventConfig) -> Result<(), StoreError> {
        if self.events.contains_key(&config.tag) {
            return Err(StoreError::DuplicateEvent(config.tag.to_string()));
        }
        self.events.insert(
            config.tag.clone(),
            CatalogEntry {
                config: config.clone(),
                teams: Vec::new(),
            },
        );
        Ok(())
    }

    fn add_team(&mut self, event: &Tag, team: &TeamRecord) -> Result<(), StoreError> {
        let entry = self.entry(event)?;
        if entry.teams.iter().any(|existing| existing.id == team.id) {
            return Err(StoreError::TeamAlreadyExists);
        }
        entry.teams.push(team.clone());
        Ok(())
    }

    fn solve(
        &mut self,
        event: &Tag,
        team_id: &str,
        solved: &SolvedChallenge,
    ) -> Result<(), StoreError> {
        let team = self.team(event, team_id)?;
        match team.solved.iter_mut().find(|s| s.tag == solved.tag) {
            Some(existing) => existing.completed_at = solved.completed_at,
            None => team.solved.push(solved.clone()),
        }
        Ok(())
    }

    fn finish(
        &mut self,
        event: &Tag,
        archive_tag: &Tag,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.events.contains_key(archive_tag) {
            return Err(StoreError::DuplicateEvent(archive_tag.to_string()));
        }
        let mut entry = self
            .events
            .remove(event)
            .ok_or_else(|| StoreError::UnknownEvent(event.to_string()))?;
        entry.config.tag = archive_tag.clone();
        entry.config.finished_at = Some(finished_at);
        entry.config.status = EventStatus::Closed;
        self.events.insert(archive_tag.clone(), entry);
        Ok(())
    }

    fn unfinished(&self) -> Vec<EventConfig> {
        self.events
            .values()
            .filter(|entry| entry.config.finished_at.is_none())
            .map(|entry| entry.config.clone())
            .collect()
    }
}

/// A catalog that lives and dies with the process.
#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn add_event(&self, config: &EventConfig) -> Result<(), StoreError> {
        self.state.write().await.add_event(config)
    }

    async fn add_team(&self, event: &Tag, team: &TeamRecord) -> Result<(), StoreError> {
        self.state.write().await.add_team(event, team)
    }

    async fn get_event_teams(&self, event: &Tag) -> Result<Vec<TeamRecord>, StoreError> {
        let state = self.state.read().await;
        state
            .events
            .get(event)
            .map(|entry| entry.teams.clone())
            .ok_or_else(|| StoreError::UnknownEvent(event.to_string()))
    }

    async fn update_team_solved_challenge(
        &self,
        event: &Tag,
        team_id: &str,
        solved: &SolvedChallenge,
    ) -> Result<(), StoreError> {
        self.state.write().await.solve(event, team_id, solved)
    }

    async fn update_team_last_access(
        &self,
        event: &Tag,
        team_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state.write().await.team(event, team_id)?.last_access = Some(at);
        Ok(())
    }

    async fn update_event_status(
        &self,
        event: &Tag,
        status: EventStatus,
    ) -> Result<(), StoreError> {
        self.state.write().await.entry(event)?.config.status = status;
        Ok(())
    }

    async fn update_event_finish_date(
        &self,
        event: &Tag,
        archive_tag: &Tag,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .finish(event, archive_tag, finished_at)
    }

    async fn unfinished_events(&self) -> Result<Vec<EventConfig>, StoreError> {
        Ok(self.state.read().await.unfinished())
    }
}

/// A catalog persisted as a JSON document. Every update rewrites the file through a temporary
/// sibling, so a crash leaves either the old or the new document behind.
pub struct JsonFileCatalog {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl JsonFileCatalog {
    /// Opens the catalog at `path`, starting empty if the file does not exist yet.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<JsonFileCatalog, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(error) => return Err(error.into()),
        };
        Ok(JsonFileCatalog {
            path,
            state: Mutex::new(state),
        })
    }

    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CatalogState) -> Result<(), StoreError>,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        change(&mut next)?;

        let content = serde_json::to_vec_pretty(&next)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = ?self.path, "persisted catalog");

        *state = next;
        Ok(())
    }
}

#[async_trait]
impl Catalog for JsonFileCatalog {
    async fn add_event(&self, config: &EventConfig) -> Result<(), StoreError> {
        self.update(|state| state.add_event(config)).await
    }

    async fn add_team(&self, event: &Tag, team: &TeamRecord) -> Result<(), StoreError> {
        self.update(|state| state.add_team(event, team)).await
    }

    async fn get_event_teams(&self, event: &Tag) -> Result<Vec<TeamRecord>, StoreError> {
        let state = self.state.lock().await;
        state
            .events
            .get(event)
            .map(|entry| entry.teams.clone())
            .ok_or_else(|| StoreError::UnknownEvent(event.to_string()))
    }

    async fn update_team_solved_challenge(
        &self,
        event: &Tag,
        team_id: &str,
        solved: &SolvedChallenge,
    ) -> Result<(), StoreError> {
        self.update(|state| state.solve(event, team_id, solved))
            .await
    }

    async fn update_team_last_access(
        &self,
        event: &Tag,
        team_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update(|state| {
            state.team(event, team_id)?.last_access = Some(at);
            Ok(())
        })
        .await
    }

    async fn update_event_status(
        &self,
        event: &Tag,
        status: EventStatus,
    ) -> Result<(), StoreError> {
        self.update(|state| {
            state.entry(event)?.config.status = status;
            Ok(())
        })
        .await
    }

    async fn update_event_finish_date(
        &self,
        event: &Tag,
        archive_tag: &Tag,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update(|state| state.finish(event, archive_tag, finished_at))
            .await
    }

    async fn unfinished_events(&self) -> Result<Vec<EventConfig>, StoreError> {
        Ok(self.state.lock().await.unfinished())
    }
}
