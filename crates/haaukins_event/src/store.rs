// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::catalog::{Catalog, SolvedChallenge};
use crate::team::Team;
use chrono::{DateTime, Utc};
use haaukins_common::models::{EventConfig, EventStatus};
use haaukins_common::Tag;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to encode the catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unable to hash the password: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("event {0} already exists")]
    DuplicateEvent(String),
    #[error("unknown team {0}")]
    UnknownTeam(String),
    #[error("email is already in use")]
    EmailAlreadyExists,
    #[error("team name is already taken")]
    TeamAlreadyExists,
    #[error("capacity reached for this event")]
    CapacityReached,
    #[error("unknown flag")]
    UnknownFlag,
    #[error("flag is already completed")]
    FlagAlreadyCompleted,
    #[error("challenge duplication")]
    ChallengeDuplicate,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ScoreChallenge {
    pub tag: Tag,
    pub name: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TeamScore {
    pub name: String,
    pub solved: BTreeMap<Tag, DateTime<Utc>>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Scoreboard {
    pub challenges: Vec<ScoreChallenge>,
    pub teams: Vec<TeamScore>,
}

#[derive(Default)]
struct TeamIndex {
    by_id: HashMap<String, Arc<Team>>,
    /// Lowercased name to id
    by_name: HashMap<String, String>,
    /// Ids in registration order
    order: Vec<String>,
}

/// The teams of one event, kept in memory and written through to the catalog.
pub struct EventStore {
    config: RwLock<EventConfig>,
    teams: RwLock<TeamIndex>,
    catalog: Arc<dyn Catalog>,
    changes: watch::Sender<u64>,
}

impl EventStore {
    pub fn new(config: EventConfig, catalog: Arc<dyn Catalog>) -> EventStore {
        EventStore {
            config: RwLock::new(config),
            teams: RwLock::new(TeamIndex::default()),
            catalog,
            changes: watch::Sender::new(0),
        }
    }

    /// Creates the store with the teams the catalog holds for the event.
    pub async fn load(
        config: EventConfig,
        catalog: Arc<dyn Catalog>,
    ) -> Result<EventStore, StoreError> {
        let records = catalog.get_event_teams(&config.tag).await?;
        let store = EventStore::new(config, catalog);
        {
            let mut index = store.index_mut();
            for record in records {
                let team = Team::from_record(record);
                index
                    .by_name
                    .insert(team.name().to_lowercase(), team.id().to_string());
                index.order.push(team.id().to_string());
                index.by_id.insert(team.id().to_string(), Arc::new(team));
            }
        }
        info! {
            event = %store.tag(),
            teams = store.team_count(),
            "loaded event teams"
        }
        Ok(store)
    }

    fn index(&self) -> std::sync::RwLockReadGuard<'_, TeamIndex> {
        self.teams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> std::sync::RwLockWriteGuard<'_, TeamIndex> {
        self.teams.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> EventConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tag(&self) -> Tag {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tag
            .clone()
    }

    pub fn status(&self) -> EventStatus {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub async fn set_status(&self, status: EventStatus) -> Result<(), StoreError> {
        let tag = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            if config.status == status {
                return Ok(());
            }
            config.status = status;
            config.tag.clone()
        };
        self.catalog.update_event_status(&tag, status).await
    }

    /// Records the end of the event and archives it under `archive_tag`. Returns `false` if the
    /// event had already finished. Nothing changes in memory when the catalog write fails.
    pub async fn finish(&self, archive_tag: &Tag) -> Result<bool, StoreError> {
        let (tag, finished_at, previous) = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            if config.finished_at.is_some() {
                return Ok(false);
            }
            let now = Utc::now();
            config.finished_at = Some(now);
            let previous = std::mem::replace(&mut config.status, EventStatus::Closed);
            (config.tag.clone(), now, previous)
        };
        if let Err(error) = self
            .catalog
            .update_event_finish_date(&tag, archive_tag, finished_at)
            .await
        {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.finished_at = None;
            config.status = previous;
            return Err(error);
        }
        Ok(true)
    }

    pub fn team_count(&self) -> usize {
        self.index().by_id.len()
    }

    /// Teams in registration order.
    pub fn teams(&self) -> Vec<Arc<Team>> {
        let index = self.index();
        index
            .order
            .iter()
            .filter_map(|id| index.by_id.get(id).cloned())
            .collect()
    }

    pub fn team(&self, id: &str) -> Result<Arc<Team>, StoreError> {
        self.index()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTeam(id.to_string()))
    }

    pub fn team_by_name(&self, name: &str) -> Option<Arc<Team>> {
        let index = self.index();
        index
            .by_name
            .get(&name.trim().to_lowercase())
            .and_then(|id| index.by_id.get(id).cloned())
    }

    /// Registers a new team. Names are unique regardless of case, and so are non-empty emails.
    /// Fails with [StoreError::CapacityReached] once the event holds `capacity` teams.
    pub async fn save_team(&self, team: Team) -> Result<Arc<Team>, StoreError> {
        let team = Arc::new(team);
        let name = team.name().to_lowercase();
        let capacity = self.config().capacity;
        {
            let mut index = self.index_mut();
            if index.by_id.len() >= capacity {
                return Err(StoreError::CapacityReached);
            }
            if index.by_name.contains_key(&name) {
                return Err(StoreError::TeamAlreadyExists);
            }
            if !team.email().is_empty()
                && index.by_id.values().any(|t| t.email() == team.email())
            {
                return Err(StoreError::EmailAlreadyExists);
            }
            index.by_name.insert(name.clone(), team.id().to_string());
            index.order.push(team.id().to_string());
            index.by_id.insert(team.id().to_string(), team.clone());
        }

        if let Err(error) = self.catalog.add_team(&self.tag(), &team.record()).await {
            let mut index = self.index_mut();
            index.by_name.remove(&name);
            index.order.retain(|id| id != team.id());
            index.by_id.remove(team.id());
            return Err(error);
        }

        info!(event = %self.tag(), team = %team.id(), "registered team");
        self.notify();
        Ok(team)
    }

    /// Checks a flag submission and records the solve. The solve is withdrawn when the catalog
    /// write fails, so the team can submit the flag again.
    pub async fn solve(
        &self,
        team_id: &str,
        tag: &str,
        flag: &str,
    ) -> Result<SolvedChallenge, StoreError> {
        let team = self.team(team_id)?;
        let solved = team.verify_flag(tag, flag)?;
        if let Err(error) = self
            .catalog
            .update_team_solved_challenge(&self.tag(), team_id, &solved)
            .await
        {
            team.withdraw_solve(&solved.tag);
            return Err(error);
        }
        info!(event = %self.tag(), team = %team_id, challenge = %solved.tag, "challenge solved");
        self.notify();
        Ok(solved)
    }

    pub async fn touch(&self, team_id: &str) -> Result<(), StoreError> {
        let at = self.team(team_id)?.touch();
        self.catalog
            .update_team_last_access(&self.tag(), team_id, at)
            .await
    }

    /// Wakes scoreboard subscribers.
    pub fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Teams ordered by solves, ties broken by who reached their count first.
    pub fn scoreboard(&self) -> Scoreboard {
        let teams = self.teams();
        let mut challenges: BTreeMap<Tag, String> = BTreeMap::new();
        let mut scores: Vec<TeamScore> = Vec::with_capacity(teams.len());
        for team in &teams {
            for challenge in team.challenges() {
                challenges.entry(challenge.tag).or_insert(challenge.name);
            }
            scores.push(TeamScore {
                name: team.name().to_string(),
                solved: team
                    .solved()
                    .into_iter()
                    .map(|solved| (solved.tag, solved.completed_at))
                    .collect(),
            });
        }
        scores.sort_by(|a, b| {
            b.solved
                .len()
                .cmp(&a.solved.len())
                .then_with(|| a.solved.values().max().cmp(&b.solved.values().max()))
        });

        Scoreboard {
            challenges: challenges
                .into_iter()
                .map(|(tag, name)| ScoreChallenge { tag, name })
                .collect(),
            teams: scores,
        }
    }
}
