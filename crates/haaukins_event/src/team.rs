// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::catalog::{SolvedChallenge, TeamRecord};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use haaukins_common::flag::flags_match;
use haaukins_common::models::Challenge;
use haaukins_common::{Flag, Tag};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A challenge as issued to one team.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TeamChallenge {
    pub tag: Tag,
    pub name: String,
    #[serde(skip)]
    pub value: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TeamState {
    challenges: Vec<TeamChallenge>,
    /// Solves known before the challenges were issued, restored by [Team::add_challenge]
    solved: HashMap<Tag, DateTime<Utc>>,
    /// Challenges the team stopped in its lab
    stopped: HashSet<String>,
    last_access: Option<DateTime<Utc>>,
}

pub struct Team {
    id: String,
    email: String,
    name: String,
    hashed_password: String,
    created_at: DateTime<Utc>,
    state: RwLock<TeamState>,
}

impl Team {
    pub fn new(email: &str, name: &str, password: &str) -> Result<Team, StoreError> {
        Self::with_cost(email, name, password, bcrypt::DEFAULT_COST)
    }

    /// Creates a team hashing the password with the given bcrypt cost.
    pub fn with_cost(
        email: &str,
        name: &str,
        password: &str,
        cost: u32,
    ) -> Result<Team, StoreError> {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Ok(Team {
            id,
            email: email.trim().to_lowercase(),
            name: name.trim().to_string(),
            hashed_password: bcrypt::hash(password, cost)?,
            created_at: Utc::now(),
            state: RwLock::new(TeamState::default()),
        })
    }

    pub fn from_record(record: TeamRecord) -> Team {
        Team {
            id: record.id,
            email: record.email,
            name: record.name,
            hashed_password: record.hashed_password,
            created_at: record.created_at,
            state: RwLock::new(TeamState {
                challenges: Vec::new(),
                solved: record
                    .solved
                    .into_iter()
                    .map(|solved| (solved.tag, solved.completed_at))
                    .collect(),
                stopped: HashSet::new(),
                last_access: record.last_access,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TeamState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TeamState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self) -> TeamRecord {
        let state = self.read();
        let mut solved: Vec<SolvedChallenge> = state
            .solved
            .iter()
            .map(|(tag, completed_at)| SolvedChallenge {
                tag: tag.clone(),
                completed_at: *completed_at,
            })
            .collect();
        solved.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        TeamRecord {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            hashed_password: self.hashed_password.clone(),
            created_at: self.created_at,
            last_access: state.last_access,
            solved,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hashed_password(&self) -> &str {
        &self.hashed_password
    }

    pub fn verify_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.hashed_password).unwrap_or(false)
    }

    /// Issues a challenge to the team and returns its flag. Challenges installed without a value
    /// get a fresh flag.
    pub fn add_challenge(&self, challenge: &Challenge) -> Result<String, StoreError> {
        let mut state = self.write();
        if state.challenges.iter().any(|c| c.tag == challenge.tag) {
            return Err(StoreError::ChallengeDuplicate);
        }

        let value = if challenge.value.is_empty() {
            Flag::new().to_string()
        } else {
            challenge.value.clone()
        };
        let completed_at = state.solved.get(&challenge.tag).copied();
        state.challenges.push(TeamChallenge {
            tag: challenge.tag.clone(),
            name: challenge.name.clone(),
            value: value.clone(),
            completed_at,
        });
        Ok(value)
    }

    pub fn challenges(&self) -> Vec<TeamChallenge> {
        self.read().challenges.clone()
    }

    pub fn has_challenge(&self, tag: &Tag) -> bool {
        self.read().challenges.iter().any(|c| &c.tag == tag)
    }

    /// Marks the challenge as completed if `flag` is its flag.
    pub fn verify_flag(&self, tag: &str, flag: &str) -> Result<SolvedChallenge, StoreError> {
        let mut state = self.write();
        let challenge = state
            .challenges
            .iter_mut()
            .find(|c| c.tag.as_str() == tag)
            .ok_or(StoreError::UnknownFlag)?;
        if !flags_match(&challenge.value, flag.trim()) {
            return Err(StoreError::UnknownFlag);
        }
        if challenge.completed_at.is_some() {
            return Err(StoreError::FlagAlreadyCompleted);
        }

        let now = Utc::now();
        challenge.completed_at = Some(now);
        let tag = challenge.tag.clone();
        state.solved.insert(tag.clone(), now);
        Ok(SolvedChallenge {
            tag,
            completed_at: now,
        })
    }

    /// Reverts a solve recorded by [Team::verify_flag].
    pub fn withdraw_solve(&self, tag: &Tag) {
        let mut state = self.write();
        state.solved.remove(tag);
        if let Some(challenge) = state.challenges.iter_mut().find(|c| &c.tag == tag) {
            challenge.completed_at = None;
        }
    }

    pub fn solved(&self) -> Vec<SolvedChallenge> {
        self.read()
            .challenges
            .iter()
            .filter_map(|c| {
                c.completed_at.map(|completed_at| SolvedChallenge {
                    tag: c.tag.clone(),
                    completed_at,
                })
            })
            .collect()
    }

    pub fn challenge_stopped(&self, tag: &str) -> bool {
        self.read().stopped.contains(tag)
    }

    pub fn set_challenge_stopped(&self, tag: &str, stopped: bool) {
        let mut state = self.write();
        if stopped {
            state.stopped.insert(tag.to_string());
        } else {
            state.stopped.remove(tag);
        }
    }

    pub fn touch(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.write().last_access = Some(now);
        now
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.read().last_access
    }
}
