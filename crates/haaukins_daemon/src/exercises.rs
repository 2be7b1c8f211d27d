// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! The exercise catalog events pick their exercises from.
//!
//! The catalog is a TOML file of `[[exercises]]` tables. Every tag names exactly one exercise,
//! and an exercise can be looked up by any of its tags.

use crate::DaemonError;
use haaukins_common::models::ExerciseConfig;
use haaukins_common::Tag;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Deserialize)]
struct ExerciseFile {
    #[serde(default)]
    exercises: Vec<ExerciseConfig>,
}

#[derive(Debug, Default)]
pub struct ExerciseLibrary {
    exercises: Vec<ExerciseConfig>,
    by_tag: HashMap<Tag, usize>,
}

impl ExerciseLibrary {
    pub fn new(exercises: Vec<ExerciseConfig>) -> Result<ExerciseLibrary, DaemonError> {
        let mut by_tag = HashMap::new();
        for (i, exercise) in exercises.iter().enumerate() {
            if exercise.tags.is_empty() {
                return Err(DaemonError::MissingTags(exercise.name.clone()));
            }
            for tag in &exercise.tags {
                if by_tag.insert(tag.clone(), i).is_some() {
                    return Err(DaemonError::DuplicateExercise(tag.clone()));
                }
            }
        }
        Ok(ExerciseLibrary { exercises, by_tag })
    }

    pub fn parse(content: &str) -> Result<ExerciseLibrary, DaemonError> {
        let file: ExerciseFile = toml::from_str(content)?;
        Self::new(file.exercises)
    }

    pub async fn read<P: AsRef<Path>>(path: P) -> Result<ExerciseLibrary, DaemonError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let library = Self::parse(&content)?;
        info! {
            path = ?path.as_ref(),
            exercises = library.len(),
            "loaded exercise catalog"
        }
        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }

    /// The exercises named by `tags`, in order of first mention. Tags of the same exercise
    /// resolve to it once.
    pub fn get(&self, tags: &[Tag]) -> Result<Vec<ExerciseConfig>, DaemonError> {
        let mut seen = Vec::new();
        for tag in tags {
            let i = *self
                .by_tag
                .get(tag)
                .ok_or_else(|| DaemonError::UnknownExercise(tag.clone()))?;
            if !seen.contains(&i) {
                seen.push(i);
            }
        }
        Ok(seen.into_iter().map(|i| self.exercises[i].clone()).collect())
    }
}
