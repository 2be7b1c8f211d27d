// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Shared models used across the lab, event and daemon layers.

use crate::tag::{Tag, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

pub mod responses;

/// An exercise as described in the exercise catalog.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ExerciseConfig {
    pub tags: Vec<Tag>,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl ExerciseConfig {
    pub fn challenges(&self) -> impl Iterator<Item = &ChallengeConfig> {
        self.instances.iter().flat_map(|instance| instance.flags.iter())
    }
}

/// A container or a VM that is part of an exercise. Images ending in `.ova` are VMs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub struct InstanceConfig {
    pub image: String,
    /// Memory limit in megabytes. Zero means the runtime default.
    #[serde(default)]
    pub memory_mb: u32,
    /// CPU share for containers, CPU count for VMs. Zero means the runtime default.
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub envs: Vec<EnvVarConfig>,
    #[serde(default)]
    pub records: Vec<RecordConfig>,
    #[serde(default)]
    pub flags: Vec<ChallengeConfig>,
}

impl InstanceConfig {
    pub fn is_vm(&self) -> bool {
        self.image.ends_with(".ova")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EnvVarConfig {
    pub name: String,
    pub value: String,
}

/// A DNS record published by an exercise. An empty `rdata` is replaced by the address of the
/// container publishing the record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RecordConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub rdata: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChallengeConfig {
    pub tag: Tag,
    pub name: String,
    /// The environment variable receiving a dynamic flag.
    #[serde(default)]
    pub env_var: Option<String>,
    /// A fixed flag value chosen by the exercise author.
    #[serde(default, rename = "static")]
    pub static_flag: Option<String>,
    #[serde(default)]
    pub points: u32,
}

/// A challenge as installed in a lab.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub tag: Tag,
    pub name: String,
    pub value: String,
}

/// A desktop VM that teams drive through the RDP gateway.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FrontendConfig {
    pub image: String,
    #[serde(default)]
    pub memory_mb: u32,
    #[serde(default)]
    pub cpu: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct LabSpec {
    pub frontends: Vec<FrontendConfig>,
    pub exercises: Vec<Tag>,
}

#[derive(Debug, Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum EventStatus {
    Running = 0,
    Suspended = 1,
    Booked = 2,
    Closed = 3,
    Error = 4,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EventConfig {
    pub tag: Tag,
    pub name: String,
    /// The number of labs kept warm.
    pub available: usize,
    /// The maximum number of labs ever built for the event.
    pub capacity: usize,
    pub lab: LabSpec,
    pub started_at: DateTime<Utc>,
    pub finish_expected: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub created_by: String,
}

impl EventConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyVar {
                var: "Name",
                kind: "Event",
            });
        }
        if self.lab.exercises.is_empty() {
            return Err(ValidationError::EmptyVar {
                var: "Exercises",
                kind: "Event",
            });
        }
        if self.lab.frontends.is_empty() {
            return Err(ValidationError::EmptyVar {
                var: "Frontends",
                kind: "Event",
            });
        }
        if self.available == 0 || self.available > self.capacity {
            return Err(ValidationError::InvalidCapacity {
                available: self.available,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_config() -> EventConfig {
        let now = Utc::now();
        EventConfig {
            tag: Tag::new("demo").unwrap(),
            name: "Demo".to_string(),
            available: 1,
            capacity: 2,
            lab: LabSpec {
                frontends: vec![FrontendConfig {
                    image: "kali.ova".to_string(),
                    memory_mb: 0,
                    cpu: 0,
                }],
                exercises: vec![Tag::new("ftp").unwrap()],
            },
            started_at: now,
            finish_expected: now + chrono::Duration::days(1),
            finished_at: None,
            status: EventStatus::Running,
            secret_key: None,
            created_by: "admin".to_string(),
        }
    }

    #[test]
    fn should_accept_valid_event_config() {
        assert_eq!(event_config().validate(), Ok(()));
    }

    #[test]
    fn should_reject_missing_name() {
        let mut config = event_config();
        config.name = " ".to_string();
        assert_eq!(
            config.validate(),
            Err(ValidationError::EmptyVar {
                var: "Name",
                kind: "Event"
            })
        );
    }

    #[test]
    fn should_reject_missing_exercises_and_frontends() {
        let mut config = event_config();
        config.lab.exercises.clear();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyVar {
                var: "Exercises",
                ..
            })
        ));

        let mut config = event_config();
        config.lab.frontends.clear();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyVar {
                var: "Frontends",
                ..
            })
        ));
    }

    #[test]
    fn should_reject_available_above_capacity() {
        let mut config = event_config();
        config.available = 3;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn should_serialize_status_as_number() {
        assert_eq!(serde_json::to_string(&EventStatus::Closed).unwrap(), "3");
        let status: EventStatus = serde_json::from_str("1").unwrap();
        assert_eq!(status, EventStatus::Suspended);
    }

    #[test]
    fn should_detect_vm_instances() {
        let vm = InstanceConfig {
            image: "windows10.ova".to_string(),
            ..Default::default()
        };
        let container = InstanceConfig {
            image: "aau/ftp:latest".to_string(),
            ..Default::default()
        };
        assert!(vm.is_vm());
        assert!(!container.is_vm());
    }

    #[test]
    fn should_parse_exercise_from_toml() {
        let exercise: ExerciseConfig = toml::from_str(
            r#"
            tags = ["ftp"]
            name = "FTP server"

            [[instances]]
            image = "aau/ftp"
            memory_mb = 64

            [[instances.records]]
            name = "ftp.hkn"
            type = "A"

            [[instances.flags]]
            tag = "ftp"
            name = "Find the flag"
            env_var = "APP_FLAG"
            "#,
        )
        .unwrap();
        assert_eq!(exercise.tags, vec![Tag::new("ftp").unwrap()]);
        assert_eq!(exercise.instances[0].records[0].rdata, "");
        assert_eq!(exercise.challenges().count(), 1);
    }
}
