// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use serde::{Deserialize, Serialize};

/// The envelope of JSON responses from the team-facing endpoints.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum AppResponse<T: Serialize> {
    #[serde(rename = "data")]
    Ok(T),
    Error {
        message: String,
    },
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        StatusResponse {
            status: "ok".to_string(),
        }
    }
}
