// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! Session tokens handed to teams after signup and login.

use crate::team::Team;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const SESSION_COOKIE: &str = "session";

pub fn token_validity() -> Duration {
    Duration::days(31)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    pub id: String,
    #[serde(rename = "tn")]
    pub name: String,
    pub exp: i64,
}

#[derive(thiserror::Error, Debug)]
#[error("invalid session token: {0}")]
pub struct TokenError(#[from] jsonwebtoken::errors::Error);

pub fn issue(signing_key: &str, team: &Team) -> Result<String, TokenError> {
    let claims = Claims {
        id: team.id().to_string(),
        name: team.name().to_string(),
        exp: (Utc::now() + token_validity()).timestamp(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )?)
}

pub fn verify(signing_key: &str, token: &str) -> Result<Claims, TokenError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(signing_key.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::quick_team;

    #[test]
    fn should_issue_verifiable_tokens() {
        let team = quick_team("alpha");
        let token = issue("key", &team).unwrap();
        let claims = verify("key", &token).unwrap();
        assert_eq!(claims.id, team.id());
        assert_eq!(claims.name, "alpha");
        assert!(claims.exp > (Utc::now() + Duration::days(30)).timestamp());
    }

    #[test]
    fn should_reject_tokens_signed_with_another_key() {
        let token = issue("key", &quick_team("alpha")).unwrap();
        assert!(verify("other", &token).is_err());
        assert!(verify("key", "garbage").is_err());
    }

    #[test]
    fn should_reject_expired_tokens() {
        let claims = Claims {
            id: "abcd1234".to_string(),
            name: "alpha".to_string(),
            exp: (Utc::now() - Duration::days(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"key"),
        )
        .unwrap();
        assert!(verify("key", &token).is_err());
    }
}
