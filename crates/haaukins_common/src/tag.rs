// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const TAG_PATTERN: &str = "^[a-z0-9][a-z0-9-]*[a-z0-9]$";

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(TAG_PATTERN).expect("the tag pattern is valid");
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Tag cannot be empty")]
    EmptyTag,
    #[error("Invalid syntax for tag \"{tag}\", allowed syntax: {TAG_PATTERN}")]
    InvalidTagSyntax { tag: String },
    #[error("{var} cannot be empty for {kind}")]
    EmptyVar {
        var: &'static str,
        kind: &'static str,
    },
    #[error("available ({available}) must be between 1 and the capacity ({capacity})")]
    InvalidCapacity { available: usize, capacity: usize },
}

/// A lowercase identifier used as the stable key of exercises, events and challenges.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::EmptyTag);
        }
        if !TAG_REGEX.is_match(&value) {
            return Err(ValidationError::InvalidTagSyntax { tag: value });
        }
        Ok(Tag(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Tag {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Tag::new(value)
    }
}

impl TryFrom<&str> for Tag {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Tag::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn is_tag_char(c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    fn expected_valid(s: &str) -> bool {
        let chars: Vec<char> = s.chars().collect();
        chars.len() >= 2
            && is_tag_char(chars[0])
            && is_tag_char(chars[chars.len() - 1])
            && chars.iter().all(|c| is_tag_char(*c) || *c == '-')
    }

    #[test]
    fn should_reject_empty_tag() {
        assert_eq!(Tag::new(""), Err(ValidationError::EmptyTag));
    }

    #[test]
    fn should_accept_simple_tags() {
        for tag in ["ftp", "sql-injection", "a1", "0-0"] {
            assert!(Tag::new(tag).is_ok(), "{tag} should be valid");
        }
    }

    #[test]
    fn should_reject_invalid_tags() {
        for tag in ["a", "-ftp", "ftp-", "FTP", "ftp_1", "ftp 1", "ftp.dk"] {
            assert!(
                matches!(Tag::new(tag), Err(ValidationError::InvalidTagSyntax { .. })),
                "{tag} should be invalid"
            );
        }
    }

    #[test]
    fn should_deserialize_through_validation() {
        let tag: Result<Tag, _> = serde_json::from_str("\"Bad Tag\"");
        assert!(tag.is_err());
        let tag: Tag = serde_json::from_str("\"good-tag\"").unwrap();
        assert_eq!(tag.as_str(), "good-tag");
    }

    #[test]
    fn should_format_empty_var_error() {
        let err = ValidationError::EmptyVar {
            var: "Name",
            kind: "Event",
        };
        assert_eq!(err.to_string(), "Name cannot be empty for Event");
    }

    proptest! {
        #[test]
        fn should_accept_exactly_the_tag_grammar(s in "[a-z0-9A-Z_ .-]{0,12}") {
            prop_assert_eq!(Tag::new(s.clone()).is_ok(), expected_valid(&s));
        }

        #[test]
        fn should_accept_exactly_the_tag_grammar_for_any_string(s in any::<String>()) {
            prop_assert_eq!(Tag::new(s.clone()).is_ok(), expected_valid(&s));
        }
    }
}
