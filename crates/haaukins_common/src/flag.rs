// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use rand::Rng;
use std::fmt;
use subtle::ConstantTimeEq;

/// Alphanumerics without `0` and `8`, which are easily confused with `O` and `B`.
const FLAG_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ12345679";
const FLAG_LENGTH: usize = 10;

/// A dynamic flag. The dash positions of the rendered form are drawn on every call to
/// [Flag::to_string], so two teams holding flags with a similar prefix do not share a pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flag {
    value: String,
}

impl Flag {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let value = (0..FLAG_LENGTH)
            .map(|_| FLAG_CHARSET[rng.random_range(0..FLAG_CHARSET.len())] as char)
            .collect();
        Flag { value }
    }

    /// The ten undecorated characters.
    pub fn raw(&self) -> &str {
        &self.value
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rng = rand::rng();
        let i = 2 + rng.random_range(0..2);
        let j = i + 2 + rng.random_range(0..2);
        write!(
            f,
            "HKN{{{}-{}-{}}}",
            &self.value[..i],
            &self.value[i..j],
            &self.value[j..]
        )
    }
}

/// Compares a submitted flag with the installed value in constant time.
pub fn flags_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn assert_rendered_format(rendered: &str) {
        let inner = rendered
            .strip_prefix("HKN{")
            .and_then(|s| s.strip_suffix('}'))
            .expect("flag is wrapped in HKN{}");
        let dashes: Vec<usize> = inner
            .char_indices()
            .filter(|(_, c)| *c == '-')
            .map(|(i, _)| i)
            .collect();
        assert_eq!(dashes.len(), 2, "{rendered}");
        assert!(2 <= dashes[0] && dashes[0] < dashes[1], "{rendered}");

        let chars: String = inner.chars().filter(|c| *c != '-').collect();
        assert_eq!(chars.len(), FLAG_LENGTH);
        assert!(chars
            .bytes()
            .all(|c| FLAG_CHARSET.contains(&c) && c != b'0' && c != b'8'));
    }

    #[test]
    fn should_render_flag_with_envelope_and_two_dashes() {
        for _ in 0..100 {
            assert_rendered_format(&Flag::new().to_string());
        }
    }

    #[test]
    fn should_keep_raw_value_across_renders() {
        let flag = Flag::new();
        for _ in 0..20 {
            let rendered: String = flag
                .to_string()
                .trim_start_matches("HKN{")
                .trim_end_matches('}')
                .replace('-', "");
            assert_eq!(rendered, flag.raw());
        }
    }

    #[test]
    fn should_generate_distinct_flags() {
        let flags: HashSet<String> = (0..1000).map(|_| Flag::new().raw().to_string()).collect();
        assert_eq!(flags.len(), 1000);
    }

    #[test]
    fn should_match_flags_exactly() {
        assert!(flags_match("HKN{ab-cd-efghij}", "HKN{ab-cd-efghij}"));
        assert!(!flags_match("HKN{ab-cd-efghij}", "HKN{ab-cd-efghik}"));
        assert!(!flags_match("HKN{ab-cd-efghij}", "HKN{ab-cd-efghi}"));
        assert!(!flags_match("HKN{ab-cd-efghij}", ""));
    }

    proptest! {
        #[test]
        fn should_always_render_valid_format(_seed in any::<u64>()) {
            assert_rendered_format(&Flag::new().to_string());
        }
    }
}
