//! Helpers for reading configuration from an environment-like lookup.
//!
//! Binaries pass `|key| std::env::var(key).ok()`; tests pass a map.

use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Read a required, non-blank value.
pub fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Read an optional value, treating blank as unset.
pub fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// Parse an optional value, falling back to `default` when unset.
pub fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn required_rejects_blank() {
        let lookup = env(&[("SECRET", "  ")]);
        assert_matches!(required(&lookup, "SECRET"), Err(ConfigError::Missing("SECRET")));
    }

    #[test]
    fn parse_or_uses_default_when_unset() {
        let lookup = env(&[]);
        assert_eq!(parse_or(&lookup, "PORT", 3000u16).unwrap(), 3000);
    }

    #[test]
    fn parse_or_reports_invalid_values() {
        let lookup = env(&[("PORT", "abc")]);
        assert_matches!(
            parse_or(&lookup, "PORT", 3000u16),
            Err(ConfigError::Invalid { key: "PORT", .. })
        );
    }
}
