use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CACHE_KEY: &str = "remote-kernel-connections.v1";
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

pub const ENV_CACHE_KEY: &str = "KFIND_CACHE_KEY";
pub const ENV_EXTENSION_VERSION: &str = "KFIND_EXTENSION_VERSION";
pub const ENV_REFRESH_SECS: &str = "KFIND_REFRESH_SECS";
pub const ENV_VALIDATION_TIMEOUT_MS: &str = "KFIND_VALIDATION_TIMEOUT_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinderConfig {
    pub cache_key: String,
    /// Tag written into every persisted snapshot.
    pub extension_version: String,
    /// Periodic refresh; `None` disables the timer.
    pub refresh_interval: Option<Duration>,
    /// Per-entry limit for cache validation. Expiry discards the entry.
    pub validation_timeout: Option<Duration>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            refresh_interval: None,
            validation_timeout: Some(DEFAULT_VALIDATION_TIMEOUT),
        }
    }
}

impl FinderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(cache_key) = non_empty(lookup(ENV_CACHE_KEY)) {
            config.cache_key = cache_key;
        }
        if let Some(version) = non_empty(lookup(ENV_EXTENSION_VERSION)) {
            config.extension_version = version;
        }
        if let Some(raw) = non_empty(lookup(ENV_REFRESH_SECS)) {
            let secs = parse_number(ENV_REFRESH_SECS, &raw)?;
            config.refresh_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = non_empty(lookup(ENV_VALIDATION_TIMEOUT_MS)) {
            let ms = parse_number(ENV_VALIDATION_TIMEOUT_MS, &raw)?;
            config.validation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = FinderConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, FinderConfig::default());
        assert_eq!(config.cache_key, DEFAULT_CACHE_KEY);
    }

    #[test]
    fn overrides_and_zero_disables() {
        let config = FinderConfig::from_lookup(lookup(&[
            (ENV_CACHE_KEY, "team-server"),
            (ENV_EXTENSION_VERSION, "2024.1.0"),
            (ENV_REFRESH_SECS, "30"),
            (ENV_VALIDATION_TIMEOUT_MS, "0"),
        ]))
        .expect("config");
        assert_eq!(config.cache_key, "team-server");
        assert_eq!(config.extension_version, "2024.1.0");
        assert_eq!(config.refresh_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.validation_timeout, None);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = FinderConfig::from_lookup(lookup(&[(ENV_REFRESH_SECS, "soon")]))
            .expect_err("should fail");
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: ENV_REFRESH_SECS,
                value: "soon".to_string()
            }
        );
    }
}
