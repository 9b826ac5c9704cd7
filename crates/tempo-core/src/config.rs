use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const MAX_SAMPLE_INTERVAL_SECS: u64 = 3600;
const MAX_OFFSET_MINUTES: i32 = 24 * 60;

/// What the session builder does with sessions shorter than `min_session`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlickerPolicy {
    /// Drop the flicker and reopen the interrupted session when the user
    /// comes straight back to it
    #[default]
    Merge,
    Discard,
    Keep,
}

/// Engine configuration snapshot, immutable for the life of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub sample_interval_secs: u64,
    pub idle_threshold_secs: u64,
    pub min_session_secs: u64,
    pub flicker_policy: FlickerPolicy,
    pub debounce_window_secs: u64,
    pub raw_retention_days: u32,
    pub aggregation_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub failure_threshold: u32,
    pub max_backoff_secs: u64,
    pub store_lock_timeout_ms: u64,
    pub store_write_retries: u32,
    /// Period boundaries (day, week, month) are computed at this offset
    pub utc_offset_minutes: i32,
    /// Defaults to `<data_local_dir>/tempo/tempo.db`
    pub db_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 10,
            idle_threshold_secs: 300,
            min_session_secs: 1,
            flicker_policy: FlickerPolicy::Merge,
            debounce_window_secs: 15,
            raw_retention_days: 30,
            aggregation_interval_secs: 300,
            probe_timeout_ms: 2000,
            failure_threshold: 3,
            max_backoff_secs: 120,
            store_lock_timeout_ms: 5000,
            store_write_retries: 3,
            utc_offset_minutes: 0,
            db_path: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for malformed TOML, unknown keys or values
    /// that fail [`EngineConfig::validate`]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the default config file when `path` is
    /// `None`. A missing default file yields the defaults; a missing explicit
    /// file is an error.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (get_config_dir()?.join("config.toml"), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(source) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_toml_str(&source)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(EngineError::ConfigInvalid(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Reject values the engine cannot run with. Nothing is defaulted here.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::ConfigInvalid(msg));

        if !(1..=MAX_SAMPLE_INTERVAL_SECS).contains(&self.sample_interval_secs) {
            return invalid(format!(
                "sample_interval_secs must be in 1..={MAX_SAMPLE_INTERVAL_SECS}, got {}",
                self.sample_interval_secs
            ));
        }
        for (name, value) in [
            ("idle_threshold_secs", self.idle_threshold_secs),
            ("aggregation_interval_secs", self.aggregation_interval_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("store_lock_timeout_ms", self.store_lock_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if self.raw_retention_days == 0 {
            return invalid(String::from("raw_retention_days must be at least 1"));
        }
        if self.failure_threshold == 0 {
            return invalid(String::from("failure_threshold must be at least 1"));
        }
        if self.max_backoff_secs < self.sample_interval_secs {
            return invalid(format!(
                "max_backoff_secs ({}) is shorter than sample_interval_secs ({})",
                self.max_backoff_secs, self.sample_interval_secs
            ));
        }
        if self.utc_offset_minutes.abs() >= MAX_OFFSET_MINUTES {
            return invalid(format!(
                "utc_offset_minutes must be within +/-{MAX_OFFSET_MINUTES}, got {}",
                self.utc_offset_minutes
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    #[must_use]
    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    #[must_use]
    pub fn store_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store_lock_timeout_ms)
    }

    /// Offset used for period boundaries
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for an offset chrono cannot represent
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            EngineError::ConfigInvalid(format!(
                "utc_offset_minutes {} is out of range",
                self.utc_offset_minutes
            ))
        })
    }
}

/// Get the local data directory for tempo.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path = dirs::data_local_dir()
        .ok_or_else(|| EngineError::ConfigInvalid(String::from("no local data directory")))?;
    path.push("tempo");
    Ok(path)
}

/// Directory holding `config.toml`
///
/// # Errors
///
/// Returns an error if the config directory cannot be determined.
pub fn get_config_dir() -> Result<PathBuf> {
    let mut path = dirs::config_dir()
        .ok_or_else(|| EngineError::ConfigInvalid(String::from("no config directory")))?;
    path.push("tempo");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sample_interval(), Duration::from_secs(10));
        assert_eq!(config.flicker_policy, FlickerPolicy::Merge);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            sample_interval_secs = 5
            flicker_policy = "discard"
            utc_offset_minutes = -300
            "#,
        )
        .unwrap();
        assert_eq!(config.sample_interval_secs, 5);
        assert_eq!(config.flicker_policy, FlickerPolicy::Discard);
        assert_eq!(config.idle_threshold_secs, 300);
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), -300 * 60);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for source in [
            "sample_interval_secs = 0",
            "sample_interval_secs = 3601",
            "idle_threshold_secs = 0",
            "raw_retention_days = 0",
            "utc_offset_minutes = 1440",
            "idle_threshold_secs = -5",
            "max_backoff_secs = 5",
            "unknown_key = 1",
        ] {
            assert!(
                matches!(
                    EngineConfig::from_toml_str(source),
                    Err(EngineError::ConfigInvalid(_))
                ),
                "accepted {source}"
            );
        }
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(EngineConfig::load(Some(&missing)).is_err());

        let present = dir.path().join("tempo.toml");
        std::fs::write(&present, "raw_retention_days = 7\n").unwrap();
        assert_eq!(
            EngineConfig::load(Some(&present)).unwrap().raw_retention_days,
            7
        );
    }
}
