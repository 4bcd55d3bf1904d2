//! Configuration of the handle cache and the reaper.
//!
//! Every component validates its section before it starts. Validation reports all violations at
//! once so that a misconfigured deployment can be fixed in one pass.

use std::path::Path;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::ordered::Capacity;

/// A configuration that cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more settings violate their constraints.
    #[error("Configuration validation errors: {0:?}")]
    Invalid(Vec<String>),

    /// The configuration text is not valid TOML for this schema.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a [`Duration`] as integral milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Delayed-close settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReaperConfig {
    /// Whether archives are closed through the reaper at all. When disabled, handles open and
    /// close archives directly.
    pub enabled: bool,

    /// Capacity of each pending queue; `-1` for unbounded.
    pub max_pending: i64,

    /// Shortest time a quickly-expiring archive stays pending.
    #[serde(rename = "quick-pend-min-ms", with = "millis")]
    pub quick_pend_min: Duration,

    /// Longest time a quickly-expiring archive stays pending.
    #[serde(rename = "quick-pend-max-ms", with = "millis")]
    pub quick_pend_max: Duration,

    /// Shortest time a slowly-expiring archive stays pending. Also the reopen gap below which an
    /// archive is classified as quickly-expiring.
    #[serde(rename = "slow-pend-min-ms", with = "millis")]
    pub slow_pend_min: Duration,

    /// Longest time a slowly-expiring archive stays pending.
    #[serde(rename = "slow-pend-max-ms", with = "millis")]
    pub slow_pend_max: Duration,

    /// How many fully-closed records are remembered for statistics reuse.
    pub completed_max: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending: 255,
            quick_pend_min: Duration::from_millis(100),
            quick_pend_max: Duration::from_millis(200),
            slow_pend_min: Duration::from_millis(300),
            slow_pend_max: Duration::from_millis(600),
            completed_max: 255,
        }
    }
}

impl ReaperConfig {
    /// Validate the reaper settings.
    ///
    /// Returns:
    /// - `Ok(())` if the settings are usable.
    /// - `Err(Vec<String>)` listing every violated constraint otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if Capacity::from_limit(self.max_pending).is_none() {
            errors.push(format!(
                "max-pending must be positive or -1 (unbounded), got {}.",
                self.max_pending
            ));
        }

        let quick_disabled = self.quick_pend_min.is_zero() && self.quick_pend_max.is_zero();
        if !quick_disabled && self.quick_pend_min >= self.quick_pend_max {
            errors.push(format!(
                "quick-pend-min-ms ({:?}) must be below quick-pend-max-ms ({:?}), or both zero.",
                self.quick_pend_min, self.quick_pend_max
            ));
        }

        if self.slow_pend_min.is_zero() {
            errors.push("slow-pend-min-ms must be positive.".to_owned());
        }
        if self.slow_pend_min >= self.slow_pend_max {
            errors.push(format!(
                "slow-pend-min-ms ({:?}) must be below slow-pend-max-ms ({:?}).",
                self.slow_pend_min, self.slow_pend_max
            ));
        }

        // The reaper skips waking the scheduler for slow insertions on the strength of this.
        if self.slow_pend_min <= self.quick_pend_max {
            errors.push(format!(
                "slow-pend-min-ms ({:?}) must exceed quick-pend-max-ms ({:?}).",
                self.slow_pend_min, self.quick_pend_max
            ));
        }

        if self.completed_max == 0 {
            errors.push("completed-max must be at least 1.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Pending-queue capacity. Only meaningful on a validated configuration.
    #[must_use]
    pub fn pending_capacity(&self) -> Capacity {
        Capacity::from_limit(self.max_pending).unwrap_or(Capacity::Unbounded)
    }
}

/// Handle cache and entry cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HandleConfig {
    /// Maximum number of cached archive handles.
    pub max_handles: usize,

    /// Maximum number of cached entries per handle; zero disables the entry cache.
    pub entry_max: usize,

    /// Entries larger than this are never cached.
    pub entry_limit: ByteSize,

    /// Total bytes of cached entry content per handle.
    pub entry_bytes_max: ByteSize,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            max_handles: 255,
            entry_max: 16,
            entry_limit: ByteSize::kib(8),
            entry_bytes_max: ByteSize::kib(128),
        }
    }
}

impl HandleConfig {
    /// Validate the handle settings, listing every violated constraint.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_handles == 0 {
            errors.push("max-handles must be at least 1.".to_owned());
        }
        if self.entry_max > 0 && self.entry_bytes_max < self.entry_limit {
            errors.push(format!(
                "entry-bytes-max ({}) must be at least entry-limit ({}).",
                self.entry_bytes_max, self.entry_limit
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Full cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Handle cache settings.
    #[serde(default)]
    pub handles: HandleConfig,

    /// Reaper settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Config {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(mut handle_errors) = self.handles.validate() {
            errors.append(&mut handle_errors);
        }
        if self.reaper.enabled
            && let Err(mut reaper_errors) = self.reaper.validate()
        {
            errors.append(&mut reaper_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Deserialization`] for malformed text and
    /// [`ConfigError::Invalid`] for settings that fail validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading configuration file.");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn zero_max_pending_is_rejected() {
        let reaper = ReaperConfig {
            max_pending: 0,
            ..ReaperConfig::default()
        };
        let errors = reaper.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("max-pending"), "got {errors:?}");
    }

    #[test]
    fn unbounded_max_pending_is_accepted() {
        let reaper = ReaperConfig {
            max_pending: -1,
            ..ReaperConfig::default()
        };
        assert_eq!(reaper.validate(), Ok(()));
        assert_eq!(reaper.pending_capacity(), Capacity::Unbounded);
    }

    #[test]
    fn quick_window_may_be_disabled() {
        let reaper = ReaperConfig {
            quick_pend_min: Duration::ZERO,
            quick_pend_max: Duration::ZERO,
            ..ReaperConfig::default()
        };
        assert_eq!(reaper.validate(), Ok(()));
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let reaper = ReaperConfig {
            quick_pend_min: Duration::from_millis(100),
            quick_pend_max: Duration::from_millis(400),
            slow_pend_min: Duration::from_millis(300),
            slow_pend_max: Duration::from_millis(600),
            ..ReaperConfig::default()
        };
        let errors = reaper.validate().unwrap_err();
        assert_eq!(errors.len(), 1, "got {errors:?}");
        assert!(errors[0].contains("must exceed quick-pend-max-ms"));
    }

    #[test]
    fn every_violation_is_reported() {
        let reaper = ReaperConfig {
            max_pending: 0,
            quick_pend_min: Duration::from_millis(50),
            quick_pend_max: Duration::from_millis(50),
            slow_pend_min: Duration::ZERO,
            slow_pend_max: Duration::ZERO,
            completed_max: 0,
            ..ReaperConfig::default()
        };
        let errors = reaper.validate().unwrap_err();
        assert_eq!(errors.len(), 6, "got {errors:?}");
    }

    #[test]
    fn disabled_reaper_is_not_validated() {
        let config = Config {
            reaper: ReaperConfig {
                enabled: false,
                max_pending: 0,
                ..ReaperConfig::default()
            },
            ..Config::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn parses_kebab_case_toml() {
        let config = Config::from_toml_str(
            r#"
            [handles]
            max-handles = 8
            entry-limit = "4 KiB"

            [reaper]
            max-pending = -1
            quick-pend-min-ms = 10
            quick-pend-max-ms = 20
            slow-pend-min-ms = 30
            slow-pend-max-ms = 40
            "#,
        )
        .unwrap();
        assert_eq!(config.handles.max_handles, 8);
        assert_eq!(config.handles.entry_limit, ByteSize::kib(4));
        assert_eq!(config.reaper.quick_pend_max, Duration::from_millis(20));
        assert_eq!(config.reaper.completed_max, 255, "unset keys keep defaults");
    }

    #[test]
    fn invalid_toml_settings_fail_validation() {
        let err = Config::from_toml_str("[reaper]\nslow-pend-min-ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got {err:?}");
    }
}
