//! Player configuration loading and defaults.
//!
//! Values come from an optional TOML file; every key has a default so an
//! empty file (or no file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Tuning parameters shared by sessions, trackers and hosts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Start playback as soon as a session becomes ready.
    pub autoplay: bool,
    /// Progress polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive failed polls that move a session to `Error`.
    pub max_poll_failures: u32,
    /// Give up on a load after this many milliseconds (`None` waits forever).
    pub load_timeout_ms: Option<u64>,
    /// Volume applied to new sessions.
    pub default_volume: f32,
    /// Playback rate applied to new sessions.
    pub default_rate: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            autoplay: true,
            poll_interval_ms: 1000,
            max_poll_failures: 3,
            load_timeout_ms: Some(10_000),
            default_volume: 1.0,
            default_rate: 1.0,
        }
    }
}

impl PlayerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from TOML text and normalize out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<PlayerConfig>(raw)?;
        Ok(cfg.normalized())
    }

    /// Clamp values into ranges the player can honour.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        self.max_poll_failures = self.max_poll_failures.max(1);
        self.default_volume = if self.default_volume.is_nan() {
            1.0
        } else {
            self.default_volume.clamp(0.0, 1.0)
        };
        if !(self.default_rate.is_finite() && self.default_rate > 0.0) {
            self.default_rate = 1.0;
        }
        if self.load_timeout_ms == Some(0) {
            self.load_timeout_ms = None;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = PlayerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PlayerConfig::default());
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn partial_file_overrides_selected_keys() {
        let cfg = PlayerConfig::from_toml_str("autoplay = false\nmax_poll_failures = 5\n").unwrap();
        assert!(!cfg.autoplay);
        assert_eq!(cfg.max_poll_failures, 5);
        assert_eq!(cfg.load_timeout_ms, Some(10_000));
    }

    #[test]
    fn out_of_range_values_are_normalized() {
        let cfg = PlayerConfig::from_toml_str(
            "poll_interval_ms = 1\nmax_poll_failures = 0\ndefault_volume = 3.0\ndefault_rate = -1.0\nload_timeout_ms = 0\n",
        )
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(cfg.max_poll_failures, 1);
        assert_eq!(cfg.default_volume, 1.0);
        assert_eq!(cfg.default_rate, 1.0);
        assert_eq!(cfg.load_timeout(), None);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PlayerConfig::load(Path::new("/definitely/missing/toonie.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
