//! TOML configuration.
//!
//! Every key is optional; a missing file means "all defaults".

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_TICK_RATE_HZ: f64 = 20.0;
/// Accepted headless tick rates, in Hz.
const TICK_RATE_RANGE: std::ops::RangeInclusive<f64> = 0.1..=1000.0;
const DEFAULT_PROMOTE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MESSAGE_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sessions: SessionSettings,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

/// Timing and behavior of the session lifecycle machinery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Headless tick loop frequency.
    pub tick_rate_hz: f64,
    /// Bounded wait for the tick loop to exit when a context is promoted.
    pub promote_timeout_ms: u64,
    /// Carry camera state from the previous active session to the new one.
    pub sync_camera: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            promote_timeout_ms: DEFAULT_PROMOTE_TIMEOUT_MS,
            sync_camera: true,
        }
    }
}

impl SessionSettings {
    /// Period of the headless tick loop. Rates outside the accepted range
    /// fall back to the default.
    pub fn tick_period(&self) -> Duration {
        let rate = if TICK_RATE_RANGE.contains(&self.tick_rate_hz) {
            self.tick_rate_hz
        } else {
            DEFAULT_TICK_RATE_HZ
        };
        Duration::try_from_secs_f64(1.0 / rate)
            .unwrap_or_else(|_| Duration::from_secs_f64(1.0 / DEFAULT_TICK_RATE_HZ))
    }

    pub fn promote_timeout(&self) -> Duration {
        Duration::from_millis(self.promote_timeout_ms)
    }

    /// Replace values that would make the tick loop spin or never run.
    fn sanitize(&mut self) {
        if !TICK_RATE_RANGE.contains(&self.tick_rate_hz) {
            warn!(
                tick_rate_hz = self.tick_rate_hz,
                "Tick rate outside {}..={} Hz, using default",
                TICK_RATE_RANGE.start(),
                TICK_RATE_RANGE.end()
            );
            self.tick_rate_hz = DEFAULT_TICK_RATE_HZ;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Accounts and traffic rate for the simulated server used by the binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    pub accounts: Vec<String>,
    pub message_interval_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            accounts: vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            message_interval_ms: DEFAULT_MESSAGE_INTERVAL_MS,
        }
    }
}

impl DemoConfig {
    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_ms.max(1))
    }
}

impl Config {
    /// Load from the resolved config path, or defaults when there is none.
    pub fn load() -> Result<Self> {
        match crate::paths::config_file() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.sessions.sanitize();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::TestPathGuard;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.sessions.tick_rate_hz, 20.0);
        assert_eq!(config.sessions.tick_period(), Duration::from_millis(50));
        assert_eq!(config.sessions.promote_timeout(), Duration::from_secs(1));
        assert!(config.sessions.sync_camera);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.demo.accounts.len(), 3);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[sessions]
tick_rate_hz = 10.0
"#,
        )
        .unwrap();
        assert_eq!(config.sessions.tick_period(), Duration::from_millis(100));
        assert_eq!(config.sessions.promote_timeout_ms, 1000);
        assert!(config.sessions.sync_camera);
    }

    #[test]
    fn non_positive_tick_rate_is_clamped() {
        let config = Config::from_toml_str("[sessions]\ntick_rate_hz = 0.0\n").unwrap();
        assert_eq!(config.sessions.tick_rate_hz, DEFAULT_TICK_RATE_HZ);
    }

    #[test]
    fn out_of_range_tick_rates_are_replaced() {
        for rate in ["1e-20", "0.01", "5000.0", "1e300"] {
            let config =
                Config::from_toml_str(&format!("[sessions]\ntick_rate_hz = {rate}\n")).unwrap();
            assert_eq!(config.sessions.tick_rate_hz, DEFAULT_TICK_RATE_HZ, "rate {rate}");
        }
        let config = Config::from_toml_str("[sessions]\ntick_rate_hz = 0.1\n").unwrap();
        assert_eq!(config.sessions.tick_period(), Duration::from_secs(10));
    }

    #[test]
    fn tick_period_never_panics_on_unsanitized_settings() {
        for rate in [0.0, -3.0, 1e-20, f64::NAN, f64::INFINITY] {
            let settings = SessionSettings {
                tick_rate_hz: rate,
                ..SessionSettings::default()
            };
            assert_eq!(settings.tick_period(), Duration::from_millis(50));
        }
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[sessions\n").is_err());
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let _guard = TestPathGuard::new(temp_dir.path());
        assert_eq!(Config::load().unwrap(), Config::default());
    }

    #[test]
    fn load_reads_resolved_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let _guard = TestPathGuard::new(temp_dir.path());
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "[demo]\naccounts = [\"dora\"]\nmessage_interval_ms = 10\n",
        )
        .unwrap();

        let config = Config::load().unwrap();
        assert_eq!(config.demo.accounts, vec!["dora".to_string()]);
        assert_eq!(config.demo.message_interval(), Duration::from_millis(10));
    }

    #[test]
    fn load_from_reports_path_on_parse_error() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "sessions = 3").unwrap();
        let err = Config::load_from(temp.path()).unwrap_err();
        assert!(format!("{err}").contains(&temp.path().display().to_string()));
    }
}
