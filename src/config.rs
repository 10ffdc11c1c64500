use crate::streaming::types::ChannelLayout;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
///
/// Every option has an explicit default below; `validate` rejects values
/// that would break timing or buffering guarantees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub inlet: InletConfig,
    pub clock: ClockSyncConfig,
    pub trigger: TriggerConfig,
    pub reconnect: ReconnectPolicy,
    /// Layout the source must announce; `None` accepts any layout
    pub expected_layout: Option<ChannelLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of history kept in the sample ring
    pub duration_secs: f64,
    /// Markers kept in the marker ring
    pub marker_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            duration_secs: 30.0,
            marker_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InletConfig {
    /// Maximum samples per pull
    pub max_chunk_samples: usize,
    /// Upper bound of a single pull
    pub pull_timeout_ms: u64,
    /// Upper bound of connect (resolution + handshake)
    pub connect_timeout_ms: u64,
    /// Silence after which the session is reported degraded
    pub stall_after_ms: u64,
    /// Silence without keep-alive after which the source counts as lost
    pub disconnect_grace_ms: u64,
    /// Samples held back to reorder late arrivals
    pub reorder_window: usize,
}

impl Default for InletConfig {
    fn default() -> Self {
        Self {
            max_chunk_samples: 1024,
            pull_timeout_ms: 50,
            connect_timeout_ms: 5000,
            stall_after_ms: 1000,
            disconnect_grace_ms: 5000,
            reorder_window: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Offset change treated as a clock reset
    pub jump_threshold_secs: f64,
    /// Weight of a new offset measurement, in (0, 1]
    pub offset_smoothing: f64,
    /// Weight of a new drift measurement, in (0, 1]
    pub drift_smoothing: f64,
    /// Consecutive failed probes before the clock is marked stale
    pub max_failed_probes: u32,
    /// Consistent probes needed to confirm a new baseline
    pub stable_probes: u32,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            probe_timeout_ms: 500,
            jump_threshold_secs: 0.020,
            offset_smoothing: 0.5,
            drift_smoothing: 0.1,
            max_failed_probes: 3,
            stable_probes: 1,
        }
    }
}

impl ClockSyncConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub poll_interval_ms: u64,
    /// Same-code events closer than this are coalesced
    pub debounce_ms: u64,
    /// Channel carrying hardware trigger codes, decoded into markers
    pub stim_channel: Option<String>,
    /// Append accepted markers to a software-trigger event file
    pub marker_log: Option<PathBuf>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            debounce_ms: 50,
            stim_channel: None,
            marker_log: None,
        }
    }
}

impl TriggerConfig {
    pub fn debounce_secs(&self) -> f64 {
        self.debounce_ms as f64 / 1000.0
    }
}

/// Reconnect attempts after a session is lost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// policy is exhausted
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Some(Duration::from_millis(ms as u64))
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_json_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `BSL_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("BSL_BUFFER_SECONDS") {
            self.buffer.duration_secs = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BSL_BUFFER_SECONDS={}", v)))?;
        }
        if let Ok(v) = env::var("BSL_PROBE_INTERVAL_MS") {
            self.clock.probe_interval_ms = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BSL_PROBE_INTERVAL_MS={}", v)))?;
        }
        if let Ok(v) = env::var("BSL_DEBOUNCE_MS") {
            self.trigger.debounce_ms = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("BSL_DEBOUNCE_MS={}", v)))?;
        }
        if let Ok(v) = env::var("BSL_RECONNECT") {
            self.reconnect.enabled = v.to_lowercase() == "true";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.buffer.duration_secs > 0.0) {
            return Err(ConfigError::InvalidValue(
                "buffer.duration_secs must be positive".to_string(),
            ));
        }
        if self.buffer.marker_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "buffer.marker_capacity must be at least 1".to_string(),
            ));
        }
        if self.inlet.max_chunk_samples == 0 {
            return Err(ConfigError::InvalidValue(
                "inlet.max_chunk_samples must be at least 1".to_string(),
            ));
        }
        if self.inlet.pull_timeout_ms == 0 || self.inlet.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "inlet timeouts must be positive".to_string(),
            ));
        }
        if self.inlet.disconnect_grace_ms < self.inlet.stall_after_ms {
            return Err(ConfigError::InvalidValue(
                "inlet.disconnect_grace_ms must not be shorter than inlet.stall_after_ms"
                    .to_string(),
            ));
        }
        if self.clock.probe_interval_ms == 0 || self.clock.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "clock probe interval and timeout must be positive".to_string(),
            ));
        }
        if !(self.clock.jump_threshold_secs > 0.0) {
            return Err(ConfigError::InvalidValue(
                "clock.jump_threshold_secs must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("clock.offset_smoothing", self.clock.offset_smoothing),
            ("clock.drift_smoothing", self.clock.drift_smoothing),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.clock.max_failed_probes == 0 {
            return Err(ConfigError::InvalidValue(
                "clock.max_failed_probes must be at least 1".to_string(),
            ));
        }
        if self.trigger.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "trigger.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.reconnect.enabled {
            if self.reconnect.multiplier < 1.0 {
                return Err(ConfigError::InvalidValue(
                    "reconnect.multiplier must be at least 1".to_string(),
                ));
            }
            if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
                return Err(ConfigError::InvalidValue(
                    "reconnect.max_backoff_ms must not be below initial_backoff_ms".to_string(),
                ));
            }
        }
        if let Some(layout) = &self.expected_layout {
            if layout.channels.is_empty() || !(layout.sample_rate > 0.0) {
                return Err(ConfigError::InvalidValue(
                    "expected_layout needs channels and a positive sample rate".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read configuration: {0}")]
    Io(String),

    #[error("Could not parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "buffer": { "duration_secs": 4.0 }, "trigger": { "debounce_ms": 100 } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer.duration_secs, 4.0);
        assert_eq!(config.buffer.marker_capacity, 1024);
        assert_eq!(config.trigger.debounce_ms, 100);
        assert_eq!(config.clock, ClockSyncConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.clock.offset_smoothing = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.inlet.disconnect_grace_ms = 10;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.buffer.duration_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_bounded_and_exponential() {
        let policy = ReconnectPolicy {
            enabled: true,
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.backoff(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.backoff(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.backoff(5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.backoff(7), None);
        assert_eq!(ReconnectPolicy::default().backoff(1), None);
    }
}
