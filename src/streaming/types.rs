// Common types for the streaming module

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during streaming operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Stream disconnected: {0}")]
    Disconnected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Underrun: data up to {requested_end:.6} requested, available up to {available_end:?}")]
    Underrun {
        requested_end: f64,
        available_end: Option<f64>,
    },

    #[error("Overrun: data from {requested_start:.6} requested, oldest retained is {oldest_available:.6}")]
    Overrun {
        requested_start: f64,
        oldest_available: f64,
    },

    #[error("Sample at {timestamp:.6} is older than the newest buffered sample at {newest:.6}")]
    OutOfOrder { timestamp: f64, newest: f64 },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Clock synchronization is stale, timing guarantees do not hold")]
    ClockStale,

    #[error("No marker with code {code} within the lookback window")]
    AnchorNotFound { code: u32 },

    #[error("Trigger device read failed: {0}")]
    DeviceRead(String),

    #[error("Trigger device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Stream already running: {0}")]
    AlreadyRunning(String),

    #[error("Session is not streaming (state: {0})")]
    NotStreaming(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl StreamError {
    /// Data-availability results are contracts for the caller and are never
    /// retried inside the engine.
    pub fn is_data_availability(&self) -> bool {
        matches!(
            self,
            StreamError::Underrun { .. }
                | StreamError::Overrun { .. }
                | StreamError::ClockStale
                | StreamError::AnchorNotFound { .. }
        )
    }

    /// Errors that end the current stream session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Connection(_)
                | StreamError::LayoutMismatch(_)
                | StreamError::Disconnected(_)
                | StreamError::DeviceDisconnected(_)
        )
    }

    /// Fatal errors that a reconnect cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StreamError::LayoutMismatch(_) | StreamError::InvalidConfig(_)
        )
    }
}

impl From<crate::config::ConfigError> for StreamError {
    fn from(err: crate::config::ConfigError) -> Self {
        StreamError::InvalidConfig(err.to_string())
    }
}

/// A single multichannel sample
///
/// `source_timestamp` is on the source clock. `timestamp` is on the local
/// synchronized clock and is filled in when the sample is converted by the
/// clock estimate; inlets leave it equal to the source timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub source_timestamp: f64,
    pub values: Vec<f32>,
}

impl Sample {
    /// Create a sample as delivered by a source, before clock conversion
    pub fn from_source(source_timestamp: f64, values: Vec<f32>) -> Self {
        Self {
            timestamp: source_timestamp,
            source_timestamp,
            values,
        }
    }
}

/// Description of one channel of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    /// Channel kind, e.g. "eeg", "stim", "misc"
    #[serde(default)]
    pub kind: String,
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            kind: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// Ordered channel description of a stream, fixed for one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub channels: Vec<ChannelInfo>,
    /// Nominal sampling rate in Hz
    pub sample_rate: f64,
}

impl ChannelLayout {
    pub fn new(channels: Vec<ChannelInfo>, sample_rate: f64) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Layout with generated names `Ch1..ChN`
    pub fn uniform(count: usize, unit: &str, sample_rate: f64) -> Self {
        let channels = (0..count)
            .map(|i| ChannelInfo::new(format!("Ch{}", i + 1), unit))
            .collect();
        Self::new(channels, sample_rate)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    /// Check that the layout a source announced matches the expected one.
    ///
    /// Names, units and order must agree exactly, and the sampling rates must
    /// agree to within a millihertz.
    pub fn ensure_matches(&self, expected: &ChannelLayout) -> StreamResult<()> {
        if self.channels.len() != expected.channels.len() {
            return Err(StreamError::LayoutMismatch(format!(
                "expected {} channels, source has {}",
                expected.channels.len(),
                self.channels.len()
            )));
        }

        for (idx, (got, want)) in self.channels.iter().zip(&expected.channels).enumerate() {
            if got.name != want.name || got.unit != want.unit {
                return Err(StreamError::LayoutMismatch(format!(
                    "channel {} is '{}' [{}], expected '{}' [{}]",
                    idx, got.name, got.unit, want.name, want.unit
                )));
            }
        }

        if (self.sample_rate - expected.sample_rate).abs() > 1e-3 {
            return Err(StreamError::LayoutMismatch(format!(
                "sampling rate {} Hz, expected {} Hz",
                self.sample_rate, expected.sample_rate
            )));
        }

        Ok(())
    }

    /// Reject rates the ring cannot be sized from
    ///
    /// Irregular-rate streams announce 0 Hz; they are refused together with
    /// negative, NaN and infinite rates.
    pub fn ensure_regular_rate(&self) -> StreamResult<()> {
        if self.sample_rate.is_finite() && self.sample_rate > 0.0 {
            Ok(())
        } else {
            Err(StreamError::LayoutMismatch(format!(
                "sampling rate {} Hz is not a regular rate",
                self.sample_rate
            )))
        }
    }

    /// Check a sample's width against the layout
    pub fn check_sample(&self, sample: &Sample) -> StreamResult<()> {
        if sample.values.len() != self.channels.len() {
            return Err(StreamError::LayoutMismatch(format!(
                "sample at {:.6} has {} values, layout has {} channels",
                sample.source_timestamp,
                sample.values.len(),
                self.channels.len()
            )));
        }
        Ok(())
    }
}

/// A trigger event on the local synchronized clock
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub timestamp: f64,
    pub code: u32,
    /// Clock generation the marker was stamped under
    #[serde(default)]
    pub clock_generation: u64,
}

impl Marker {
    pub fn new(timestamp: f64, code: u32) -> Self {
        Self {
            timestamp,
            code,
            clock_generation: 0,
        }
    }

    pub fn with_generation(mut self, clock_generation: u64) -> Self {
        self.clock_generation = clock_generation;
        self
    }
}

/// Statistics about a streaming session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionStats {
    pub chunks_received: u64,
    pub samples_received: u64,
    pub samples_dropped_late: u64,
    pub markers_recorded: u64,
    pub markers_coalesced: u64,
    pub trigger_read_failures: u64,
    pub clock_resets: u64,
    pub reconnect_attempts: u64,
    pub buffered_samples: usize,
    pub buffer_capacity: usize,
}

/// Lock-free counters behind `SessionStats`
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub chunks_received: AtomicU64,
    pub samples_received: AtomicU64,
    pub samples_dropped_late: AtomicU64,
    pub markers_recorded: AtomicU64,
    pub markers_coalesced: AtomicU64,
    pub trigger_read_failures: AtomicU64,
    pub clock_resets: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

impl StatCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, buffered_samples: usize, buffer_capacity: usize) -> SessionStats {
        SessionStats {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_dropped_late: self.samples_dropped_late.load(Ordering::Relaxed),
            markers_recorded: self.markers_recorded.load(Ordering::Relaxed),
            markers_coalesced: self.markers_coalesced.load(Ordering::Relaxed),
            trigger_read_failures: self.trigger_read_failures.load(Ordering::Relaxed),
            clock_resets: self.clock_resets.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            buffered_samples,
            buffer_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ChannelLayout {
        ChannelLayout::new(
            vec![ChannelInfo::new("Fp1", "uV"), ChannelInfo::new("Fp2", "uV")],
            250.0,
        )
    }

    #[test]
    fn test_layout_match() {
        assert!(layout().ensure_matches(&layout()).is_ok());
    }

    #[test]
    fn test_layout_mismatch_is_hard_error() {
        let mut other = layout();
        other.channels[1].name = "Cz".to_string();
        let err = other.ensure_matches(&layout()).unwrap_err();
        assert!(matches!(err, StreamError::LayoutMismatch(_)));
        assert!(err.is_fatal());
        assert!(err.is_permanent());

        let mut rate = layout();
        rate.sample_rate = 500.0;
        assert!(rate.ensure_matches(&layout()).is_err());
    }

    #[test]
    fn test_sample_width_check() {
        let l = layout();
        assert!(l.check_sample(&Sample::from_source(0.0, vec![1.0, 2.0])).is_ok());
        assert!(l.check_sample(&Sample::from_source(0.0, vec![1.0])).is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(StreamError::ClockStale.is_data_availability());
        assert!(!StreamError::ClockStale.is_fatal());
        assert!(StreamError::Disconnected("gone".into()).is_fatal());
        assert!(!StreamError::Timeout("slow".into()).is_fatal());
    }
}
