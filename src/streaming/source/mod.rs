// Pluggable stream inlets
//
// A `StreamInlet` connects to one source, announces its channel layout and
// then hands out chunks of source-timestamped samples on request. Pulls are
// bounded by a timeout; an idle source returns `Pulled::Empty` (or
// `Pulled::Heartbeat` when it signalled it is alive) rather than an error, and
// `InletWatchdog` turns sustained silence into a stalled or lost verdict.
//
// New sources are added by:
// 1. Implementing the StreamInlet trait
// 2. Adding a variant to SourceDescriptor
// 3. Registering it in `create_inlet`
//
// Current implementations:
// - Replay: NDJSON fixture files or in-memory recordings
// - TCP: NDJSON over a socket, clock probed on a second connection
// - LSL: Lab Streaming Layer (feature `lsl-support`)
// - Scripted: deterministic fixture for tests

#[cfg(feature = "lsl-support")]
mod lsl;
mod replay;
mod scripted;
mod tcp;
pub mod wire;

use crate::streaming::clock::{ClockProbe, LocalClock};
use crate::streaming::types::{ChannelLayout, Sample, StreamResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "lsl-support")]
pub use lsl::LslInlet;
pub use replay::{load_recording, ReplayInlet};
pub use scripted::{ScriptStep, ScriptedInlet};
pub use tcp::TcpInlet;
pub use wire::{StreamIdentity, WireMessage};

/// Samples pulled in one call, with the source-clock span they cover
#[derive(Debug, Clone, PartialEq)]
pub struct SampleChunk {
    pub samples: Vec<Sample>,
    /// (earliest, latest) source timestamp in the chunk
    pub source_range: (f64, f64),
}

impl SampleChunk {
    pub fn new(samples: Vec<Sample>) -> Self {
        let source_range = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.source_timestamp), hi.max(s.source_timestamp))
        });
        Self {
            samples,
            source_range,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of one bounded pull
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    Chunk(SampleChunk),
    /// No data, but the source signalled it is alive
    Heartbeat,
    /// Nothing arrived before the timeout
    Empty,
}

/// Trait for all stream sources
#[async_trait]
pub trait StreamInlet: Send {
    /// Resolve and connect to the source, returning the layout it announces
    async fn connect(&mut self) -> StreamResult<ChannelLayout>;

    /// Pull up to `max_samples` samples, waiting at most `timeout`
    ///
    /// Returns `Err(Disconnected)` once the source is gone; a quiet source is
    /// not an error.
    async fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> StreamResult<Pulled>;

    /// Round-trip transport for clock synchronization against `clock`
    fn clock_probe(&self, clock: Arc<dyn LocalClock>) -> StreamResult<Box<dyn ClockProbe>>;

    async fn disconnect(&mut self) -> StreamResult<()>;

    /// Human-readable source description for logs
    fn describe(&self) -> String;
}

/// Health verdict of the inlet watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InletHealth {
    Healthy,
    /// No samples for longer than the stall threshold
    Stalled,
    /// No samples and no keep-alive for longer than the grace period
    Lost,
}

/// Tracks data and keep-alive activity of an inlet
#[derive(Debug, Clone)]
pub struct InletWatchdog {
    stall_after: Duration,
    grace: Duration,
    last_data: Instant,
    last_alive: Instant,
}

impl InletWatchdog {
    pub fn new(stall_after: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            stall_after,
            grace,
            last_data: now,
            last_alive: now,
        }
    }

    pub fn observe(&mut self, pulled: &Pulled, now: Instant) -> InletHealth {
        match pulled {
            Pulled::Chunk(chunk) if !chunk.is_empty() => {
                self.last_data = now;
                self.last_alive = now;
            }
            Pulled::Chunk(_) | Pulled::Heartbeat => self.last_alive = now,
            Pulled::Empty => {}
        }
        self.health(now)
    }

    pub fn health(&self, now: Instant) -> InletHealth {
        if now.saturating_duration_since(self.last_alive) > self.grace {
            InletHealth::Lost
        } else if now.saturating_duration_since(self.last_data) > self.stall_after {
            InletHealth::Stalled
        } else {
            InletHealth::Healthy
        }
    }
}

/// Which stream to resolve, matched against what the source announces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPredicate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stream_type: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl StreamPredicate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.stream_type.is_none() && self.source_id.is_none()
    }

    /// Every field set in the predicate must equal the announced one
    pub fn matches(&self, identity: &StreamIdentity) -> bool {
        fn field_ok(want: &Option<String>, got: &Option<String>) -> bool {
            want.as_ref().map_or(true, |w| got.as_ref() == Some(w))
        }
        field_ok(&self.name, &identity.name)
            && field_ok(&self.stream_type, &identity.stream_type)
            && field_ok(&self.source_id, &identity.source_id)
    }

    /// Predicate string in the LSL resolver syntax
    pub fn to_query(&self) -> String {
        let mut predicates = Vec::new();
        if let Some(ref name) = self.name {
            predicates.push(format!("name='{}'", name));
        }
        if let Some(ref stream_type) = self.stream_type {
            predicates.push(format!("type='{}'", stream_type));
        }
        if let Some(ref source_id) = self.source_id {
            predicates.push(format!("source_id='{}'", source_id));
        }
        predicates.join(" and ")
    }
}

/// Source configuration
///
/// Tagged with `type` so descriptors read cleanly from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceDescriptor {
    /// NDJSON recording replayed as a live stream
    #[serde(rename = "replay")]
    Replay {
        path: String,
        /// Release samples at their recorded pace
        #[serde(default = "default_true")]
        realtime: bool,
        /// Keep the stream alive with heartbeats after the last sample
        #[serde(default)]
        linger: bool,
    },

    /// NDJSON over TCP
    #[serde(rename = "tcp")]
    Tcp {
        host: String,
        port: u16,
        /// Port of the time-probe service, defaults to `port + 1`
        #[serde(default)]
        probe_port: Option<u16>,
        #[serde(flatten)]
        predicate: StreamPredicate,
    },

    /// Lab Streaming Layer stream
    #[cfg(feature = "lsl-support")]
    #[serde(rename = "lsl")]
    Lsl {
        #[serde(flatten)]
        predicate: StreamPredicate,
        /// Resolution timeout in seconds
        #[serde(default)]
        resolve_timeout: Option<f64>,
    },
}

fn default_true() -> bool {
    true
}

impl SourceDescriptor {
    /// Identity of the physical stream; one session per key at a time
    pub fn key(&self) -> String {
        match self {
            SourceDescriptor::Replay { path, .. } => format!("replay:{}", path),
            SourceDescriptor::Tcp { host, port, .. } => format!("tcp:{}:{}", host, port),
            #[cfg(feature = "lsl-support")]
            SourceDescriptor::Lsl { predicate, .. } => format!("lsl:{}", predicate.to_query()),
        }
    }
}

/// Factory function to create a StreamInlet from a descriptor
pub fn create_inlet(descriptor: SourceDescriptor) -> StreamResult<Box<dyn StreamInlet>> {
    match descriptor {
        SourceDescriptor::Replay {
            path,
            realtime,
            linger,
        } => Ok(Box::new(
            ReplayInlet::open(path).realtime(realtime).linger(linger),
        )),

        SourceDescriptor::Tcp {
            host,
            port,
            probe_port,
            predicate,
        } => Ok(Box::new(TcpInlet::new(
            host,
            port,
            probe_port.unwrap_or_else(|| port.wrapping_add(1)),
            predicate,
        ))),

        #[cfg(feature = "lsl-support")]
        SourceDescriptor::Lsl {
            predicate,
            resolve_timeout,
        } => Ok(Box::new(LslInlet::new(predicate, resolve_timeout))),
    }
}

/// Creates a fresh inlet for every connection attempt of a session
pub trait InletFactory: Send + Sync {
    fn create(&self) -> StreamResult<Box<dyn StreamInlet>>;

    /// Physical stream identity, used to refuse a second session on it
    fn source_key(&self) -> Option<String> {
        None
    }
}

impl InletFactory for SourceDescriptor {
    fn create(&self) -> StreamResult<Box<dyn StreamInlet>> {
        create_inlet(self.clone())
    }

    fn source_key(&self) -> Option<String> {
        Some(self.key())
    }
}

impl<F> InletFactory for F
where
    F: Fn() -> StreamResult<Box<dyn StreamInlet>> + Send + Sync,
{
    fn create(&self) -> StreamResult<Box<dyn StreamInlet>> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_source_range() {
        let chunk = SampleChunk::new(vec![
            Sample::from_source(2.0, vec![0.0]),
            Sample::from_source(1.5, vec![0.0]),
            Sample::from_source(3.0, vec![0.0]),
        ]);
        assert_eq!(chunk.source_range, (1.5, 3.0));
        assert_eq!(chunk.len(), 3);
    }

    #[test]
    fn test_watchdog_stall_then_loss() {
        let t0 = Instant::now();
        let mut dog = InletWatchdog::new(Duration::from_millis(100), Duration::from_millis(500), t0);
        let data = Pulled::Chunk(SampleChunk::new(vec![Sample::from_source(0.0, vec![1.0])]));

        assert_eq!(dog.observe(&data, t0), InletHealth::Healthy);
        assert_eq!(
            dog.observe(&Pulled::Empty, t0 + Duration::from_millis(50)),
            InletHealth::Healthy
        );
        assert_eq!(
            dog.observe(&Pulled::Empty, t0 + Duration::from_millis(200)),
            InletHealth::Stalled
        );
        // keep-alive holds off loss but not the stall
        assert_eq!(
            dog.observe(&Pulled::Heartbeat, t0 + Duration::from_millis(450)),
            InletHealth::Stalled
        );
        assert_eq!(
            dog.observe(&Pulled::Empty, t0 + Duration::from_millis(900)),
            InletHealth::Stalled
        );
        assert_eq!(
            dog.observe(&Pulled::Empty, t0 + Duration::from_millis(1000)),
            InletHealth::Lost
        );
        assert_eq!(
            dog.observe(&data, t0 + Duration::from_millis(1100)),
            InletHealth::Healthy
        );
    }

    #[test]
    fn test_predicate_matching() {
        let predicate = StreamPredicate {
            name: Some("EEG-1".into()),
            stream_type: Some("EEG".into()),
            source_id: None,
        };
        let identity = StreamIdentity {
            name: Some("EEG-1".into()),
            stream_type: Some("EEG".into()),
            source_id: Some("amp-42".into()),
        };
        assert!(predicate.matches(&identity));
        assert!(StreamPredicate::default().matches(&StreamIdentity::default()));
        assert!(!predicate.matches(&StreamIdentity::default()));
        assert_eq!(predicate.to_query(), "name='EEG-1' and type='EEG'");
    }

    #[test]
    fn test_descriptor_from_json() {
        let replay: SourceDescriptor =
            serde_json::from_str(r#"{"type":"replay","path":"rec.ndjson"}"#).unwrap();
        assert_eq!(
            replay,
            SourceDescriptor::Replay {
                path: "rec.ndjson".into(),
                realtime: true,
                linger: false,
            }
        );

        let tcp: SourceDescriptor = serde_json::from_str(
            r#"{"type":"tcp","host":"127.0.0.1","port":9000,"name":"EEG-1"}"#,
        )
        .unwrap();
        assert_eq!(tcp.key(), "tcp:127.0.0.1:9000");
        match tcp {
            SourceDescriptor::Tcp { predicate, .. } => {
                assert_eq!(predicate.name.as_deref(), Some("EEG-1"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
