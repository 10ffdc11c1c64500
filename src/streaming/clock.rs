// Clock synchronization between the stream source and the local clock
//
// Offsets are estimated from NTP-style round trips (local send time, source
// acknowledgement time, local receive time) and smoothed together with a drift
// rate. The estimate is published as one immutable `ClockOffset` snapshot in an
// `AtomicCell`, so readers on any thread see either the old or the new
// (offset, drift) pair and never a mix of both.

use crate::config::ClockSyncConfig;
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock crystals stay well inside this rate; larger estimates are noise.
const MAX_DRIFT: f64 = 1e-3;

/// Source of local time in seconds
pub trait LocalClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic local clock, seconds since construction
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic replays and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, dt: f64) {
        let now = self.now();
        self.set(now + dt);
    }
}

impl LocalClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// One round-trip measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Local time the request left
    pub send_local: f64,
    /// Source time the request was acknowledged
    pub source_ack: f64,
    /// Local time the acknowledgement arrived
    pub receive_local: f64,
}

impl ProbeSample {
    /// Source minus local clock, assuming a symmetric path:
    /// `ack - (send + receive) / 2`
    pub fn offset(&self) -> f64 {
        self.source_ack - (self.send_local + self.receive_local) / 2.0
    }

    pub fn rtt(&self) -> f64 {
        self.receive_local - self.send_local
    }
}

/// Transport for clock round trips, owned by the probing context
#[async_trait]
pub trait ClockProbe: Send {
    async fn round_trip(&mut self) -> StreamResult<ProbeSample>;
}

/// Synchronization status carried in every snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockStatus {
    /// No confirmed estimate yet
    Acquiring,
    /// Estimate confirmed and current
    Synced,
    /// Timing guarantees do not hold (reset or failed probes)
    Stale,
}

/// Immutable offset/drift estimate
///
/// `offset` is source minus local at `estimated_at` (local seconds); `drift`
/// is the rate of change of that offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockOffset {
    pub offset: f64,
    pub drift: f64,
    pub estimated_at: f64,
    pub status: ClockStatus,
    /// Incremented on every clock reset; alignment is only guaranteed between
    /// data stamped under the same generation
    pub generation: u64,
}

impl Default for ClockOffset {
    fn default() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            estimated_at: 0.0,
            status: ClockStatus::Acquiring,
            generation: 0,
        }
    }
}

impl ClockOffset {
    /// Offset extrapolated to a local time
    pub fn offset_at(&self, local: f64) -> f64 {
        self.offset + self.drift * (local - self.estimated_at)
    }

    pub fn to_local(&self, source: f64) -> f64 {
        // source = local + offset + drift * (local - at), solved for local
        (source - self.offset + self.drift * self.estimated_at) / (1.0 + self.drift)
    }

    pub fn to_source(&self, local: f64) -> f64 {
        local + self.offset_at(local)
    }

    pub fn is_usable(&self) -> bool {
        self.status == ClockStatus::Synced
    }
}

/// Read-only handle to the published clock estimate
#[derive(Debug, Clone)]
pub struct ClockReader {
    cell: Arc<AtomicCell<ClockOffset>>,
}

impl ClockReader {
    pub fn snapshot(&self) -> ClockOffset {
        self.cell.load()
    }

    pub fn to_local(&self, source_timestamp: f64) -> f64 {
        self.cell.load().to_local(source_timestamp)
    }

    pub fn to_source(&self, local_timestamp: f64) -> f64 {
        self.cell.load().to_source(local_timestamp)
    }

    pub fn is_stale(&self) -> bool {
        !self.cell.load().is_usable()
    }

    pub fn generation(&self) -> u64 {
        self.cell.load().generation
    }
}

/// What a single observation did to the estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// First baseline of a session
    Baseline,
    /// Consistent with the running estimate
    Updated,
    /// Jump beyond the threshold; alignment guarantees reset
    Reset { jump: f64 },
}

/// Offset/drift estimator; the only writer of the clock snapshot
pub struct ClockSync {
    config: ClockSyncConfig,
    probe: Box<dyn ClockProbe>,
    cell: Arc<AtomicCell<ClockOffset>>,
    last_raw: Option<(f64, f64)>,
    consecutive_failures: u32,
    confirmations: u32,
    last_outcome: Option<ProbeOutcome>,
}

impl ClockSync {
    pub fn new(config: ClockSyncConfig, probe: Box<dyn ClockProbe>) -> Self {
        Self {
            config,
            probe,
            cell: Arc::new(AtomicCell::new(ClockOffset::default())),
            last_raw: None,
            consecutive_failures: 0,
            confirmations: 0,
            last_outcome: None,
        }
    }

    pub fn reader(&self) -> ClockReader {
        ClockReader {
            cell: Arc::clone(&self.cell),
        }
    }

    pub fn snapshot(&self) -> ClockOffset {
        self.cell.load()
    }

    pub fn last_outcome(&self) -> Option<ProbeOutcome> {
        self.last_outcome
    }

    /// Run one round trip and fold it into the estimate
    pub async fn probe(&mut self) -> StreamResult<ClockOffset> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.probe.round_trip()).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout(format!(
                "clock probe did not complete within {} ms",
                self.config.probe_timeout_ms
            ))),
        };

        match result {
            Ok(sample) => Ok(self.observe(sample)),
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Fold a completed round trip into the estimate and publish it
    pub fn observe(&mut self, sample: ProbeSample) -> ClockOffset {
        self.consecutive_failures = 0;

        let raw = sample.offset();
        let t = sample.receive_local;
        let current = self.cell.load();

        let next = if self.last_raw.is_none() {
            self.confirmations = 0;
            self.last_outcome = Some(ProbeOutcome::Baseline);
            ClockOffset {
                offset: raw,
                drift: 0.0,
                estimated_at: t,
                status: self.confirmed_status(ClockStatus::Acquiring),
                generation: current.generation + 1,
            }
        } else {
            let predicted = current.offset_at(t);
            let residual = raw - predicted;

            if residual.abs() > self.config.jump_threshold_secs {
                log::warn!(
                    "Clock offset jumped by {:.6}s (threshold {:.6}s), resetting alignment",
                    residual,
                    self.config.jump_threshold_secs
                );
                self.confirmations = 0;
                self.last_outcome = Some(ProbeOutcome::Reset { jump: residual });
                ClockOffset {
                    offset: raw,
                    drift: 0.0,
                    estimated_at: t,
                    status: self.confirmed_status(ClockStatus::Stale),
                    generation: current.generation + 1,
                }
            } else {
                let mut drift = current.drift;
                if let Some((prev_t, prev_raw)) = self.last_raw {
                    let dt = t - prev_t;
                    if dt > f64::EPSILON {
                        let instantaneous = (raw - prev_raw) / dt;
                        drift += self.config.drift_smoothing * (instantaneous - drift);
                        drift = drift.clamp(-MAX_DRIFT, MAX_DRIFT);
                    }
                }

                self.confirmations = self.confirmations.saturating_add(1);
                self.last_outcome = Some(ProbeOutcome::Updated);
                ClockOffset {
                    offset: predicted + self.config.offset_smoothing * residual,
                    drift,
                    estimated_at: t,
                    status: self.confirmed_status(current.status),
                    generation: current.generation,
                }
            }
        };

        self.last_raw = Some((t, raw));
        self.cell.store(next);

        log::debug!(
            "Clock probe: raw={:.6}s rtt={:.6}s -> offset={:.6}s drift={:.3e} status={:?}",
            raw,
            sample.rtt(),
            next.offset,
            next.drift,
            next.status
        );

        next
    }

    /// Count a failed round trip; marks the estimate stale after too many
    pub fn record_failure(&mut self) -> ClockOffset {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.confirmations = 0;

        let mut current = self.cell.load();
        if self.consecutive_failures >= self.config.max_failed_probes
            && current.status != ClockStatus::Stale
        {
            log::warn!(
                "Clock probing failed {} times in a row, marking clock stale",
                self.consecutive_failures
            );
            current.status = ClockStatus::Stale;
            self.cell.store(current);
        }

        current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Forget every estimate, back to acquiring
    pub fn reset(&mut self) {
        self.last_raw = None;
        self.consecutive_failures = 0;
        self.confirmations = 0;
        self.last_outcome = None;
        self.cell.store(ClockOffset::default());
    }

    fn confirmed_status(&self, unconfirmed: ClockStatus) -> ClockStatus {
        if self.confirmations >= self.config.stable_probes {
            ClockStatus::Synced
        } else if unconfirmed == ClockStatus::Synced {
            // a synced estimate only loses that status through a reset or failures
            ClockStatus::Synced
        } else {
            unconfirmed
        }
    }
}

/// Probe for sources whose clock is a fixed offset from the local clock
pub struct FixedOffsetProbe {
    clock: Arc<dyn LocalClock>,
    offset: f64,
}

impl FixedOffsetProbe {
    pub fn new(clock: Arc<dyn LocalClock>, offset: f64) -> Self {
        Self { clock, offset }
    }
}

#[async_trait]
impl ClockProbe for FixedOffsetProbe {
    async fn round_trip(&mut self) -> StreamResult<ProbeSample> {
        let now = self.clock.now();
        Ok(ProbeSample {
            send_local: now,
            source_ack: now + self.offset,
            receive_local: now,
        })
    }
}

/// Pre-scripted offsets, one per round trip; `None` is a failed probe.
/// The last entry repeats once the script is exhausted.
pub struct ScriptedProbe {
    clock: Arc<dyn LocalClock>,
    steps: VecDeque<Option<f64>>,
    last: Option<f64>,
    rtt: f64,
}

impl ScriptedProbe {
    pub fn new(clock: Arc<dyn LocalClock>, steps: Vec<Option<f64>>) -> Self {
        Self {
            clock,
            steps: steps.into(),
            last: None,
            rtt: 0.002,
        }
    }

    pub fn offsets(clock: Arc<dyn LocalClock>, offsets: &[f64]) -> Self {
        Self::new(clock, offsets.iter().copied().map(Some).collect())
    }
}

#[async_trait]
impl ClockProbe for ScriptedProbe {
    async fn round_trip(&mut self) -> StreamResult<ProbeSample> {
        let step = match self.steps.pop_front() {
            Some(step) => {
                self.last = step;
                step
            }
            None => self.last,
        };

        let offset = step.ok_or_else(|| StreamError::Timeout("scripted probe failure".into()))?;
        let send = self.clock.now();
        Ok(ProbeSample {
            send_local: send,
            source_ack: send + self.rtt / 2.0 + offset,
            receive_local: send + self.rtt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClockSyncConfig {
        ClockSyncConfig {
            jump_threshold_secs: 0.020,
            stable_probes: 1,
            max_failed_probes: 3,
            ..Default::default()
        }
    }

    fn sample(t: f64, offset: f64) -> ProbeSample {
        ProbeSample {
            send_local: t,
            source_ack: t + 0.001 + offset,
            receive_local: t + 0.002,
        }
    }

    fn sync_with(offsets: &[f64]) -> (ClockSync, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10.0));
        let probe = ScriptedProbe::offsets(clock.clone(), offsets);
        (ClockSync::new(config(), Box::new(probe)), clock)
    }

    #[test]
    fn test_probe_sample_offset_is_bias_corrected() {
        let s = ProbeSample {
            send_local: 1.0,
            source_ack: 6.5,
            receive_local: 2.0,
        };
        assert!((s.offset() - 5.0).abs() < 1e-12);
        assert!((s.rtt() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_baseline_then_confirmation() {
        let (mut sync, _) = sync_with(&[]);
        let first = sync.observe(sample(1.0, 0.010));
        assert_eq!(first.status, ClockStatus::Acquiring);
        assert_eq!(first.generation, 1);

        let second = sync.observe(sample(2.0, 0.011));
        assert_eq!(second.status, ClockStatus::Synced);
        assert_eq!(second.generation, 1);
        assert!((second.offset - 0.0105).abs() < 0.001);
    }

    #[test]
    fn test_jump_resets_and_marks_stale() {
        let (mut sync, _) = sync_with(&[]);
        sync.observe(sample(1.0, 0.010));
        sync.observe(sample(2.0, 0.011));
        let third = sync.observe(sample(3.0, 0.052));

        assert_eq!(third.status, ClockStatus::Stale);
        assert_eq!(third.generation, 2);
        assert!(matches!(
            sync.last_outcome(),
            Some(ProbeOutcome::Reset { .. })
        ));
        assert!(sync.reader().is_stale());

        // a fresh consistent probe confirms the new baseline
        let fourth = sync.observe(sample(4.0, 0.0525));
        assert_eq!(fourth.status, ClockStatus::Synced);
        assert_eq!(fourth.generation, 2);
    }

    #[tokio::test]
    async fn test_failed_probes_mark_stale() {
        let clock = Arc::new(ManualClock::new(0.0));
        let probe = ScriptedProbe::new(
            clock.clone(),
            vec![Some(0.0), Some(0.0), None, None, None],
        );
        let mut sync = ClockSync::new(config(), Box::new(probe));

        sync.probe().await.unwrap();
        clock.advance(1.0);
        let synced = sync.probe().await.unwrap();
        assert_eq!(synced.status, ClockStatus::Synced);

        assert!(sync.probe().await.is_err());
        assert!(sync.probe().await.is_err());
        assert!(!sync.reader().is_stale());
        assert!(sync.probe().await.is_err());
        assert!(sync.reader().is_stale());
        assert_eq!(sync.consecutive_failures(), 3);
    }

    #[test]
    fn test_to_local_round_trips_with_drift() {
        let offset = ClockOffset {
            offset: 100.0,
            drift: 1e-4,
            estimated_at: 50.0,
            status: ClockStatus::Synced,
            generation: 1,
        };
        let local = 73.25;
        let source = offset.to_source(local);
        assert!((offset.to_local(source) - local).abs() < 1e-9);
    }

    #[test]
    fn test_reader_sees_published_snapshot() {
        let (mut sync, _) = sync_with(&[]);
        let reader = sync.reader();
        assert_eq!(reader.snapshot().status, ClockStatus::Acquiring);
        sync.observe(sample(1.0, 2.0));
        assert!((reader.snapshot().offset - 2.0).abs() < 1e-9);
        assert!((reader.to_local(12.0) - 10.0).abs() < 1e-9);
        sync.reset();
        assert_eq!(reader.generation(), 0);
    }
}
