// Epoch extraction
//
// An epoch is a copy of the samples and markers around an anchor. Extraction
// refuses to run while the clock estimate is not usable, and never returns a
// partial window: the whole range must be resident in the ring or the call
// reports Overrun/Underrun.

use crate::streaming::buffer::{MarkerReader, SharedRing};
use crate::streaming::clock::{ClockReader, LocalClock};
use crate::streaming::types::{Marker, Sample, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Re-check interval of `Epocher::wait_for`
const WAIT_POLL: Duration = Duration::from_millis(5);

/// What an epoch is centred on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anchor {
    /// Most recent marker with `code` no older than `lookback` seconds
    Marker { code: u32, lookback: f64 },
    /// Fixed time on the local synchronized clock
    Time { at: f64 },
    /// Fixed time on the source clock, converted with the current estimate
    SourceTime { at: f64 },
}

impl Anchor {
    pub fn marker(code: u32, lookback: f64) -> Self {
        Anchor::Marker { code, lookback }
    }

    pub fn time(at: f64) -> Self {
        Anchor::Time { at }
    }

    pub fn source_time(at: f64) -> Self {
        Anchor::SourceTime { at }
    }
}

/// Read-only copy of a window of the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    /// Local time of the anchor
    pub anchor_time: f64,
    pub start: f64,
    pub end: f64,
    pub samples: Vec<Sample>,
    /// Markers of the same clock generation inside `[start, end]`, oldest first
    pub markers: Vec<Marker>,
    /// Clock generation the window is aligned under
    pub clock_generation: u64,
}

impl Epoch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values as `[channel][sample]`
    pub fn channel_major(&self) -> Vec<Vec<f32>> {
        let num_channels = self.samples.first().map_or(0, |s| s.values.len());
        let mut channels = vec![Vec::with_capacity(self.samples.len()); num_channels];
        for sample in &self.samples {
            for (channel, value) in channels.iter_mut().zip(&sample.values) {
                channel.push(*value);
            }
        }
        channels
    }

    /// Sample times relative to the anchor
    pub fn relative_times(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.timestamp - self.anchor_time)
            .collect()
    }

    /// Whether the epoch's alignment still holds under the current clock
    /// estimate; false after a clock reset or while the clock is stale
    pub fn is_aligned_with(&self, clock: &ClockReader) -> bool {
        let snapshot = clock.snapshot();
        snapshot.is_usable() && snapshot.generation == self.clock_generation
    }
}

/// Cuts epochs out of the session's rings
#[derive(Clone)]
pub struct Epocher {
    samples: SharedRing,
    markers: MarkerReader,
    clock: ClockReader,
    local: Arc<dyn LocalClock>,
}

impl Epocher {
    pub fn new(
        samples: SharedRing,
        markers: MarkerReader,
        clock: ClockReader,
        local: Arc<dyn LocalClock>,
    ) -> Self {
        Self {
            samples,
            markers,
            clock,
            local,
        }
    }

    pub fn clock(&self) -> &ClockReader {
        &self.clock
    }

    /// Extract `[anchor - pre, anchor + post]`
    pub fn extract(&self, anchor: Anchor, pre: f64, post: f64) -> StreamResult<Epoch> {
        if !(pre >= 0.0 && post >= 0.0 && pre.is_finite() && post.is_finite()) {
            return Err(StreamError::InvalidRange(format!(
                "pre ({}) and post ({}) must be finite and non-negative",
                pre, post
            )));
        }

        let snapshot = self.clock.snapshot();
        if !snapshot.is_usable() {
            return Err(StreamError::ClockStale);
        }
        let (ring, ring_generation) = self.samples.current();
        if ring_generation != snapshot.generation {
            // samples of the new generation are not buffered yet
            return Err(StreamError::ClockStale);
        }

        let anchor_time = match anchor {
            Anchor::Time { at } => at,
            Anchor::SourceTime { at } => snapshot.to_local(at),
            Anchor::Marker { code, lookback } => {
                let since = self.local.now() - lookback.max(0.0);
                self.markers
                    .latest_with_code(code, since, ring_generation)
                    .ok_or(StreamError::AnchorNotFound { code })?
                    .timestamp
            }
        };

        let start = anchor_time - pre;
        let end = anchor_time + post;
        let samples = ring.read_range(start, end)?;
        let markers = self.markers.markers_between(start, end, ring_generation);

        if self.clock.generation() != snapshot.generation {
            return Err(StreamError::ClockStale);
        }

        Ok(Epoch {
            anchor_time,
            start,
            end,
            samples,
            markers,
            clock_generation: snapshot.generation,
        })
    }

    /// `extract`, retrying while the window is not fully recorded yet
    ///
    /// Only `Underrun` is retried; it is returned as-is once `deadline`
    /// passes. Every other result returns immediately.
    pub async fn wait_for(
        &self,
        anchor: Anchor,
        pre: f64,
        post: f64,
        deadline: Instant,
    ) -> StreamResult<Epoch> {
        loop {
            match self.extract(anchor, pre, post) {
                Err(StreamError::Underrun { .. }) if Instant::now() < deadline => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(WAIT_POLL.min(remaining)).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockSyncConfig;
    use crate::streaming::buffer::{MarkerBuffer, RingBuffer};
    use crate::streaming::clock::{ClockSync, ManualClock, ProbeSample};

    struct Fixture {
        ring: RingBuffer,
        markers: MarkerBuffer,
        shared: SharedRing,
        sync: ClockSync,
        clock: Arc<ManualClock>,
        epocher: Epocher,
    }

    fn probe_at(t: f64, offset: f64) -> ProbeSample {
        ProbeSample {
            send_local: t,
            source_ack: t + 0.001 + offset,
            receive_local: t + 0.002,
        }
    }

    /// 100 Hz ring with samples over 0..10 s and a synced clock
    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10.0));
        let mut sync = ClockSync::new(
            ClockSyncConfig::default(),
            Box::new(crate::streaming::clock::FixedOffsetProbe::new(clock.clone(), 0.0)),
        );
        sync.observe(probe_at(0.0, 0.010));
        sync.observe(probe_at(1.0, 0.011));

        let mut ring = RingBuffer::new(2000, 2);
        for i in 0..1000 {
            let t = i as f64 * 0.01;
            ring.push(&Sample {
                timestamp: t,
                source_timestamp: t + 0.01,
                values: vec![i as f32, -(i as f32)],
            })
            .unwrap();
        }
        let markers = MarkerBuffer::new(16);
        let shared = SharedRing::new(ring.reader(), sync.snapshot().generation);
        let epocher = Epocher::new(
            shared.clone(),
            markers.reader(),
            sync.reader(),
            clock.clone(),
        );

        Fixture {
            ring,
            markers,
            shared,
            sync,
            clock,
            epocher,
        }
    }

    #[test]
    fn test_fixed_time_epoch() {
        let f = fixture();
        let epoch = f.epocher.extract(Anchor::time(5.0), 0.205, 0.505).unwrap();
        assert_eq!(epoch.len(), 71);
        assert!(epoch
            .samples
            .iter()
            .all(|s| s.timestamp >= 4.795 && s.timestamp <= 5.505));
        let channels = epoch.channel_major();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].len(), 71);
        assert_eq!(channels[1][0], -channels[0][0]);
        assert!(epoch.relative_times()[0] >= -0.205);
    }

    #[test]
    fn test_marker_anchor_and_lookback() {
        let mut f = fixture();
        let generation = f.sync.snapshot().generation;
        f.markers.push(Marker::new(3.0, 9).with_generation(generation));
        f.markers.push(Marker::new(6.0, 9).with_generation(generation));
        f.markers.push(Marker::new(6.3, 2).with_generation(generation));

        f.clock.set(10.0);
        // the marker at 6.0 is the latest with code 9
        let epoch = f.epocher.extract(Anchor::marker(9, 5.0), 0.5, 0.5).unwrap();
        assert!((epoch.anchor_time - 6.0).abs() < 1e-9);
        assert_eq!(epoch.markers.len(), 2);
        assert_eq!(epoch.markers[1].code, 2);

        // outside the lookback window
        assert!(matches!(
            f.epocher.extract(Anchor::marker(9, 3.0), 0.5, 0.5),
            Err(StreamError::AnchorNotFound { code: 9 })
        ));
        assert!(matches!(
            f.epocher.extract(Anchor::marker(42, 100.0), 0.5, 0.5),
            Err(StreamError::AnchorNotFound { code: 42 })
        ));
    }

    #[test]
    fn test_clock_jump_makes_extraction_stale() {
        let mut f = fixture();
        assert!(f.epocher.extract(Anchor::time(5.0), 0.1, 0.1).is_ok());

        f.sync.observe(probe_at(2.0, 0.052));
        assert!(matches!(
            f.epocher.extract(Anchor::time(5.0), 0.1, 0.1),
            Err(StreamError::ClockStale)
        ));

        // confirmed again, but the ring still holds the old generation
        f.sync.observe(probe_at(3.0, 0.0521));
        assert!(!f.sync.reader().is_stale());
        assert!(matches!(
            f.epocher.extract(Anchor::time(5.0), 0.1, 0.1),
            Err(StreamError::ClockStale)
        ));
    }

    #[test]
    fn test_markers_from_before_a_reset_are_ignored() {
        let mut f = fixture();
        let old = f.sync.snapshot().generation;
        f.markers.push(Marker::new(5.0, 3).with_generation(old));

        // jump and re-converge, then the acquisition side starts a new ring
        f.sync.observe(probe_at(2.0, 0.052));
        f.sync.observe(probe_at(3.0, 0.0521));
        let new = f.sync.snapshot().generation;
        assert_ne!(new, old);
        assert!(f.sync.snapshot().is_usable());

        let mut ring = RingBuffer::new(2000, 2);
        for i in 0..1000 {
            ring.push(&Sample::from_source(i as f64 * 0.01, vec![i as f32, 0.0]))
                .unwrap();
        }
        f.shared.replace(ring.reader(), new);
        f.markers.push(Marker::new(6.0, 4).with_generation(new));

        assert!(matches!(
            f.epocher.extract(Anchor::marker(3, 10.0), 0.1, 0.1),
            Err(StreamError::AnchorNotFound { code: 3 })
        ));

        let epoch = f.epocher.extract(Anchor::time(5.5), 0.6, 0.6).unwrap();
        assert_eq!(epoch.clock_generation, new);
        assert_eq!(epoch.markers.len(), 1);
        assert_eq!(epoch.markers[0].code, 4);

        let anchored = f.epocher.extract(Anchor::marker(4, 10.0), 0.1, 0.1).unwrap();
        assert!((anchored.anchor_time - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_epoch_is_independent_copy() {
        let mut f = fixture();
        let epoch = f.epocher.extract(Anchor::time(1.0), 0.0, 0.05).unwrap();
        let before = epoch.samples.clone();

        // overwrite the whole ring
        for i in 0..2000 {
            let t = 10.0 + i as f64 * 0.01;
            f.ring
                .push(&Sample::from_source(t, vec![0.0, 0.0]))
                .unwrap();
        }
        assert_eq!(epoch.samples, before);
        assert!(matches!(
            f.epocher.extract(Anchor::time(1.0), 0.0, 0.05),
            Err(StreamError::Overrun { .. })
        ));
    }

    #[test]
    fn test_alignment_check_after_reset() {
        let mut f = fixture();
        let epoch = f.epocher.extract(Anchor::time(5.0), 0.1, 0.1).unwrap();
        assert!(epoch.is_aligned_with(&f.sync.reader()));
        f.sync.observe(probe_at(2.0, 1.0));
        assert!(!epoch.is_aligned_with(&f.sync.reader()));
    }

    #[test]
    fn test_source_time_anchor() {
        let f = fixture();
        let offset = f.sync.snapshot();
        let epoch = f
            .epocher
            .extract(Anchor::source_time(offset.to_source(4.0)), 0.0, 0.0)
            .unwrap();
        assert!((epoch.anchor_time - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_durations() {
        let f = fixture();
        assert!(matches!(
            f.epocher.extract(Anchor::time(5.0), -1.0, 0.1),
            Err(StreamError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_gives_up_at_deadline() {
        let f = fixture();
        let deadline = Instant::now() + Duration::from_millis(30);
        let result = f.epocher.wait_for(Anchor::time(9.9), 0.1, 1.0, deadline).await;
        assert!(matches!(result, Err(StreamError::Underrun { .. })));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn test_wait_for_returns_other_errors_at_once() {
        let f = fixture();
        let deadline = Instant::now() + Duration::from_secs(60);
        let result = f.epocher.wait_for(Anchor::marker(1, 1.0), 0.1, 0.1, deadline).await;
        assert!(matches!(result, Err(StreamError::AnchorNotFound { code: 1 })));
    }
}
