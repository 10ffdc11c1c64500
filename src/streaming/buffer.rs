// Lock-free single-writer ring buffers for samples and markers
//
// Both rings are an arena of fixed-width slots addressed by a monotonically
// increasing write index. Each slot carries a stamp (index + 1 of the record it
// holds) used as a sequence lock: the writer invalidates the stamp, writes the
// words and republishes the stamp; readers copy the words and accept them only
// if the stamp was unchanged across the copy. The writer never waits on a
// reader, and a reader that loses a race reports the data as evicted.

use crate::streaming::types::{ChannelLayout, Marker, Sample, StreamError, StreamResult};
use parking_lot::RwLock;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

const WRITING: u64 = u64::MAX;

/// Fixed-width record slots shared by one writer and many readers
#[derive(Debug)]
struct SlotArena {
    capacity: usize,
    width: usize,
    stamps: Box<[AtomicU64]>,
    words: Box<[AtomicU64]>,
    write_index: AtomicU64,
}

impl SlotArena {
    fn new(capacity: usize, width: usize) -> Self {
        Self {
            capacity,
            width,
            stamps: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            words: (0..capacity * width).map(|_| AtomicU64::new(0)).collect(),
            write_index: AtomicU64::new(0),
        }
    }

    /// Publish one record. Only the owning writer handle calls this.
    fn publish(&self, record: &[u64]) {
        debug_assert_eq!(record.len(), self.width);
        let index = self.write_index.load(Ordering::Relaxed);
        let slot = (index % self.capacity as u64) as usize;
        let base = slot * self.width;

        self.stamps[slot].store(WRITING, Ordering::Relaxed);
        fence(Ordering::Release);
        for (offset, word) in record.iter().enumerate() {
            self.words[base + offset].store(*word, Ordering::Relaxed);
        }
        self.stamps[slot].store(index + 1, Ordering::Release);
        self.write_index.store(index + 1, Ordering::Release);
    }

    /// Copy record `index` into `out`; false if it is not (or no longer) stored
    fn read(&self, index: u64, out: &mut [u64]) -> bool {
        let slot = (index % self.capacity as u64) as usize;
        let base = slot * self.width;

        let before = self.stamps[slot].load(Ordering::Acquire);
        if before != index + 1 {
            return false;
        }
        for (offset, word) in out.iter_mut().enumerate() {
            *word = self.words[base + offset].load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        self.stamps[slot].load(Ordering::Relaxed) == before
    }

    /// Single-word variant of `read`
    fn read_word(&self, index: u64, offset: usize) -> Option<u64> {
        let slot = (index % self.capacity as u64) as usize;
        let before = self.stamps[slot].load(Ordering::Acquire);
        if before != index + 1 {
            return None;
        }
        let word = self.words[slot * self.width + offset].load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        (self.stamps[slot].load(Ordering::Relaxed) == before).then_some(word)
    }

    fn written(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    fn oldest(&self, written: u64) -> u64 {
        written.saturating_sub(self.capacity as u64)
    }
}

fn encode_sample(sample: &Sample, record: &mut Vec<u64>) {
    record.clear();
    record.push(sample.timestamp.to_bits());
    record.push(sample.source_timestamp.to_bits());
    record.extend(sample.values.iter().map(|v| v.to_bits() as u64));
}

fn decode_sample(record: &[u64]) -> Sample {
    Sample {
        timestamp: f64::from_bits(record[0]),
        source_timestamp: f64::from_bits(record[1]),
        values: record[2..].iter().map(|w| f32::from_bits(*w as u32)).collect(),
    }
}

/// Upper bound on a sample ring's storage, in 64-bit words (2 GiB)
const MAX_RING_WORDS: u64 = 1 << 28;

/// Writer handle of the sample ring
///
/// `push` takes `&mut self`, so there is exactly one writer; any number of
/// `RingReader`s can read concurrently.
pub struct RingBuffer {
    arena: Arc<SlotArena>,
    num_channels: usize,
    newest: Option<f64>,
    scratch: Vec<u64>,
}

impl RingBuffer {
    /// Create a ring holding `capacity` samples of `num_channels` values
    pub fn new(capacity: usize, num_channels: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            arena: Arc::new(SlotArena::new(capacity, 2 + num_channels)),
            num_channels,
            newest: None,
            scratch: Vec::with_capacity(2 + num_channels),
        }
    }

    /// Capacity fixed from `duration_secs × sample_rate`
    pub fn with_duration(layout: &ChannelLayout, duration_secs: f64) -> StreamResult<Self> {
        layout.ensure_regular_rate()?;
        let samples = (duration_secs * layout.sample_rate).ceil();
        if !(samples >= 1.0) {
            return Err(StreamError::InvalidConfig(format!(
                "{} s at {} Hz holds no samples",
                duration_secs, layout.sample_rate
            )));
        }

        let width = 2 + layout.num_channels() as u64;
        let words = (samples as u64).checked_mul(width + 1);
        match words {
            Some(words) if samples < MAX_RING_WORDS as f64 && words <= MAX_RING_WORDS => {
                Ok(Self::new(samples as usize, layout.num_channels()))
            }
            _ => Err(StreamError::InvalidConfig(format!(
                "{} s of {} channels at {} Hz exceeds the ring size limit of {} words",
                duration_secs,
                layout.num_channels(),
                layout.sample_rate,
                MAX_RING_WORDS
            ))),
        }
    }

    /// Append a sample, evicting the oldest one when full. O(1), never waits.
    pub fn push(&mut self, sample: &Sample) -> StreamResult<()> {
        if sample.values.len() != self.num_channels {
            return Err(StreamError::LayoutMismatch(format!(
                "sample has {} values, buffer has {} channels",
                sample.values.len(),
                self.num_channels
            )));
        }
        if let Some(newest) = self.newest {
            if sample.timestamp < newest {
                return Err(StreamError::OutOfOrder {
                    timestamp: sample.timestamp,
                    newest,
                });
            }
        }

        encode_sample(sample, &mut self.scratch);
        self.arena.publish(&self.scratch);
        self.newest = Some(sample.timestamp);
        Ok(())
    }

    pub fn reader(&self) -> RingReader {
        RingReader {
            arena: Arc::clone(&self.arena),
        }
    }

    pub fn read_range(&self, start: f64, end: f64) -> StreamResult<Vec<Sample>> {
        self.reader().read_range(start, end)
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity
    }

    pub fn len(&self) -> usize {
        self.reader().len()
    }

    pub fn is_empty(&self) -> bool {
        self.newest.is_none()
    }

    pub fn newest_time(&self) -> Option<f64> {
        self.newest
    }
}

/// Read handle of the sample ring
#[derive(Debug, Clone)]
pub struct RingReader {
    arena: Arc<SlotArena>,
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.arena.capacity
    }

    /// Samples currently retained
    pub fn len(&self) -> usize {
        let written = self.arena.written();
        (written - self.arena.oldest(written)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.arena.written() == 0
    }

    /// Samples pushed since creation, evicted ones included
    pub fn total_pushed(&self) -> u64 {
        self.arena.written()
    }

    pub fn oldest_time(&self) -> Option<f64> {
        for _ in 0..4 {
            let written = self.arena.written();
            if written == 0 {
                return None;
            }
            if let Some(t) = self.timestamp_at(self.arena.oldest(written)) {
                return Some(t);
            }
        }
        None
    }

    pub fn newest_time(&self) -> Option<f64> {
        let written = self.arena.written();
        if written == 0 {
            return None;
        }
        self.timestamp_at(written - 1)
    }

    fn timestamp_at(&self, index: u64) -> Option<f64> {
        self.arena.read_word(index, 0).map(f64::from_bits)
    }

    /// First index in `[lo, hi)` whose timestamp satisfies `!before(t)`
    fn partition(&self, mut lo: u64, mut hi: u64, before: impl Fn(f64) -> bool) -> Option<u64> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let t = self.timestamp_at(mid)?;
            if before(t) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Some(lo)
    }

    fn evicted(&self, start: f64) -> StreamError {
        StreamError::Overrun {
            requested_start: start,
            oldest_available: self.oldest_time().unwrap_or(f64::NAN),
        }
    }

    /// Copy out every retained sample with `start <= timestamp <= end`
    ///
    /// Returns `Overrun` when `start` is older than the oldest retained sample
    /// and `Underrun` when `end` is newer than the newest one; never waits.
    pub fn read_range(&self, start: f64, end: f64) -> StreamResult<Vec<Sample>> {
        if !(start <= end) {
            return Err(StreamError::InvalidRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        let written = self.arena.written();
        if written == 0 {
            return Err(StreamError::Underrun {
                requested_end: end,
                available_end: None,
            });
        }

        let oldest = self.arena.oldest(written);
        let oldest_time = self
            .timestamp_at(oldest)
            .ok_or_else(|| self.evicted(start))?;
        if start < oldest_time {
            return Err(StreamError::Overrun {
                requested_start: start,
                oldest_available: oldest_time,
            });
        }

        let newest_time = self
            .timestamp_at(written - 1)
            .ok_or_else(|| self.evicted(start))?;
        if end > newest_time {
            return Err(StreamError::Underrun {
                requested_end: end,
                available_end: Some(newest_time),
            });
        }

        let first = self
            .partition(oldest, written, |t| t < start)
            .ok_or_else(|| self.evicted(start))?;
        let last = self
            .partition(first, written, |t| t <= end)
            .ok_or_else(|| self.evicted(start))?;

        let mut record = vec![0u64; self.arena.width];
        let mut samples = Vec::with_capacity((last - first) as usize);
        for index in first..last {
            if !self.arena.read(index, &mut record) {
                return Err(self.evicted(start));
            }
            samples.push(decode_sample(&record));
        }

        Ok(samples)
    }
}

/// Reader slot that follows the writer across ring replacements
///
/// After a clock reset the acquisition context starts a fresh ring so that no
/// two samples of different clock generations share one timeline. Readers pick
/// up the current ring (and the generation its samples were stamped under)
/// each time they start an extraction.
#[derive(Debug, Clone)]
pub struct SharedRing {
    current: Arc<RwLock<(RingReader, u64)>>,
}

impl SharedRing {
    pub fn new(reader: RingReader, generation: u64) -> Self {
        Self {
            current: Arc::new(RwLock::new((reader, generation))),
        }
    }

    /// Current ring and the clock generation of its samples
    pub fn current(&self) -> (RingReader, u64) {
        self.current.read().clone()
    }

    pub fn replace(&self, reader: RingReader, generation: u64) {
        *self.current.write() = (reader, generation);
    }
}

/// Writer handle of the marker ring
pub struct MarkerBuffer {
    arena: Arc<SlotArena>,
}

impl MarkerBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arc::new(SlotArena::new(capacity.max(1), 3)),
        }
    }

    pub fn push(&mut self, marker: Marker) {
        self.arena.publish(&[
            marker.timestamp.to_bits(),
            marker.code as u64,
            marker.clock_generation,
        ]);
    }

    pub fn reader(&self) -> MarkerReader {
        MarkerReader {
            arena: Arc::clone(&self.arena),
        }
    }
}

/// Read handle of the marker ring
#[derive(Debug, Clone)]
pub struct MarkerReader {
    arena: Arc<SlotArena>,
}

impl MarkerReader {
    /// Retained markers, newest first
    fn scan(&self) -> impl Iterator<Item = Marker> + '_ {
        let written = self.arena.written();
        let oldest = self.arena.oldest(written);
        let mut record = [0u64; 3];
        (oldest..written).rev().filter_map(move |index| {
            self.arena.read(index, &mut record).then(|| Marker {
                timestamp: f64::from_bits(record[0]),
                code: record[1] as u32,
                clock_generation: record[2],
            })
        })
    }

    /// Markers of clock `generation` with `start <= timestamp <= end`,
    /// oldest first
    pub fn markers_between(&self, start: f64, end: f64, generation: u64) -> Vec<Marker> {
        let mut markers: Vec<Marker> = self
            .scan()
            .filter(|m| {
                m.clock_generation == generation && m.timestamp >= start && m.timestamp <= end
            })
            .collect();
        markers.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        markers
    }

    /// Most recent marker of clock `generation` with `code` stamped at or
    /// after `since`
    pub fn latest_with_code(&self, code: u32, since: f64, generation: u64) -> Option<Marker> {
        self.scan()
            .filter(|m| m.clock_generation == generation && m.code == code && m.timestamp >= since)
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
    }

    pub fn len(&self) -> usize {
        let written = self.arena.written();
        (written - self.arena.oldest(written)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.arena.written() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sample(t: f64, channels: usize) -> Sample {
        Sample {
            timestamp: t,
            source_timestamp: t + 100.0,
            values: (0..channels).map(|c| (t * 1000.0) as f32 + c as f32).collect(),
        }
    }

    fn filled(capacity: usize, count: usize, dt: f64) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity, 2);
        for i in 0..count {
            ring.push(&sample(i as f64 * dt, 2)).unwrap();
        }
        ring
    }

    #[test]
    fn test_capacity_from_duration() {
        let layout = ChannelLayout::uniform(4, "uV", 250.0);
        let ring = RingBuffer::with_duration(&layout, 4.0).unwrap();
        assert_eq!(ring.capacity(), 1000);
    }

    #[test]
    fn test_irregular_or_unbounded_rate_is_refused() {
        for rate in [0.0, -250.0, f64::NAN, f64::INFINITY] {
            let layout = ChannelLayout::uniform(4, "uV", rate);
            assert!(
                matches!(
                    RingBuffer::with_duration(&layout, 4.0),
                    Err(StreamError::LayoutMismatch(_))
                ),
                "rate {}",
                rate
            );
        }

        let huge = ChannelLayout::uniform(64, "uV", 1e12);
        assert!(matches!(
            RingBuffer::with_duration(&huge, 30.0),
            Err(StreamError::InvalidConfig(_))
        ));
        let layout = ChannelLayout::uniform(4, "uV", 250.0);
        assert!(matches!(
            RingBuffer::with_duration(&layout, 0.0),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrun_after_eviction() {
        // 1000 samples at 250 Hz, 1500 pushed over 0..5.996 s
        let ring = filled(1000, 1500, 0.004);
        let reader = ring.reader();
        assert_eq!(reader.len(), 1000);
        assert!((reader.oldest_time().unwrap() - 2.0).abs() < 1e-9);

        match ring.read_range(0.0, 0.1) {
            Err(StreamError::Overrun {
                oldest_available, ..
            }) => assert!((oldest_available - 2.0).abs() < 1e-9),
            other => panic!("expected overrun, got {:?}", other),
        }
    }

    #[test]
    fn test_underrun_beyond_write_cursor() {
        let ring = filled(100, 50, 0.01);
        match ring.read_range(0.2, 0.6) {
            Err(StreamError::Underrun { available_end, .. }) => {
                assert!((available_end.unwrap() - 0.49).abs() < 1e-9)
            }
            other => panic!("expected underrun, got {:?}", other),
        }

        let empty = RingBuffer::new(10, 2);
        assert!(matches!(
            empty.read_range(0.0, 1.0),
            Err(StreamError::Underrun {
                available_end: None,
                ..
            })
        ));
    }

    #[test]
    fn test_read_range_is_inclusive_and_ordered() {
        let ring = filled(1000, 500, 0.004);
        let samples = ring.read_range(0.399, 0.801).unwrap();
        assert_eq!(samples.len(), 101);
        assert!(samples.iter().all(|s| s.timestamp >= 0.399 && s.timestamp <= 0.801));
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(samples[0].values.len(), 2);
        assert_eq!(samples[0].source_timestamp, samples[0].timestamp + 100.0);
    }

    #[test]
    fn test_never_more_than_capacity() {
        for count in [1usize, 7, 64, 65, 200, 1000] {
            let ring = filled(64, count, 0.5);
            let reader = ring.reader();
            let oldest = reader.oldest_time().unwrap();
            let newest = reader.newest_time().unwrap();
            let samples = reader.read_range(oldest, newest).unwrap();
            assert!(samples.len() <= 64);
            assert_eq!(samples.len(), count.min(64));
        }
    }

    #[test]
    fn test_rejects_out_of_order_and_wrong_width() {
        let mut ring = RingBuffer::new(10, 2);
        ring.push(&sample(1.0, 2)).unwrap();
        assert!(matches!(
            ring.push(&sample(0.5, 2)),
            Err(StreamError::OutOfOrder { .. })
        ));
        assert!(matches!(
            ring.push(&sample(2.0, 3)),
            Err(StreamError::LayoutMismatch(_))
        ));
        // equal timestamps are allowed
        assert!(ring.push(&sample(1.0, 2)).is_ok());
    }

    #[test]
    fn test_writer_is_not_blocked_by_readers() {
        let mut ring = RingBuffer::new(256, 8);
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let reader = ring.reader();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut served = 0usize;
                    while !stop.load(Ordering::Relaxed) {
                        if let (Some(lo), Some(hi)) = (reader.oldest_time(), reader.newest_time()) {
                            let (a, b) = (lo + (hi - lo) / 4.0, lo + (hi - lo) / 2.0);
                            if let Ok(samples) = reader.read_range(a, b) {
                                assert!(samples.len() <= 256);
                                assert!(samples.iter().all(|s| s.timestamp >= a && s.timestamp <= b));
                                assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                                served += 1;
                            }
                        }
                    }
                    served
                })
            })
            .collect();

        let started = Instant::now();
        for i in 0..200_000 {
            ring.push(&sample(i as f64 * 0.001, 8)).unwrap();
        }
        let elapsed = started.elapsed();
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(ring.reader().total_pushed(), 200_000);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn test_shared_ring_follows_replacement() {
        let old = filled(10, 5, 1.0);
        let shared = SharedRing::new(old.reader(), 1);
        let held = shared.current().0;

        let fresh = RingBuffer::new(10, 2);
        shared.replace(fresh.reader(), 2);

        let (current, generation) = shared.current();
        assert_eq!(generation, 2);
        assert!(current.is_empty());
        // handles taken earlier still see the old ring
        assert_eq!(held.len(), 5);
    }

    #[test]
    fn test_marker_ring_queries() {
        let mut markers = MarkerBuffer::new(4);
        for (t, code) in [(1.0, 1), (2.0, 2), (3.0, 1), (4.0, 3), (5.0, 2)] {
            markers.push(Marker::new(t, code).with_generation(1));
        }
        let reader = markers.reader();
        assert_eq!(reader.len(), 4);

        // (1.0, 1) was evicted
        let between = reader.markers_between(0.0, 10.0, 1);
        assert_eq!(between.len(), 4);
        assert_eq!(between[0].timestamp, 2.0);

        assert_eq!(reader.latest_with_code(1, 0.0, 1).unwrap().timestamp, 3.0);
        assert_eq!(reader.latest_with_code(2, 0.0, 1).unwrap().timestamp, 5.0);
        assert!(reader.latest_with_code(1, 3.5, 1).is_none());
        assert!(reader.latest_with_code(9, 0.0, 1).is_none());
    }

    #[test]
    fn test_marker_queries_skip_other_generations() {
        let mut markers = MarkerBuffer::new(8);
        markers.push(Marker::new(1.0, 5).with_generation(1));
        markers.push(Marker::new(2.0, 5).with_generation(2));
        markers.push(Marker::new(3.0, 5).with_generation(1));
        let reader = markers.reader();

        assert_eq!(reader.latest_with_code(5, 0.0, 2).unwrap().timestamp, 2.0);
        assert_eq!(reader.latest_with_code(5, 0.0, 1).unwrap().timestamp, 3.0);
        assert!(reader.latest_with_code(5, 0.0, 3).is_none());

        let between = reader.markers_between(0.0, 10.0, 1);
        assert_eq!(between.len(), 2);
        assert!(between.iter().all(|m| m.clock_generation == 1));
    }
}
