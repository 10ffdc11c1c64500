// Bounded reordering of samples before they reach the ring buffer
//
// Some transports deliver the occasional sample late. Up to `window` samples
// are held back and released in timestamp order; anything older than what was
// already released is dropped and counted instead of being inserted out of
// order.

use crate::streaming::types::Sample;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct ReorderWindow {
    window: usize,
    pending: VecDeque<Sample>,
    released_up_to: Option<f64>,
    dropped: u64,
}

impl ReorderWindow {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            pending: VecDeque::with_capacity(window + 1),
            released_up_to: None,
            dropped: 0,
        }
    }

    /// Offer one sample; samples that leave the window are appended to `out`.
    ///
    /// Returns false if the sample was too late and has been dropped.
    pub fn offer(&mut self, sample: Sample, out: &mut Vec<Sample>) -> bool {
        if let Some(released) = self.released_up_to {
            if sample.timestamp < released {
                self.dropped += 1;
                log::debug!(
                    "Dropping late sample at {:.6} (already released up to {:.6})",
                    sample.timestamp,
                    released
                );
                return false;
            }
        }

        let position = self
            .pending
            .partition_point(|held| held.timestamp <= sample.timestamp);
        self.pending.insert(position, sample);

        while self.pending.len() > self.window {
            if let Some(oldest) = self.pending.pop_front() {
                self.released_up_to = Some(oldest.timestamp);
                out.push(oldest);
            }
        }

        true
    }

    /// Release everything held back
    pub fn flush(&mut self, out: &mut Vec<Sample>) {
        while let Some(sample) = self.pending.pop_front() {
            self.released_up_to = Some(sample.timestamp);
            out.push(sample);
        }
    }

    /// Forget ordering history, e.g. after the timeline was reset
    pub fn reset(&mut self) {
        self.pending.clear();
        self.released_up_to = None;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Samples dropped as too late since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(t: f64) -> Sample {
        Sample::from_source(t, vec![t as f32])
    }

    fn times(samples: &[Sample]) -> Vec<f64> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_reorders_within_window() {
        let mut window = ReorderWindow::new(3);
        let mut out = Vec::new();
        for t in [1.0, 3.0, 2.0, 4.0, 6.0, 5.0, 7.0] {
            assert!(window.offer(s(t), &mut out));
        }
        window.flush(&mut out);
        assert_eq!(times(&out), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(window.dropped(), 0);
    }

    #[test]
    fn test_drops_beyond_window() {
        let mut window = ReorderWindow::new(2);
        let mut out = Vec::new();
        for t in [1.0, 2.0, 3.0, 4.0, 5.0] {
            window.offer(s(t), &mut out);
        }
        // 1..3 released, 4 and 5 pending
        assert!(!window.offer(s(2.5), &mut out));
        assert!(window.offer(s(3.5), &mut out));
        window.flush(&mut out);
        assert_eq!(times(&out), vec![1.0, 2.0, 3.0, 3.5, 4.0, 5.0]);
        assert_eq!(window.dropped(), 1);
    }

    #[test]
    fn test_zero_window_passes_through() {
        let mut window = ReorderWindow::new(0);
        let mut out = Vec::new();
        window.offer(s(1.0), &mut out);
        assert_eq!(out.len(), 1);
        assert!(!window.offer(s(0.5), &mut out));
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut window = ReorderWindow::new(0);
        let mut out = Vec::new();
        window.offer(s(10.0), &mut out);
        window.reset();
        assert!(window.offer(s(1.0), &mut out));
    }
}
