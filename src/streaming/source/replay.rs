// Replay of recorded streams
//
// Reads an NDJSON recording (one `layout` line followed by `chunk` lines) or an
// in-memory sample list and serves it as a live source. With `realtime` the
// samples are released at their recorded pace; otherwise as fast as they are
// pulled. The end of the recording is a disconnect, unless `linger` keeps the
// stream alive with heartbeats so the tail stays available for extraction.

use super::wire::{decode_chunk, WireMessage};
use super::{Pulled, SampleChunk, StreamInlet};
use crate::streaming::clock::{ClockProbe, FixedOffsetProbe, LocalClock};
use crate::streaming::types::{ChannelLayout, Sample, StreamError, StreamResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

enum Recording {
    File(PathBuf),
    Memory {
        layout: ChannelLayout,
        samples: Vec<Sample>,
    },
}

pub struct ReplayInlet {
    recording: Recording,
    realtime: bool,
    linger: bool,
    pending: VecDeque<Sample>,
    first_timestamp: f64,
    started: Option<Instant>,
}

impl ReplayInlet {
    /// Replay an NDJSON recording file
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_recording(Recording::File(path.into()))
    }

    /// Replay samples held in memory
    pub fn from_samples(layout: ChannelLayout, samples: Vec<Sample>) -> Self {
        Self::with_recording(Recording::Memory { layout, samples })
    }

    fn with_recording(recording: Recording) -> Self {
        Self {
            recording,
            realtime: true,
            linger: false,
            pending: VecDeque::new(),
            first_timestamp: 0.0,
            started: None,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn linger(mut self, linger: bool) -> Self {
        self.linger = linger;
        self
    }

    /// Source time reached by a paced replay
    fn release_time(&self, started: Instant) -> f64 {
        self.first_timestamp + started.elapsed().as_secs_f64()
    }

    fn take_due(&mut self, max_samples: usize, due: f64) -> Vec<Sample> {
        let mut out = Vec::new();
        while out.len() < max_samples {
            match self.pending.front() {
                Some(next) if next.source_timestamp <= due => {
                    if let Some(sample) = self.pending.pop_front() {
                        out.push(sample);
                    }
                }
                _ => break,
            }
        }
        out
    }
}

/// Parse an NDJSON recording into its layout and samples
pub async fn load_recording(path: &Path) -> StreamResult<(ChannelLayout, Vec<Sample>)> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        StreamError::Connection(format!("Cannot open recording {}: {}", path.display(), e))
    })?;

    let mut layout: Option<ChannelLayout> = None;
    let mut samples = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message = WireMessage::parse(line)
            .map_err(|e| StreamError::Parse(format!("{} line {}: {}", path.display(), idx + 1, e)))?;

        match message {
            WireMessage::Layout {
                channels,
                sample_rate,
                ..
            } => {
                if layout.is_some() {
                    return Err(StreamError::Parse(format!(
                        "{} line {}: second layout in one recording",
                        path.display(),
                        idx + 1
                    )));
                }
                layout = Some(ChannelLayout::new(channels, sample_rate));
            }
            WireMessage::Chunk {
                timestamps,
                samples: values,
            } => {
                let layout = layout.as_ref().ok_or_else(|| {
                    StreamError::Parse(format!(
                        "{} line {}: chunk before layout",
                        path.display(),
                        idx + 1
                    ))
                })?;
                samples.extend(decode_chunk(timestamps, values, layout)?);
            }
            _ => {}
        }
    }

    let layout = layout.ok_or_else(|| {
        StreamError::Parse(format!("{} has no layout line", path.display()))
    })?;
    Ok((layout, samples))
}

#[async_trait]
impl StreamInlet for ReplayInlet {
    async fn connect(&mut self) -> StreamResult<ChannelLayout> {
        let (layout, samples) = match &self.recording {
            Recording::File(path) => load_recording(path).await?,
            Recording::Memory { layout, samples } => (layout.clone(), samples.clone()),
        };

        log::info!(
            "Replaying {} samples of {} channels at {} Hz",
            samples.len(),
            layout.num_channels(),
            layout.sample_rate
        );

        self.first_timestamp = samples.first().map(|s| s.source_timestamp).unwrap_or(0.0);
        self.pending = samples.into();
        self.started = Some(Instant::now());
        Ok(layout)
    }

    async fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> StreamResult<Pulled> {
        let started = self
            .started
            .ok_or_else(|| StreamError::Disconnected("replay is not connected".to_string()))?;

        if self.pending.is_empty() {
            if self.linger {
                tokio::time::sleep(timeout).await;
                return Ok(Pulled::Heartbeat);
            }
            log::info!("Replay reached the end of the recording");
            return Err(StreamError::Disconnected("end of recording".to_string()));
        }

        if !self.realtime {
            let samples = self.take_due(max_samples, f64::INFINITY);
            return Ok(Pulled::Chunk(SampleChunk::new(samples)));
        }

        let mut samples = self.take_due(max_samples, self.release_time(started));
        if samples.is_empty() {
            let next_due = self
                .pending
                .front()
                .map(|s| s.source_timestamp - self.release_time(started))
                .unwrap_or(0.0)
                .max(0.0);
            // a gap too long for a Duration is waited out one pull at a time
            let wait = Duration::try_from_secs_f64(next_due).map_or(timeout, |d| d.min(timeout));
            tokio::time::sleep(wait).await;
            samples = self.take_due(max_samples, self.release_time(started));
        }

        if samples.is_empty() {
            Ok(Pulled::Empty)
        } else {
            Ok(Pulled::Chunk(SampleChunk::new(samples)))
        }
    }

    fn clock_probe(&self, clock: Arc<dyn LocalClock>) -> StreamResult<Box<dyn ClockProbe>> {
        // the recording's clock starts at its first sample when replay starts
        let offset = self.first_timestamp - clock.now();
        Ok(Box::new(FixedOffsetProbe::new(clock, offset)))
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        log::info!("Stopping replay");
        self.pending.clear();
        self.started = None;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.recording {
            Recording::File(path) => format!("replay of {}", path.display()),
            Recording::Memory { samples, .. } => format!("replay of {} samples", samples.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn samples(count: usize, dt: f64) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample::from_source(100.0 + i as f64 * dt, vec![i as f32, -(i as f32)]))
            .collect()
    }

    #[tokio::test]
    async fn test_unpaced_replay_then_end_of_recording() {
        let layout = ChannelLayout::uniform(2, "uV", 100.0);
        let mut inlet = ReplayInlet::from_samples(layout.clone(), samples(25, 0.01)).realtime(false);
        assert_eq!(inlet.connect().await.unwrap(), layout);

        let mut total = 0;
        loop {
            match inlet.pull_chunk(10, Duration::from_millis(10)).await {
                Ok(Pulled::Chunk(chunk)) => {
                    assert!(chunk.len() <= 10);
                    total += chunk.len();
                }
                Ok(other) => panic!("unexpected {:?}", other),
                Err(StreamError::Disconnected(_)) => break,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn test_linger_sends_heartbeats() {
        let layout = ChannelLayout::uniform(2, "uV", 100.0);
        let mut inlet = ReplayInlet::from_samples(layout, samples(3, 0.01))
            .realtime(false)
            .linger(true);
        inlet.connect().await.unwrap();
        assert!(matches!(
            inlet.pull_chunk(10, Duration::from_millis(5)).await,
            Ok(Pulled::Chunk(_))
        ));
        assert_eq!(
            inlet.pull_chunk(10, Duration::from_millis(5)).await.unwrap(),
            Pulled::Heartbeat
        );
    }

    #[tokio::test]
    async fn test_paced_replay_holds_back_future_samples() {
        let layout = ChannelLayout::uniform(2, "uV", 1.0);
        // second sample is due 10 s after the first
        let mut inlet = ReplayInlet::from_samples(layout, samples(2, 10.0));
        inlet.connect().await.unwrap();

        match inlet.pull_chunk(10, Duration::from_millis(5)).await.unwrap() {
            Pulled::Chunk(chunk) => assert_eq!(chunk.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            inlet.pull_chunk(10, Duration::from_millis(5)).await.unwrap(),
            Pulled::Empty
        );
    }

    #[tokio::test]
    async fn test_paced_replay_survives_huge_timestamp_gap() {
        let layout = ChannelLayout::uniform(2, "uV", 1.0);
        let mut inlet = ReplayInlet::from_samples(
            layout,
            vec![
                Sample::from_source(0.0, vec![0.0, 0.0]),
                Sample::from_source(1e300, vec![1.0, 1.0]),
            ],
        );
        inlet.connect().await.unwrap();

        assert!(matches!(
            inlet.pull_chunk(10, Duration::from_millis(5)).await,
            Ok(Pulled::Chunk(_))
        ));
        assert_eq!(
            inlet.pull_chunk(10, Duration::from_millis(5)).await.unwrap(),
            Pulled::Empty
        );
    }

    #[tokio::test]
    async fn test_loads_ndjson_recording() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"type":"layout","channels":[{{"name":"C3","unit":"uV"}},{{"name":"C4","unit":"uV"}}],"sample_rate":100.0}}"#
        )
        .unwrap();
        writeln!(file, r#"{{"type":"chunk","timestamps":[1.0,1.01],"samples":[[1,2],[3,4]]}}"#).unwrap();
        writeln!(file, r#"{{"type":"heartbeat"}}"#).unwrap();
        writeln!(file, r#"{{"type":"chunk","timestamps":[1.02],"samples":[[5,6]]}}"#).unwrap();

        let (layout, samples) = load_recording(file.path()).await.unwrap();
        assert_eq!(layout.channel_index("C4"), Some(1));
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].values, vec![5.0, 6.0]);
    }

    #[tokio::test]
    async fn test_recording_without_layout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"type":"chunk","timestamps":[1.0],"samples":[[1]]}}"#).unwrap();
        assert!(matches!(
            load_recording(file.path()).await,
            Err(StreamError::Parse(_))
        ));
    }
}
