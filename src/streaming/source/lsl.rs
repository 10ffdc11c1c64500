// Lab Streaming Layer (LSL) stream source
//
// Resolves an LSL stream by name/type/source id predicate and pulls samples
// with their LSL timestamps. LSL calls are synchronous, so they run on the
// blocking pool. The clock probe uses the inlet's `time_correction`, which LSL
// measures with its own round trips, and ties it to the local clock.

use super::{Pulled, SampleChunk, StreamInlet, StreamPredicate};
use crate::streaming::clock::{ClockProbe, LocalClock, ProbeSample};
use crate::streaming::types::{ChannelInfo, ChannelLayout, Sample, StreamError, StreamResult};
use async_trait::async_trait;
use lsl::Pullable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

const DEFAULT_RESOLVE_TIMEOUT: f64 = 5.0;

pub struct LslInlet {
    predicate: StreamPredicate,
    resolve_timeout: f64,
    inlet: Option<Arc<Mutex<lsl::StreamInlet>>>,
}

impl LslInlet {
    pub fn new(predicate: StreamPredicate, resolve_timeout: Option<f64>) -> Self {
        Self {
            predicate,
            resolve_timeout: resolve_timeout.unwrap_or(DEFAULT_RESOLVE_TIMEOUT),
            inlet: None,
        }
    }

    fn resolve(predicate: &StreamPredicate, timeout: f64) -> StreamResult<lsl::StreamInfo> {
        let query = predicate.to_query();
        log::info!("Resolving LSL stream: '{}'", query);

        let streams = if query.is_empty() {
            lsl::resolve_streams(timeout)
        } else {
            lsl::resolve_bypred(&query, 1, timeout)
        }
        .map_err(|e| StreamError::Connection(format!("LSL resolve failed: {:?}", e)))?;

        if streams.len() > 1 {
            log::warn!(
                "Multiple LSL streams found ({}), using first match",
                streams.len()
            );
        }

        streams.into_iter().next().ok_or_else(|| {
            StreamError::Connection(format!(
                "No LSL stream found matching '{}' (timeout: {}s)",
                query, timeout
            ))
        })
    }

    /// Channel labels from the stream's XML description, if complete
    fn channel_labels(info: &lsl::StreamInfo, count: usize) -> Option<Vec<String>> {
        let xml = info.to_xml().ok()?;
        let labels: Vec<String> = xml
            .lines()
            .filter_map(|line| {
                let start = line.find("<label>")? + "<label>".len();
                let end = line.find("</label>")?;
                (start <= end).then(|| line[start..end].trim().to_string())
            })
            .collect();
        (labels.len() == count).then_some(labels)
    }

    fn layout_of(info: &lsl::StreamInfo) -> ChannelLayout {
        let count = info.channel_count().max(0) as usize;
        let names = Self::channel_labels(info, count)
            .unwrap_or_else(|| (0..count).map(|i| format!("Ch{}", i + 1)).collect());
        let channels = names.into_iter().map(|n| ChannelInfo::new(n, "")).collect();
        ChannelLayout::new(channels, info.nominal_srate())
    }

    fn handle(&self) -> StreamResult<Arc<Mutex<lsl::StreamInlet>>> {
        self.inlet
            .clone()
            .ok_or_else(|| StreamError::Disconnected("LSL inlet is not open".to_string()))
    }
}

#[async_trait]
impl StreamInlet for LslInlet {
    async fn connect(&mut self) -> StreamResult<ChannelLayout> {
        let predicate = self.predicate.clone();
        let timeout = self.resolve_timeout;

        let (inlet, layout) = task::spawn_blocking(move || {
            let info = LslInlet::resolve(&predicate, timeout)?;
            let layout = LslInlet::layout_of(&info);
            let inlet = lsl::StreamInlet::new(&info, 360, 0, true)
                .map_err(|e| StreamError::Connection(format!("Failed to create inlet: {:?}", e)))?;
            inlet
                .open_stream(timeout)
                .map_err(|e| StreamError::Connection(format!("Failed to open stream: {:?}", e)))?;
            Ok::<_, StreamError>((inlet, layout))
        })
        .await
        .map_err(|e| StreamError::Connection(format!("Task join error: {}", e)))??;

        log::info!(
            "LSL stream connected: {} channels at {} Hz",
            layout.num_channels(),
            layout.sample_rate
        );
        self.inlet = Some(Arc::new(Mutex::new(inlet)));
        Ok(layout)
    }

    async fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> StreamResult<Pulled> {
        let inlet = self.handle()?;

        let samples = task::spawn_blocking(move || {
            let inlet = inlet.lock();
            let mut samples = Vec::new();
            let mut wait = timeout.as_secs_f64();
            while samples.len() < max_samples {
                let (values, timestamp): (Vec<f32>, f64) = inlet
                    .pull_sample(wait)
                    .map_err(|e| StreamError::Disconnected(format!("LSL pull error: {:?}", e)))?;
                // LSL reports a timed-out pull with a zero timestamp
                if timestamp == 0.0 {
                    break;
                }
                samples.push(Sample::from_source(timestamp, values));
                wait = 0.0;
            }
            Ok::<_, StreamError>(samples)
        })
        .await
        .map_err(|e| StreamError::Disconnected(format!("Task join error: {}", e)))??;

        if samples.is_empty() {
            Ok(Pulled::Empty)
        } else {
            Ok(Pulled::Chunk(SampleChunk::new(samples)))
        }
    }

    fn clock_probe(&self, clock: Arc<dyn LocalClock>) -> StreamResult<Box<dyn ClockProbe>> {
        Ok(Box::new(LslTimeProbe {
            inlet: self.handle()?,
            clock,
        }))
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        log::info!("Stopping LSL stream");
        self.inlet = None;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("lsl stream '{}'", self.predicate.to_query())
    }
}

struct LslTimeProbe {
    inlet: Arc<Mutex<lsl::StreamInlet>>,
    clock: Arc<dyn LocalClock>,
}

#[async_trait]
impl ClockProbe for LslTimeProbe {
    async fn round_trip(&mut self) -> StreamResult<ProbeSample> {
        let inlet = Arc::clone(&self.inlet);
        let correction = task::spawn_blocking(move || {
            inlet
                .lock()
                .time_correction(1.0)
                .map_err(|e| StreamError::Timeout(format!("LSL time correction failed: {:?}", e)))
        })
        .await
        .map_err(|e| StreamError::Timeout(format!("Task join error: {}", e)))??;

        // source time = LSL local time - correction
        let send_local = self.clock.now();
        let lsl_now = lsl::local_clock();
        let receive_local = self.clock.now();
        Ok(ProbeSample {
            send_local,
            source_ack: lsl_now - correction,
            receive_local,
        })
    }
}
