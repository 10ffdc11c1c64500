// Deterministic inlet for tests and dry runs

use super::{Pulled, SampleChunk, StreamInlet};
use crate::streaming::clock::{ClockProbe, FixedOffsetProbe, LocalClock, ScriptedProbe};
use crate::streaming::types::{ChannelLayout, Sample, StreamError, StreamResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted pull outcome
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(Vec<Sample>),
    /// Chunk that arrives just as the pull times out, as from a paced source
    Delayed(Vec<Sample>),
    Heartbeat,
    /// Nothing arrives; the pull waits out its timeout
    Silence,
    /// The source goes away
    Disconnect,
}

/// Inlet replaying a fixed script of pulls
///
/// Once the script is exhausted every pull is a heartbeat after the timeout.
/// Connect attempts can be scripted to fail with `fail_connects`, which is
/// shared between clones so a factory can hand out fresh inlets that still
/// see the same failure budget.
#[derive(Clone)]
pub struct ScriptedInlet {
    layout: ChannelLayout,
    steps: VecDeque<ScriptStep>,
    probe_offsets: Option<Vec<Option<f64>>>,
    fixed_offset: f64,
    failing_connects: Arc<Mutex<u32>>,
    connected: bool,
}

impl ScriptedInlet {
    pub fn new(layout: ChannelLayout, steps: Vec<ScriptStep>) -> Self {
        Self {
            layout,
            steps: steps.into(),
            probe_offsets: None,
            fixed_offset: 0.0,
            failing_connects: Arc::new(Mutex::new(0)),
            connected: false,
        }
    }

    /// Source clock runs `offset` seconds ahead of the local clock
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.fixed_offset = offset;
        self
    }

    /// Scripted probe results, see `ScriptedProbe`
    pub fn with_probe_offsets(mut self, offsets: Vec<Option<f64>>) -> Self {
        self.probe_offsets = Some(offsets);
        self
    }

    /// The next `count` connects fail with a connection error
    pub fn fail_connects(self, count: u32) -> Self {
        *self.failing_connects.lock() = count;
        self
    }

    /// Hand out at most `max_samples`, keeping the rest for the next pull
    fn take_chunk(&mut self, mut samples: Vec<Sample>, max_samples: usize) -> Pulled {
        if samples.len() > max_samples {
            let rest = samples.split_off(max_samples);
            self.steps.push_front(ScriptStep::Chunk(rest));
        }
        Pulled::Chunk(SampleChunk::new(samples))
    }
}

#[async_trait]
impl StreamInlet for ScriptedInlet {
    async fn connect(&mut self) -> StreamResult<ChannelLayout> {
        {
            let mut failing = self.failing_connects.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StreamError::Connection(
                    "scripted source unreachable".to_string(),
                ));
            }
        }
        self.connected = true;
        Ok(self.layout.clone())
    }

    async fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> StreamResult<Pulled> {
        if !self.connected {
            return Err(StreamError::Disconnected(
                "scripted source is not connected".to_string(),
            ));
        }

        match self.steps.pop_front() {
            Some(ScriptStep::Chunk(samples)) => Ok(self.take_chunk(samples, max_samples)),
            Some(ScriptStep::Delayed(samples)) => {
                tokio::time::sleep(timeout).await;
                Ok(self.take_chunk(samples, max_samples))
            }
            Some(ScriptStep::Heartbeat) => Ok(Pulled::Heartbeat),
            Some(ScriptStep::Silence) => {
                tokio::time::sleep(timeout).await;
                Ok(Pulled::Empty)
            }
            Some(ScriptStep::Disconnect) => {
                self.connected = false;
                Err(StreamError::Disconnected("scripted disconnect".to_string()))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Pulled::Heartbeat)
            }
        }
    }

    fn clock_probe(&self, clock: Arc<dyn LocalClock>) -> StreamResult<Box<dyn ClockProbe>> {
        Ok(match &self.probe_offsets {
            Some(offsets) => Box::new(ScriptedProbe::new(clock, offsets.clone())),
            None => Box::new(FixedOffsetProbe::new(clock, self.fixed_offset)),
        })
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        self.connected = false;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted source ({} steps left)", self.steps.len())
    }
}
