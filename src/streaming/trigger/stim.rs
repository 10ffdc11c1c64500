use crate::streaming::types::{ChannelLayout, Sample, StreamError, StreamResult};

/// Decodes trigger codes carried on a channel of the sample stream
///
/// A code is emitted on every change to a non-zero value, stamped with the
/// timestamp of the sample that carries it. Returning to zero emits nothing.
#[derive(Debug, Clone)]
pub struct StimChannelDecoder {
    channel: usize,
    previous: u32,
}

impl StimChannelDecoder {
    pub fn new(layout: &ChannelLayout, channel_name: &str) -> StreamResult<Self> {
        let channel = layout.channel_index(channel_name).ok_or_else(|| {
            StreamError::InvalidConfig(format!(
                "stim channel '{}' is not part of the stream layout",
                channel_name
            ))
        })?;
        Ok(Self {
            channel,
            previous: 0,
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// (timestamp, code) of every rising edge in `samples`
    pub fn decode(&mut self, samples: &[Sample]) -> Vec<(f64, u32)> {
        let mut edges = Vec::new();
        for sample in samples {
            let value = sample.values.get(self.channel).copied().unwrap_or(0.0);
            let code = if value.is_finite() && value > 0.0 {
                value.round() as u32
            } else {
                0
            };
            if code != 0 && code != self.previous {
                edges.push((sample.timestamp, code));
            }
            self.previous = code;
        }
        edges
    }
}
