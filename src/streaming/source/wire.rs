// Newline-delimited JSON messages shared by TCP sources and replay fixtures
//
// A stream starts with one `layout` message, followed by any mix of `chunk`
// and `heartbeat` messages. The clock probe connection exchanges
// `time_request` / `time_reply` pairs.

use crate::streaming::types::{ChannelInfo, ChannelLayout, Sample, StreamError, StreamResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Layout {
        channels: Vec<ChannelInfo>,
        sample_rate: f64,
        #[serde(flatten)]
        identity: StreamIdentity,
    },
    /// Sample-major values, one timestamp per sample
    Chunk {
        timestamps: Vec<f64>,
        samples: Vec<Vec<f32>>,
    },
    Heartbeat,
    TimeRequest,
    TimeReply {
        source_time: f64,
    },
}

/// Name, type and id a source announces about itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl WireMessage {
    pub fn parse(line: &str) -> StreamResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| StreamError::Parse(format!("Invalid message: {}", e)))
    }

    pub fn to_line(&self) -> StreamResult<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| StreamError::Parse(format!("Cannot encode message: {}", e)))?;
        line.push('\n');
        Ok(line)
    }

    pub fn layout(layout: &ChannelLayout) -> Self {
        WireMessage::Layout {
            channels: layout.channels.clone(),
            sample_rate: layout.sample_rate,
            identity: StreamIdentity::default(),
        }
    }

    pub fn chunk(samples: &[Sample]) -> Self {
        WireMessage::Chunk {
            timestamps: samples.iter().map(|s| s.source_timestamp).collect(),
            samples: samples.iter().map(|s| s.values.clone()).collect(),
        }
    }
}

/// Turn a chunk message into samples, checking it against the layout
pub fn decode_chunk(
    timestamps: Vec<f64>,
    samples: Vec<Vec<f32>>,
    layout: &ChannelLayout,
) -> StreamResult<Vec<Sample>> {
    if timestamps.len() != samples.len() {
        return Err(StreamError::Parse(format!(
            "chunk has {} timestamps for {} samples",
            timestamps.len(),
            samples.len()
        )));
    }

    timestamps
        .into_iter()
        .zip(samples)
        .map(|(t, values)| {
            let sample = Sample::from_source(t, values);
            layout.check_sample(&sample)?;
            Ok(sample)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages() {
        let layout = WireMessage::parse(
            r#"{"type":"layout","channels":[{"name":"Fp1","unit":"uV"}],"sample_rate":250.0,"name":"EEG-1"}"#,
        )
        .unwrap();
        match layout {
            WireMessage::Layout {
                channels, identity, ..
            } => {
                assert_eq!(channels[0].name, "Fp1");
                assert_eq!(identity.name.as_deref(), Some("EEG-1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            WireMessage::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            WireMessage::Heartbeat
        );
        assert!(WireMessage::parse("not json").is_err());
    }

    #[test]
    fn test_decode_chunk_checks_width() {
        let layout = ChannelLayout::uniform(2, "uV", 100.0);
        let ok = decode_chunk(vec![0.0, 0.01], vec![vec![1.0, 2.0], vec![3.0, 4.0]], &layout).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1].source_timestamp, 0.01);

        assert!(matches!(
            decode_chunk(vec![0.0], vec![vec![1.0]], &layout),
            Err(StreamError::LayoutMismatch(_))
        ));
        assert!(matches!(
            decode_chunk(vec![0.0, 1.0], vec![vec![1.0, 2.0]], &layout),
            Err(StreamError::Parse(_))
        ));
    }
}
