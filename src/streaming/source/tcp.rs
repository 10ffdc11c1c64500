// TCP socket stream source
//
// Connects to a TCP server and receives newline-delimited JSON messages (see
// `wire`). The first message must be the stream layout. The source clock is
// probed on a second connection to `probe_port` with `time_request` /
// `time_reply` round trips, so probes never queue behind sample data.

use super::wire::{decode_chunk, WireMessage};
use super::{Pulled, SampleChunk, StreamInlet, StreamPredicate};
use crate::streaming::clock::{ClockProbe, LocalClock, ProbeSample};
use crate::streaming::types::{ChannelLayout, Sample, StreamError, StreamResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedRead, LinesCodec};

/// Longest accepted message line
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

pub struct TcpInlet {
    host: String,
    port: u16,
    probe_port: u16,
    predicate: StreamPredicate,
    reader: Option<FramedRead<TcpStream, LinesCodec>>,
    layout: Option<ChannelLayout>,
    pending: VecDeque<Sample>,
}

impl TcpInlet {
    pub fn new(host: String, port: u16, probe_port: u16, predicate: StreamPredicate) -> Self {
        Self {
            host,
            port,
            probe_port,
            predicate,
            reader: None,
            layout: None,
            pending: VecDeque::new(),
        }
    }

    fn take_pending(&mut self, max_samples: usize) -> Pulled {
        let n = max_samples.min(self.pending.len());
        Pulled::Chunk(SampleChunk::new(self.pending.drain(..n).collect()))
    }
}

async fn next_message(
    reader: &mut FramedRead<TcpStream, LinesCodec>,
) -> StreamResult<Option<WireMessage>> {
    match reader.next().await {
        Some(Ok(line)) => WireMessage::parse(&line).map(Some),
        Some(Err(e)) => Err(StreamError::Disconnected(format!("TCP read error: {}", e))),
        None => Ok(None),
    }
}

#[async_trait]
impl StreamInlet for TcpInlet {
    async fn connect(&mut self) -> StreamResult<ChannelLayout> {
        let addr = format!("{}:{}", self.host, self.port);
        log::info!("Connecting to TCP: {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| StreamError::Connection(format!("TCP connection failed: {}", e)))?;
        let mut reader = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let (layout, identity) = match next_message(&mut reader).await? {
            Some(WireMessage::Layout {
                channels,
                sample_rate,
                identity,
            }) => (ChannelLayout::new(channels, sample_rate), identity),
            Some(other) => {
                return Err(StreamError::Connection(format!(
                    "expected a layout message first, got {:?}",
                    other
                )))
            }
            None => {
                return Err(StreamError::Connection(
                    "server closed the connection before announcing a layout".to_string(),
                ))
            }
        };

        if !self.predicate.matches(&identity) {
            return Err(StreamError::Connection(format!(
                "stream {:?} does not match '{}'",
                identity,
                self.predicate.to_query()
            )));
        }

        log::info!(
            "TCP connected: {} channels at {} Hz",
            layout.num_channels(),
            layout.sample_rate
        );

        self.reader = Some(reader);
        self.layout = Some(layout.clone());
        self.pending.clear();
        Ok(layout)
    }

    async fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> StreamResult<Pulled> {
        if !self.pending.is_empty() {
            return Ok(self.take_pending(max_samples));
        }

        let (reader, layout) = match (self.reader.as_mut(), self.layout.as_ref()) {
            (Some(reader), Some(layout)) => (reader, layout),
            _ => {
                return Err(StreamError::Disconnected(
                    "TCP source is not connected".to_string(),
                ))
            }
        };

        let message = match tokio::time::timeout(timeout, next_message(reader)).await {
            Err(_) => return Ok(Pulled::Empty),
            Ok(result) => result?,
        };

        match message {
            None => {
                log::info!("TCP connection closed by server");
                self.reader = None;
                Err(StreamError::Disconnected(
                    "connection closed by server".to_string(),
                ))
            }
            Some(WireMessage::Chunk {
                timestamps,
                samples,
            }) => {
                self.pending.extend(decode_chunk(timestamps, samples, layout)?);
                Ok(self.take_pending(max_samples))
            }
            Some(WireMessage::Heartbeat) => Ok(Pulled::Heartbeat),
            Some(WireMessage::Layout {
                channels,
                sample_rate,
                ..
            }) => {
                // a layout may be repeated, but never changed mid-connection
                ChannelLayout::new(channels, sample_rate).ensure_matches(layout)?;
                Ok(Pulled::Heartbeat)
            }
            Some(other) => {
                log::debug!("Ignoring unexpected message on data connection: {:?}", other);
                Ok(Pulled::Empty)
            }
        }
    }

    fn clock_probe(&self, clock: Arc<dyn LocalClock>) -> StreamResult<Box<dyn ClockProbe>> {
        Ok(Box::new(TcpTimeProbe {
            addr: format!("{}:{}", self.host, self.probe_port),
            clock,
            conn: None,
        }))
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        log::info!("Closing TCP stream {}:{}", self.host, self.port);
        self.reader = None;
        self.layout = None;
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Round trips against the server's time service
struct TcpTimeProbe {
    addr: String,
    clock: Arc<dyn LocalClock>,
    conn: Option<Framed<TcpStream, LinesCodec>>,
}

impl TcpTimeProbe {
    async fn exchange(&mut self) -> StreamResult<ProbeSample> {
        if self.conn.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                StreamError::Connection(format!("time probe connection failed: {}", e))
            })?;
            stream.set_nodelay(true)?;
            self.conn = Some(Framed::new(stream, LinesCodec::new_with_max_length(4096)));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StreamError::Connection("time probe not connected".to_string()))?;

        let request = WireMessage::TimeRequest.to_line()?;
        let send_local = self.clock.now();
        conn.send(request.trim_end())
            .await
            .map_err(|e| StreamError::Disconnected(format!("time probe send failed: {}", e)))?;

        loop {
            let line = match conn.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    return Err(StreamError::Disconnected(format!(
                        "time probe read failed: {}",
                        e
                    )))
                }
                None => {
                    return Err(StreamError::Disconnected(
                        "time probe connection closed".to_string(),
                    ))
                }
            };
            if let WireMessage::TimeReply { source_time } = WireMessage::parse(&line)? {
                return Ok(ProbeSample {
                    send_local,
                    source_ack: source_time,
                    receive_local: self.clock.now(),
                });
            }
        }
    }
}

#[async_trait]
impl ClockProbe for TcpTimeProbe {
    async fn round_trip(&mut self) -> StreamResult<ProbeSample> {
        let result = self.exchange().await;
        if result.is_err() {
            // start over on a fresh connection next time
            self.conn = None;
        }
        result
    }
}
