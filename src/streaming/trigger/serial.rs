// Serial trigger device (Unix-only)
//
// Reads single-byte trigger codes from a serial line, e.g. an Arduino that
// mirrors a parallel-port trigger. Every non-zero byte is one event; zero is
// the idle level and ignored.

use super::{RawTriggerEvent, TriggerDevice};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// How long a poll waits for pending bytes
const READ_WINDOW: Duration = Duration::from_millis(1);

pub struct SerialTriggerDevice {
    port_name: String,
    baud_rate: u32,
    port: SerialStream,
    buf: [u8; 256],
}

impl SerialTriggerDevice {
    pub fn open(port_name: &str, baud_rate: u32) -> StreamResult<Self> {
        log::info!("Opening serial trigger: {} at {} baud", port_name, baud_rate);

        let port = tokio_serial::new(port_name, baud_rate)
            .open_native_async()
            .map_err(|e| StreamError::DeviceDisconnected(format!("Failed to open port: {}", e)))?;

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            port,
            buf: [0; 256],
        })
    }
}

fn codes_from_bytes(bytes: &[u8]) -> Vec<RawTriggerEvent> {
    bytes
        .iter()
        .filter(|b| **b != 0)
        .map(|b| RawTriggerEvent { code: *b as u32 })
        .collect()
}

#[async_trait]
impl TriggerDevice for SerialTriggerDevice {
    async fn read_events(&mut self) -> StreamResult<Vec<RawTriggerEvent>> {
        match tokio::time::timeout(READ_WINDOW, self.port.read(&mut self.buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(StreamError::DeviceDisconnected(format!(
                "{} closed",
                self.port_name
            ))),
            Ok(Ok(n)) => Ok(codes_from_bytes(&self.buf[..n])),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof
                ) =>
            {
                Err(StreamError::DeviceDisconnected(format!(
                    "{}: {}",
                    self.port_name, e
                )))
            }
            Ok(Err(e)) => Err(StreamError::DeviceRead(format!("{}: {}", self.port_name, e))),
        }
    }

    fn describe(&self) -> String {
        format!("serial {} at {} baud", self.port_name, self.baud_rate)
    }
}
