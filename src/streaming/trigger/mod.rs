// Trigger devices and the bridge that turns their events into markers
//
// A `TriggerDevice` is polled for raw event codes; `TriggerBridge` stamps each
// code on the local clock at read time, tags it with the current clock
// generation, coalesces duplicates inside the debounce window and optionally
// mirrors accepted markers to a software-trigger event file. Codes carried on
// a stim channel of the sample stream are decoded by `StimChannelDecoder` and
// go through the same bridge.
//
// Device latency between the physical event and the read is not corrected.

mod bridge;
mod marker_log;
mod scripted;
#[cfg(target_family = "unix")]
mod serial;
mod stim;

use crate::streaming::types::StreamResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use bridge::{Debouncer, TriggerBridge};
pub use marker_log::{read_marker_log, MarkerLog};
pub use scripted::{ScriptedTriggerDevice, TriggerInjector, TriggerStep};
#[cfg(target_family = "unix")]
pub use serial::SerialTriggerDevice;
pub use stim::StimChannelDecoder;

/// One code read from a trigger device, not yet timestamped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTriggerEvent {
    pub code: u32,
}

/// Polled source of trigger codes
///
/// `read_events` must return promptly with whatever is pending. A transient
/// failure is `StreamError::DeviceRead`; a device that is gone is
/// `StreamError::DeviceDisconnected`.
#[async_trait]
pub trait TriggerDevice: Send {
    async fn read_events(&mut self) -> StreamResult<Vec<RawTriggerEvent>>;

    fn describe(&self) -> String;
}

/// Trigger device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerDescriptor {
    /// Byte codes over a serial line (e.g. an Arduino LPT bridge)
    #[cfg(target_family = "unix")]
    #[serde(rename = "serial")]
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },

    /// Fixed batches of codes, one batch per poll
    #[serde(rename = "scripted")]
    Scripted { batches: Vec<Vec<u32>> },
}

#[cfg(target_family = "unix")]
fn default_baud_rate() -> u32 {
    115_200
}

impl TriggerDescriptor {
    pub fn describe(&self) -> String {
        match self {
            #[cfg(target_family = "unix")]
            TriggerDescriptor::Serial { port, baud_rate } => {
                format!("serial trigger {} at {} baud", port, baud_rate)
            }
            TriggerDescriptor::Scripted { batches } => {
                format!("scripted trigger ({} batches)", batches.len())
            }
        }
    }
}

/// Factory function to create a TriggerDevice from a descriptor
pub fn create_trigger_device(
    descriptor: TriggerDescriptor,
) -> StreamResult<Box<dyn TriggerDevice>> {
    match descriptor {
        #[cfg(target_family = "unix")]
        TriggerDescriptor::Serial { port, baud_rate } => {
            Ok(Box::new(SerialTriggerDevice::open(&port, baud_rate)?))
        }
        TriggerDescriptor::Scripted { batches } => Ok(Box::new(ScriptedTriggerDevice::new(
            batches.into_iter().map(TriggerStep::Codes).collect(),
        ))),
    }
}

/// Opens a trigger device for every connection of a session
pub trait TriggerFactory: Send + Sync {
    fn create(&self) -> StreamResult<Box<dyn TriggerDevice>>;
}

impl TriggerFactory for TriggerDescriptor {
    fn create(&self) -> StreamResult<Box<dyn TriggerDevice>> {
        create_trigger_device(self.clone())
    }
}

impl<F> TriggerFactory for F
where
    F: Fn() -> StreamResult<Box<dyn TriggerDevice>> + Send + Sync,
{
    fn create(&self) -> StreamResult<Box<dyn TriggerDevice>> {
        self()
    }
}
