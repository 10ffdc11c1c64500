// Deterministic trigger device for tests and dry runs

use super::{RawTriggerEvent, TriggerDevice};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Outcome of one scripted read
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerStep {
    Codes(Vec<u32>),
    /// Transient read failure
    Fail,
    /// Device unplugged
    Disconnect,
}

/// Trigger device that plays back a script, then whatever is injected
pub struct ScriptedTriggerDevice {
    steps: VecDeque<TriggerStep>,
    injected: Option<mpsc::UnboundedReceiver<TriggerStep>>,
    disconnected: bool,
}

/// Handle that feeds steps into a running `ScriptedTriggerDevice`
#[derive(Debug, Clone)]
pub struct TriggerInjector {
    tx: mpsc::UnboundedSender<TriggerStep>,
}

impl TriggerInjector {
    /// Queue codes for the next poll; false once the device is gone
    pub fn send_codes(&self, codes: &[u32]) -> bool {
        self.tx.send(TriggerStep::Codes(codes.to_vec())).is_ok()
    }

    pub fn send(&self, step: TriggerStep) -> bool {
        self.tx.send(step).is_ok()
    }
}

impl ScriptedTriggerDevice {
    pub fn new(steps: Vec<TriggerStep>) -> Self {
        Self {
            steps: steps.into(),
            injected: None,
            disconnected: false,
        }
    }

    /// Device driven at runtime through the returned injector
    pub fn injectable() -> (Self, TriggerInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Self {
            steps: VecDeque::new(),
            injected: Some(rx),
            disconnected: false,
        };
        (device, TriggerInjector { tx })
    }

    fn next_step(&mut self) -> Option<TriggerStep> {
        if let Some(step) = self.steps.pop_front() {
            return Some(step);
        }
        let rx = self.injected.as_mut()?;
        let mut codes = Vec::new();
        // merge everything queued since the last poll, stopping at a failure
        loop {
            match rx.try_recv() {
                Ok(TriggerStep::Codes(more)) => codes.extend(more),
                Ok(other) if codes.is_empty() => return Some(other),
                Ok(other) => {
                    self.steps.push_back(other);
                    break;
                }
                Err(_) => break,
            }
        }
        (!codes.is_empty()).then_some(TriggerStep::Codes(codes))
    }
}

#[async_trait]
impl TriggerDevice for ScriptedTriggerDevice {
    async fn read_events(&mut self) -> StreamResult<Vec<RawTriggerEvent>> {
        if self.disconnected {
            return Err(StreamError::DeviceDisconnected(
                "scripted trigger device unplugged".to_string(),
            ));
        }

        match self.next_step() {
            Some(TriggerStep::Codes(codes)) => Ok(codes
                .into_iter()
                .map(|code| RawTriggerEvent { code })
                .collect()),
            Some(TriggerStep::Fail) => Err(StreamError::DeviceRead(
                "scripted read failure".to_string(),
            )),
            Some(TriggerStep::Disconnect) => {
                self.disconnected = true;
                Err(StreamError::DeviceDisconnected(
                    "scripted trigger device unplugged".to_string(),
                ))
            }
            None => Ok(Vec::new()),
        }
    }

    fn describe(&self) -> String {
        "scripted trigger device".to_string()
    }
}
