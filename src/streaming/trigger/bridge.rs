use super::{MarkerLog, TriggerDevice};
use crate::streaming::clock::{ClockReader, LocalClock};
use crate::streaming::types::{Marker, StreamError, StreamResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Coalesces repeated codes
///
/// An event is dropped when an accepted event with the same code lies less
/// than `window` seconds away. The window is measured from the last accepted
/// event, so a steady train of duplicates still yields one marker per window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: f64,
    last_accepted: HashMap<u32, f64>,
}

impl Debouncer {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: window_secs.max(0.0),
            last_accepted: HashMap::new(),
        }
    }

    pub fn accept(&mut self, code: u32, timestamp: f64) -> bool {
        if let Some(last) = self.last_accepted.get(&code) {
            if (timestamp - last).abs() < self.window {
                return false;
            }
        }
        self.last_accepted.insert(code, timestamp);
        true
    }

    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }
}

/// Turns trigger device reads into markers on the local timeline
pub struct TriggerBridge {
    device: Option<Box<dyn TriggerDevice>>,
    clock: Arc<dyn LocalClock>,
    sync: ClockReader,
    debouncer: Debouncer,
    log: Option<MarkerLog>,
    coalesced: u64,
    read_failures: u64,
}

impl TriggerBridge {
    pub fn new(
        device: Box<dyn TriggerDevice>,
        clock: Arc<dyn LocalClock>,
        sync: ClockReader,
        debounce_secs: f64,
    ) -> Self {
        log::info!("Trigger bridge on {}", device.describe());
        Self {
            device: Some(device),
            ..Self::without_device(clock, sync, debounce_secs)
        }
    }

    /// Bridge that only handles markers offered directly (stim channel)
    pub fn without_device(clock: Arc<dyn LocalClock>, sync: ClockReader, debounce_secs: f64) -> Self {
        Self {
            device: None,
            clock,
            sync,
            debouncer: Debouncer::new(debounce_secs),
            log: None,
            coalesced: 0,
            read_failures: 0,
        }
    }

    /// Mirror accepted markers to a software-trigger event file
    pub fn with_log(mut self, log: MarkerLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Read pending device events and return the markers they produce
    ///
    /// A failed read yields no markers and is retried on the next poll. A
    /// disconnected device is returned as an error.
    pub async fn poll(&mut self) -> StreamResult<Vec<Marker>> {
        let device = match self.device.as_mut() {
            Some(device) => device,
            None => return Ok(Vec::new()),
        };

        let events = match device.read_events().await {
            Ok(events) => events,
            Err(StreamError::DeviceRead(reason)) => {
                self.read_failures += 1;
                log::warn!("Trigger read failed, retrying next poll: {}", reason);
                return Ok(Vec::new());
            }
            Err(e) => {
                log::error!("Trigger device lost: {}", e);
                return Err(e);
            }
        };

        if events.is_empty() {
            return Ok(Vec::new());
        }

        let read_at = self.clock.now();
        let generation = self.sync.generation();
        Ok(events
            .into_iter()
            .filter_map(|event| self.offer(event.code, read_at, generation))
            .collect())
    }

    /// Debounce one code stamped at `timestamp` (local clock) under clock
    /// `generation`
    pub fn offer(&mut self, code: u32, timestamp: f64, generation: u64) -> Option<Marker> {
        if !self.debouncer.accept(code, timestamp) {
            self.coalesced += 1;
            log::debug!("Coalesced trigger {} at {:.6}", code, timestamp);
            return None;
        }

        let marker = Marker::new(timestamp, code).with_generation(generation);

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&marker) {
                log::warn!("Could not write marker to event file: {}", e);
            }
        }

        Some(marker)
    }

    /// Events dropped by the debouncer so far
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Failed device reads so far
    pub fn read_failures(&self) -> u64 {
        self.read_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockSyncConfig;
    use crate::streaming::clock::{ClockSync, FixedOffsetProbe, ManualClock};
    use crate::streaming::trigger::{ScriptedTriggerDevice, TriggerStep};

    fn bridge_with(steps: Vec<TriggerStep>, clock: Arc<ManualClock>, debounce: f64) -> TriggerBridge {
        let sync = ClockSync::new(
            ClockSyncConfig::default(),
            Box::new(FixedOffsetProbe::new(clock.clone(), 0.0)),
        );
        TriggerBridge::new(
            Box::new(ScriptedTriggerDevice::new(steps)),
            clock,
            sync.reader(),
            debounce,
        )
    }

    #[test]
    fn test_debouncer_window_from_last_accepted() {
        let mut debouncer = Debouncer::new(0.1);
        assert!(debouncer.accept(1, 1.000));
        assert!(!debouncer.accept(1, 1.050));
        assert!(debouncer.accept(2, 1.060));
        assert!(!debouncer.accept(1, 1.099));
        assert!(debouncer.accept(1, 1.100));
    }

    #[tokio::test]
    async fn test_duplicates_within_window_coalesce() {
        let clock = Arc::new(ManualClock::new(1.000));
        let mut bridge = bridge_with(
            vec![TriggerStep::Codes(vec![7]), TriggerStep::Codes(vec![7])],
            clock.clone(),
            0.100,
        );

        let first = bridge.poll().await.unwrap();
        clock.set(1.050);
        let second = bridge.poll().await.unwrap();

        assert_eq!(first.len(), 1);
        assert!((first[0].timestamp - 1.000).abs() < 1e-9);
        assert_eq!(first[0].code, 7);
        assert!(second.is_empty());
        assert_eq!(bridge.coalesced(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_not_fatal_but_disconnect_is() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut bridge = bridge_with(
            vec![
                TriggerStep::Fail,
                TriggerStep::Codes(vec![3]),
                TriggerStep::Disconnect,
            ],
            clock.clone(),
            0.05,
        );

        assert!(bridge.poll().await.unwrap().is_empty());
        assert_eq!(bridge.read_failures(), 1);
        assert_eq!(bridge.poll().await.unwrap().len(), 1);
        assert!(matches!(
            bridge.poll().await,
            Err(StreamError::DeviceDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_markers_carry_clock_generation() {
        let clock = Arc::new(ManualClock::new(5.0));
        let mut sync = ClockSync::new(
            ClockSyncConfig::default(),
            Box::new(FixedOffsetProbe::new(clock.clone(), 0.0)),
        );
        sync.probe().await.unwrap();
        let mut bridge = TriggerBridge::new(
            Box::new(ScriptedTriggerDevice::new(vec![TriggerStep::Codes(vec![6])])),
            clock.clone(),
            sync.reader(),
            0.05,
        );

        let polled = bridge.poll().await.unwrap();
        assert_eq!(polled[0].clock_generation, 1);

        // stim markers carry the generation of the samples they came from
        let marker = bridge.offer(4, 5.0, 3).unwrap();
        assert_eq!(marker.clock_generation, 3);
    }
}
