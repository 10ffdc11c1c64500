// Engine lifecycle
//
// Disconnected -> Connecting -> Streaming <-> Degraded -> Stopping -> Disconnected
//
// A session only leaves Streaming/Degraded for Disconnected by tearing the
// connection down; reconnects always start again from Disconnected.

use crate::streaming::controller::SessionId;
use crate::streaming::types::{Marker, SessionStats, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a streaming session is degraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// Clock estimate reset or lost; epoch extraction is refused
    ClockStale,
    /// Source alive but not delivering samples
    InletStalled,
}

/// Current state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "data")]
pub enum EngineState {
    /// No connection; initial, after loss and after stop
    #[default]
    Disconnected,

    /// Connecting to the source and acquiring the clock
    Connecting,

    /// Samples flowing and clock synchronized
    Streaming,

    /// Connected, but timing or data flow is impaired
    Degraded { reason: DegradedReason },

    /// Stop requested, tearing down
    Stopping,
}

impl EngineState {
    /// Connected and buffering samples
    pub fn is_live(&self) -> bool {
        matches!(self, EngineState::Streaming | EngineState::Degraded { .. })
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Disconnected => write!(f, "disconnected"),
            EngineState::Connecting => write!(f, "connecting"),
            EngineState::Streaming => write!(f, "streaming"),
            EngineState::Degraded { reason } => write!(f, "degraded ({:?})", reason),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Inputs of the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    /// Layout accepted and clock synchronized
    Connected,
    Degrade(DegradedReason),
    Recover,
    /// Fatal error or source loss
    Lost,
    Stop,
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: EngineState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Apply a transition, returning the new state
    ///
    /// Illegal moves leave the state untouched and return `InvalidTransition`.
    pub fn apply(&mut self, transition: Transition) -> StreamResult<EngineState> {
        use EngineState::*;

        let next = match (self.state, transition) {
            (Disconnected, Transition::Connect) => Connecting,
            (Connecting, Transition::Connected) => Streaming,
            (Streaming, Transition::Degrade(reason)) => Degraded { reason },
            (Degraded { reason: current }, Transition::Degrade(reason)) if current != reason => {
                Degraded { reason }
            }
            (Degraded { .. }, Transition::Recover) => Streaming,
            (Connecting | Streaming | Degraded { .. }, Transition::Lost) => Disconnected,
            (Disconnected | Connecting | Streaming | Degraded { .. }, Transition::Stop) => Stopping,
            (Stopping, Transition::Stopped) => Disconnected,
            (state, transition) => {
                return Err(StreamError::InvalidTransition(format!(
                    "{:?} in state {}",
                    transition, state
                )))
            }
        };

        self.state = next;
        Ok(next)
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        session_id: SessionId,
        state: EngineState,
    },
    ClockReset {
        session_id: SessionId,
        generation: u64,
        jump: f64,
    },
    SamplesDropped {
        session_id: SessionId,
        count: u64,
    },
    MarkerRecorded {
        session_id: SessionId,
        marker: Marker,
    },
    Error {
        session_id: SessionId,
        error: String,
    },
    StatsUpdate {
        session_id: SessionId,
        stats: SessionStats,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            EngineEvent::StateChanged { session_id, .. }
            | EngineEvent::ClockReset { session_id, .. }
            | EngineEvent::SamplesDropped { session_id, .. }
            | EngineEvent::MarkerRecorded { session_id, .. }
            | EngineEvent::Error { session_id, .. }
            | EngineEvent::StatsUpdate { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), EngineState::Disconnected);
        assert_eq!(sm.apply(Transition::Connect).unwrap(), EngineState::Connecting);
        assert_eq!(sm.apply(Transition::Connected).unwrap(), EngineState::Streaming);
        assert_eq!(
            sm.apply(Transition::Degrade(DegradedReason::ClockStale)).unwrap(),
            EngineState::Degraded {
                reason: DegradedReason::ClockStale
            }
        );
        assert_eq!(sm.apply(Transition::Recover).unwrap(), EngineState::Streaming);
        assert_eq!(sm.apply(Transition::Stop).unwrap(), EngineState::Stopping);
        assert_eq!(sm.apply(Transition::Stopped).unwrap(), EngineState::Disconnected);
    }

    #[test]
    fn test_loss_then_reconnect() {
        let mut sm = StateMachine::new();
        sm.apply(Transition::Connect).unwrap();
        sm.apply(Transition::Connected).unwrap();
        sm.apply(Transition::Degrade(DegradedReason::InletStalled))
            .unwrap();
        assert_eq!(sm.apply(Transition::Lost).unwrap(), EngineState::Disconnected);
        assert_eq!(sm.apply(Transition::Connect).unwrap(), EngineState::Connecting);
    }

    #[test]
    fn test_no_reconnect_without_teardown() {
        let mut sm = StateMachine::new();
        sm.apply(Transition::Connect).unwrap();
        sm.apply(Transition::Connected).unwrap();

        let err = sm.apply(Transition::Connect).unwrap_err();
        assert!(matches!(err, StreamError::InvalidTransition(_)));
        assert_eq!(sm.state(), EngineState::Streaming);
    }

    #[test]
    fn test_degraded_reason_changes_in_place() {
        let mut sm = StateMachine::new();
        sm.apply(Transition::Connect).unwrap();
        sm.apply(Transition::Connected).unwrap();
        sm.apply(Transition::Degrade(DegradedReason::InletStalled))
            .unwrap();
        assert_eq!(
            sm.apply(Transition::Degrade(DegradedReason::ClockStale)).unwrap(),
            EngineState::Degraded {
                reason: DegradedReason::ClockStale
            }
        );
        // same reason again is not a transition
        assert!(sm
            .apply(Transition::Degrade(DegradedReason::ClockStale))
            .is_err());
    }

    #[test]
    fn test_stopping_only_finishes() {
        let mut sm = StateMachine::new();
        sm.apply(Transition::Stop).unwrap();
        assert!(sm.apply(Transition::Lost).is_err());
        assert!(sm.apply(Transition::Connect).is_err());
        assert!(sm.apply(Transition::Stop).is_err());
        assert_eq!(sm.apply(Transition::Stopped).unwrap(), EngineState::Disconnected);
    }

    #[test]
    fn test_state_json_shape() {
        let json = serde_json::to_string(&EngineState::Degraded {
            reason: DegradedReason::ClockStale,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"Degraded","data":{"reason":"clock_stale"}}"#);
        assert_eq!(
            serde_json::to_string(&EngineState::Streaming).unwrap(),
            r#"{"type":"Streaming"}"#
        );
    }
}
