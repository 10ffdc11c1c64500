// Real-time stream reception, buffering and clock synchronization
//
// This module connects to a clock-bearing stream source, keeps the most recent
// samples in a bounded ring buffer, merges trigger markers into the same local
// timeline and serves copy-out epochs to consumers.
//
// Architecture:
// - `source`: Trait-based inlets (replay fixtures, TCP, LSL) pulled with a timeout
// - `clock`: Round-trip offset/drift estimation published as an atomic snapshot
// - `buffer`: Lock-free single-writer sample and marker rings
// - `reorder`: Bounded reordering of late samples before they reach the ring
// - `trigger`: Polled trigger devices, debounce and stim channel decoding
// - `epoch`: Fixed-window and event-locked extraction
// - `state`: Engine lifecycle state machine
// - `controller`: Session orchestration, reconnect and consumer API

pub mod buffer;
pub mod clock;
pub mod controller;
pub mod epoch;
pub mod reorder;
pub mod source;
pub mod state;
pub mod trigger;
pub mod types;

pub use buffer::{MarkerBuffer, MarkerReader, RingBuffer, RingReader, SharedRing};
pub use clock::{
    ClockOffset, ClockProbe, ClockReader, ClockStatus, ClockSync, FixedOffsetProbe, LocalClock,
    ManualClock, MonotonicClock, ProbeOutcome, ProbeSample, ScriptedProbe,
};
pub use controller::{Engine, SessionId, SessionInfo};
pub use epoch::{Anchor, Epoch, Epocher};
pub use reorder::ReorderWindow;
#[cfg(feature = "lsl-support")]
pub use source::LslInlet;
pub use source::{
    create_inlet, load_recording, InletFactory, InletHealth, InletWatchdog, Pulled, ReplayInlet,
    SampleChunk, ScriptStep, ScriptedInlet, SourceDescriptor, StreamIdentity, StreamInlet,
    StreamPredicate, TcpInlet, WireMessage,
};
pub use state::{DegradedReason, EngineEvent, EngineState, StateMachine, Transition};
#[cfg(target_family = "unix")]
pub use trigger::SerialTriggerDevice;
pub use trigger::{
    create_trigger_device, read_marker_log, Debouncer, MarkerLog, RawTriggerEvent,
    ScriptedTriggerDevice, StimChannelDecoder, TriggerBridge, TriggerDescriptor, TriggerDevice,
    TriggerFactory, TriggerInjector, TriggerStep,
};
pub use types::{
    ChannelInfo, ChannelLayout, Marker, Sample, SessionStats, StreamError, StreamResult,
};
