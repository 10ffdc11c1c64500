// Library exports for the acquisition engine and its tests

pub mod config;
pub mod streaming;

pub use config::{ConfigError, EngineConfig};
pub use streaming::{
    Anchor, ChannelLayout, ClockOffset, ClockStatus, Engine, EngineEvent, EngineState, Epoch,
    Marker, Sample, SessionId, SessionInfo, SessionStats, StreamError, StreamResult,
};
