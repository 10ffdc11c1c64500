// Engine - owns stream sessions and their acquisition tasks
//
// Each session runs on its own task:
// - Connects through an InletFactory (a fresh inlet per attempt) and checks the layout
// - Acquires the clock, then hands the ClockSync to a periodic probing task
// - Pulls chunks, converts them to local time, reorders and pushes them into the ring
// - Polls the trigger bridge and decodes the stim channel into markers
// - Tears the connection down on loss and reconnects with backoff
//
// Consumers only read: status, stats and epochs are served from shared handles
// while the acquisition task stays the single writer of both rings.

use crate::config::EngineConfig;
use crate::streaming::{
    buffer::{MarkerBuffer, RingBuffer, SharedRing},
    clock::{ClockReader, ClockSync, LocalClock, MonotonicClock, ProbeOutcome},
    epoch::{Anchor, Epoch, Epocher},
    reorder::ReorderWindow,
    source::{InletFactory, InletHealth, InletWatchdog, Pulled, SampleChunk, SourceDescriptor, StreamInlet},
    state::{DegradedReason, EngineEvent, EngineState, StateMachine, Transition},
    trigger::{MarkerLog, StimChannelDecoder, TriggerBridge, TriggerDescriptor, TriggerFactory},
    types::{ChannelLayout, Marker, Sample, SessionStats, StatCounters, StreamError, StreamResult},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pause between back-to-back probes while acquiring the clock
const ACQUIRE_PAUSE: Duration = Duration::from_millis(10);

/// Interval of `EngineEvent::StatsUpdate`
const STATS_INTERVAL: Duration = Duration::from_millis(500);

/// Re-check interval of `Engine::wait_until`
const STATE_POLL: Duration = Duration::from_millis(5);

type EventCallback = Arc<RwLock<Option<Box<dyn Fn(EngineEvent) + Send + Sync>>>>;

/// Identifier of one stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StreamError::Parse(format!("invalid session id '{}': {}", s, e)))
    }
}

/// Snapshot of a session for consumers
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub state: EngineState,
    /// Layout of the current connection
    pub layout: Option<ChannelLayout>,
    pub last_error: Option<String>,
}

/// Read handles of the current connection
#[derive(Clone)]
struct LiveSession {
    layout: ChannelLayout,
    ring: SharedRing,
    epocher: Epocher,
}

/// State shared between a session task and the engine
struct SessionShared {
    id: SessionId,
    source: String,
    source_key: Option<String>,
    started_at: DateTime<Utc>,
    state: RwLock<StateMachine>,
    counters: StatCounters,
    live: RwLock<Option<LiveSession>>,
    last_error: RwLock<Option<String>>,
    cancel: CancellationToken,
    events: EventCallback,
}

impl SessionShared {
    fn state(&self) -> EngineState {
        self.state.read().state()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(callback) = self.events.read().as_ref() {
            callback(event);
        }
    }

    /// Apply a lifecycle transition; rejected moves are ignored
    fn transition(&self, transition: Transition) -> bool {
        let applied = self.state.write().apply(transition);
        match applied {
            Ok(state) => {
                log::info!("Session {}: {}", self.id, state);
                self.emit(EngineEvent::StateChanged {
                    session_id: self.id,
                    state,
                });
                true
            }
            Err(e) => {
                log::debug!("Session {}: {}", self.id, e);
                false
            }
        }
    }

    /// Move between Streaming and Degraded to reflect `reason`
    fn set_degraded(&self, reason: Option<DegradedReason>) {
        let transition = match (self.state(), reason) {
            (EngineState::Streaming, Some(reason)) => Transition::Degrade(reason),
            (EngineState::Degraded { reason: current }, Some(reason)) if current != reason => {
                Transition::Degrade(reason)
            }
            (EngineState::Degraded { .. }, None) => Transition::Recover,
            _ => return,
        };
        self.transition(transition);
    }

    fn record_error(&self, error: &StreamError) {
        *self.last_error.write() = Some(error.to_string());
        self.emit(EngineEvent::Error {
            session_id: self.id,
            error: error.to_string(),
        });
    }

    fn set_live(&self, live: LiveSession) {
        *self.live.write() = Some(live);
    }

    fn clear_live(&self) {
        *self.live.write() = None;
    }

    fn stats(&self) -> SessionStats {
        let (buffered, capacity) = match self.live.read().as_ref() {
            Some(live) => {
                let (ring, _) = live.ring.current();
                (ring.len(), ring.capacity())
            }
            None => (0, 0),
        };
        self.counters.snapshot(buffered, capacity)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            source: self.source.clone(),
            started_at: self.started_at,
            state: self.state(),
            layout: self.live.read().as_ref().map(|live| live.layout.clone()),
            last_error: self.last_error.read().clone(),
        }
    }
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    task: JoinHandle<()>,
}

/// Acquisition engine
///
/// One session per physical stream. `start` returns immediately with the
/// session in `Connecting`; use `status` or `wait_until` to follow it.
pub struct Engine {
    config: Arc<EngineConfig>,
    clock: Arc<dyn LocalClock>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    event_callback: EventCallback,
}

impl Engine {
    /// Create an engine on the monotonic local clock
    pub fn new(config: EngineConfig) -> StreamResult<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create an engine on an explicit local clock
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn LocalClock>) -> StreamResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            clock,
            sessions: RwLock::new(HashMap::new()),
            event_callback: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local clock every session timestamps against
    pub fn local_clock(&self) -> Arc<dyn LocalClock> {
        Arc::clone(&self.clock)
    }

    /// Set event callback function
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        *self.event_callback.write() = Some(Box::new(callback));
    }

    /// Start a session on `source`, optionally with a trigger device.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        source: SourceDescriptor,
        trigger: Option<TriggerDescriptor>,
    ) -> StreamResult<SessionId> {
        let triggers = trigger.map(|t| Arc::new(t) as Arc<dyn TriggerFactory>);
        self.start_with(Arc::new(source), triggers)
    }

    /// Start a session on custom inlet and trigger factories
    pub fn start_with(
        &self,
        inlets: Arc<dyn InletFactory>,
        triggers: Option<Arc<dyn TriggerFactory>>,
    ) -> StreamResult<SessionId> {
        let source_key = inlets.source_key();
        let mut sessions = self.sessions.write();

        if let Some(key) = source_key.as_ref() {
            let busy = sessions.values().any(|handle| {
                handle.shared.source_key.as_ref() == Some(key) && !handle.task.is_finished()
            });
            if busy {
                return Err(StreamError::AlreadyRunning(key.clone()));
            }
        }

        let id = SessionId::new();
        let shared = Arc::new(SessionShared {
            id,
            source: source_key.clone().unwrap_or_else(|| "custom source".to_string()),
            source_key,
            started_at: Utc::now(),
            state: RwLock::new(StateMachine::new()),
            counters: StatCounters::default(),
            live: RwLock::new(None),
            last_error: RwLock::new(None),
            cancel: CancellationToken::new(),
            events: Arc::clone(&self.event_callback),
        });

        log::info!("Starting session {} on {}", id, shared.source);

        let runner = SessionRunner {
            shared: Arc::clone(&shared),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            inlets,
            triggers,
        };
        let task = tokio::spawn(runner.run());
        sessions.insert(id, SessionHandle { shared, task });

        Ok(id)
    }

    fn session(&self, id: SessionId) -> StreamResult<Arc<SessionShared>> {
        self.sessions
            .read()
            .get(&id)
            .map(|handle| Arc::clone(&handle.shared))
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))
    }

    /// Whether the session task has ended (or the session is gone)
    fn is_finished(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .get(&id)
            .map_or(true, |handle| handle.task.is_finished())
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn status(&self, id: SessionId) -> StreamResult<EngineState> {
        Ok(self.session(id)?.state())
    }

    pub fn session_info(&self, id: SessionId) -> StreamResult<SessionInfo> {
        Ok(self.session(id)?.info())
    }

    pub fn stats(&self, id: SessionId) -> StreamResult<SessionStats> {
        Ok(self.session(id)?.stats())
    }

    /// Epoch handle on the session's current connection
    ///
    /// The handle stays valid for that connection only; after a reconnect a
    /// new one must be taken.
    pub fn epocher(&self, id: SessionId) -> StreamResult<Epocher> {
        let shared = self.session(id)?;
        let state = shared.state();
        if !state.is_live() {
            return Err(StreamError::NotStreaming(state.to_string()));
        }
        let live = shared.live.read();
        live.as_ref()
            .map(|live| live.epocher.clone())
            .ok_or_else(|| StreamError::NotStreaming(state.to_string()))
    }

    /// Extract `[anchor - pre, anchor + post]` from the session's buffers
    pub fn extract_epoch(
        &self,
        id: SessionId,
        anchor: Anchor,
        pre: f64,
        post: f64,
    ) -> StreamResult<Epoch> {
        self.epocher(id)?.extract(anchor, pre, post)
    }

    /// Like `extract_epoch`, waiting up to `timeout` for the window to be recorded
    pub async fn wait_for_epoch(
        &self,
        id: SessionId,
        anchor: Anchor,
        pre: f64,
        post: f64,
        timeout: Duration,
    ) -> StreamResult<Epoch> {
        let epocher = self.epocher(id)?;
        epocher
            .wait_for(anchor, pre, post, tokio::time::Instant::now() + timeout)
            .await
    }

    /// Wait until the session's state satisfies `predicate`
    ///
    /// Fails with `Timeout` when `timeout` passes first, and with
    /// `Disconnected` (carrying the last error) when the session ends first.
    pub async fn wait_until<F>(
        &self,
        id: SessionId,
        timeout: Duration,
        predicate: F,
    ) -> StreamResult<EngineState>
    where
        F: Fn(&EngineState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let shared = self.session(id)?;
            // read before the state: a finished task has published its final state
            let finished = self.is_finished(id);
            let state = shared.state();
            if predicate(&state) {
                return Ok(state);
            }
            if finished {
                let reason = shared
                    .last_error
                    .read()
                    .clone()
                    .unwrap_or_else(|| "session ended".to_string());
                return Err(StreamError::Disconnected(reason));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StreamError::Timeout(format!(
                    "session {} still {} after {:?}",
                    id, state, timeout
                )));
            }
            tokio::time::sleep(STATE_POLL).await;
        }
    }

    /// Stop a session and forget it
    pub async fn stop(&self, id: SessionId) -> StreamResult<()> {
        let handle = self
            .sessions
            .write()
            .remove(&id)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;

        log::info!("Stopping session {}", id);

        handle.shared.transition(Transition::Stop);
        handle.shared.cancel.cancel();

        if let Err(e) = handle.task.await {
            log::error!("Session {} task failed: {}", id, e);
        }

        handle.shared.clear_live();
        handle.shared.transition(Transition::Stopped);

        log::info!("Session {} stopped", id);
        Ok(())
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        for id in self.sessions() {
            if let Err(e) = self.stop(id).await {
                log::warn!("Failed to stop session {}: {}", id, e);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for handle in self.sessions.get_mut().values() {
            handle.shared.cancel.cancel();
        }
    }
}

/// Everything a session task needs
struct SessionRunner {
    shared: Arc<SessionShared>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn LocalClock>,
    inlets: Arc<dyn InletFactory>,
    triggers: Option<Arc<dyn TriggerFactory>>,
}

impl SessionRunner {
    /// Connect, stream, and reconnect until stopped or out of attempts
    async fn run(self) {
        let id = self.shared.id;
        let mut attempt = 0u32;

        loop {
            if self.shared.cancel.is_cancelled() || !self.shared.transition(Transition::Connect) {
                break;
            }

            let mut streamed = false;
            let result = self.run_connection(&mut streamed).await;
            self.shared.clear_live();

            let error = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            log::error!("Session {}: connection ended: {}", id, error);
            self.shared.record_error(&error);
            self.shared.transition(Transition::Lost);

            if error.is_permanent() {
                log::error!("Session {}: not reconnecting after a permanent error", id);
                break;
            }

            if streamed {
                attempt = 0;
            }
            attempt += 1;

            let delay = match self.config.reconnect.backoff(attempt) {
                Some(delay) => delay,
                None => {
                    if self.config.reconnect.enabled {
                        log::warn!(
                            "Session {}: giving up after {} reconnect attempts",
                            id,
                            attempt - 1
                        );
                    }
                    break;
                }
            };

            StatCounters::add(&self.shared.counters.reconnect_attempts, 1);
            log::info!(
                "Session {}: reconnecting in {:?} (attempt {}/{})",
                id,
                delay,
                attempt,
                self.config.reconnect.max_attempts
            );

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::debug!("Session {} task finished", id);
    }

    /// One connection: `Ok` when stopped, `Err` when the connection was lost
    async fn run_connection(&self, streamed: &mut bool) -> StreamResult<()> {
        let mut inlet = self.inlets.create()?;
        let timeout_ms = self.config.inlet.connect_timeout_ms;

        log::info!("Session {}: connecting to {}", self.shared.id, inlet.describe());

        let connected = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Ok(()),
            connected = tokio::time::timeout(Duration::from_millis(timeout_ms), inlet.connect()) => connected,
        };
        let layout = match connected {
            Ok(layout) => layout?,
            Err(_) => {
                return Err(StreamError::Connection(format!(
                    "{} did not connect within {} ms",
                    inlet.describe(),
                    timeout_ms
                )))
            }
        };

        let result = self.stream(inlet.as_mut(), layout, streamed).await;

        if let Err(e) = inlet.disconnect().await {
            log::warn!("Session {}: disconnect failed: {}", self.shared.id, e);
        }

        result
    }

    async fn stream(
        &self,
        inlet: &mut dyn StreamInlet,
        layout: ChannelLayout,
        streamed: &mut bool,
    ) -> StreamResult<()> {
        let id = self.shared.id;

        layout.ensure_regular_rate()?;
        if let Some(expected) = self.config.expected_layout.as_ref() {
            layout.ensure_matches(expected)?;
        }
        let decoder = match self.config.trigger.stim_channel.as_deref() {
            Some(name) => Some(StimChannelDecoder::new(&layout, name)?),
            None => None,
        };

        log::info!(
            "Session {}: {} channels @ {} Hz",
            id,
            layout.num_channels(),
            layout.sample_rate
        );

        let probe = inlet.clock_probe(Arc::clone(&self.clock))?;
        let mut sync = ClockSync::new(self.config.clock.clone(), probe);
        if !self.acquire_clock(&mut sync).await? {
            return Ok(());
        }
        let clock = sync.reader();

        let debounce = self.config.trigger.debounce_secs();
        let mut bridge = match self.triggers.as_ref() {
            Some(factory) => {
                TriggerBridge::new(factory.create()?, Arc::clone(&self.clock), clock.clone(), debounce)
            }
            None => TriggerBridge::without_device(Arc::clone(&self.clock), clock.clone(), debounce),
        };
        if let Some(path) = self.config.trigger.marker_log.as_ref() {
            bridge = bridge.with_log(MarkerLog::open(path)?);
        }

        let ring = RingBuffer::with_duration(&layout, self.config.buffer.duration_secs)?;
        let markers = MarkerBuffer::new(self.config.buffer.marker_capacity);
        let generation = clock.generation();
        let shared_ring = SharedRing::new(ring.reader(), generation);
        let epocher = Epocher::new(
            shared_ring.clone(),
            markers.reader(),
            clock.clone(),
            Arc::clone(&self.clock),
        );
        self.shared.set_live(LiveSession {
            layout: layout.clone(),
            ring: shared_ring.clone(),
            epocher,
        });

        let probing = self.shared.cancel.child_token();
        let clock_task = tokio::spawn(probe_clock(
            sync,
            self.config.clock.probe_interval(),
            probing.clone(),
            Arc::clone(&self.shared),
        ));

        let mut acquisition = Acquisition {
            shared: Arc::clone(&self.shared),
            config: Arc::clone(&self.config),
            reorder: ReorderWindow::new(self.config.inlet.reorder_window),
            layout,
            clock,
            generation,
            ring,
            shared_ring,
            markers,
            ready: Vec::new(),
            decoder,
            bridge,
            seen_coalesced: 0,
            seen_read_failures: 0,
        };

        if self.shared.transition(Transition::Connected) {
            *streamed = true;
        }
        let result = acquisition.run(inlet).await;

        probing.cancel();
        if let Err(e) = clock_task.await {
            log::warn!("Session {}: clock task ended abnormally: {}", id, e);
        }

        result
    }

    /// Probe back to back until the estimate is usable
    ///
    /// Returns false when the session was stopped meanwhile.
    async fn acquire_clock(&self, sync: &mut ClockSync) -> StreamResult<bool> {
        let id = self.shared.id;
        let timeout_ms = self.config.inlet.connect_timeout_ms;

        let acquire = async {
            loop {
                match sync.probe().await {
                    Ok(offset) if offset.is_usable() => return offset,
                    Ok(_) => {}
                    Err(e) => log::debug!("Session {}: clock probe failed: {}", id, e),
                }
                tokio::time::sleep(ACQUIRE_PAUSE).await;
            }
        };

        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Ok(false),
            acquired = tokio::time::timeout(Duration::from_millis(timeout_ms), acquire) => match acquired {
                Ok(offset) => {
                    log::info!(
                        "Session {}: clock synchronized, offset {:.6}s (generation {})",
                        id,
                        offset.offset,
                        offset.generation
                    );
                    Ok(true)
                }
                Err(_) => Err(StreamError::Connection(format!(
                    "clock did not synchronize within {} ms",
                    timeout_ms
                ))),
            },
        }
    }
}

/// Periodic clock probing; the only writer of the session's clock estimate
async fn probe_clock(
    mut sync: ClockSync,
    interval: Duration,
    cancel: CancellationToken,
    shared: Arc<SessionShared>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately and the clock was just acquired
    tick.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            probed = sync.probe() => probed,
        };

        match probed {
            Ok(offset) => {
                if let Some(ProbeOutcome::Reset { jump }) = sync.last_outcome() {
                    StatCounters::add(&shared.counters.clock_resets, 1);
                    shared.emit(EngineEvent::ClockReset {
                        session_id: shared.id,
                        generation: offset.generation,
                        jump,
                    });
                }
            }
            Err(e) => log::warn!(
                "Session {}: clock probe failed ({} in a row): {}",
                shared.id,
                sync.consecutive_failures(),
                e
            ),
        }
    }

    log::debug!("Session {}: clock probing stopped", shared.id);
}

/// Single writer of one connection's sample and marker rings
struct Acquisition {
    shared: Arc<SessionShared>,
    config: Arc<EngineConfig>,
    layout: ChannelLayout,
    clock: ClockReader,
    /// Clock generation of the samples in `ring`
    generation: u64,
    ring: RingBuffer,
    shared_ring: SharedRing,
    markers: MarkerBuffer,
    reorder: ReorderWindow,
    ready: Vec<Sample>,
    decoder: Option<StimChannelDecoder>,
    bridge: TriggerBridge,
    seen_coalesced: u64,
    seen_read_failures: u64,
}

impl Acquisition {
    async fn run(&mut self, inlet: &mut dyn StreamInlet) -> StreamResult<()> {
        let inlet_config = self.config.inlet.clone();
        let pull_timeout = Duration::from_millis(inlet_config.pull_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.trigger.poll_interval_ms);
        // keep pulls short enough that the trigger device is read on schedule
        let pull_slice = if self.bridge.has_device() {
            pull_timeout.min(poll_interval)
        } else {
            pull_timeout
        };

        let mut watchdog = InletWatchdog::new(
            Duration::from_millis(inlet_config.stall_after_ms),
            Duration::from_millis(inlet_config.disconnect_grace_ms),
            Instant::now(),
        );
        let mut last_trigger_poll = Instant::now();
        let mut last_stats = Instant::now();
        let cancel = self.shared.cancel.clone();

        loop {
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                pulled = inlet.pull_chunk(inlet_config.max_chunk_samples, pull_slice) => pulled?,
            };

            let now = Instant::now();
            let health = watchdog.observe(&pulled, now);

            match pulled {
                Pulled::Chunk(chunk) if !chunk.is_empty() => self.ingest(chunk)?,
                // quiet source: nothing late is coming, release what is held back
                _ => self.release_held(),
            }

            if self.bridge.has_device() && now.duration_since(last_trigger_poll) >= poll_interval {
                last_trigger_poll = now;
                for marker in self.bridge.poll().await? {
                    self.record_marker(marker);
                }
            }
            self.sync_bridge_counters();

            if health == InletHealth::Lost {
                return Err(StreamError::Disconnected(format!(
                    "no samples or keep-alive for {} ms",
                    inlet_config.disconnect_grace_ms
                )));
            }

            let degraded = if self.clock.is_stale() {
                Some(DegradedReason::ClockStale)
            } else if health == InletHealth::Stalled {
                Some(DegradedReason::InletStalled)
            } else {
                None
            };
            self.shared.set_degraded(degraded);

            if now.duration_since(last_stats) >= STATS_INTERVAL {
                last_stats = now;
                self.shared.emit(EngineEvent::StatsUpdate {
                    session_id: self.shared.id,
                    stats: self.shared.stats(),
                });
            }
        }
    }

    /// Convert a chunk to local time and push it through the reorder window
    fn ingest(&mut self, chunk: SampleChunk) -> StreamResult<()> {
        StatCounters::add(&self.shared.counters.chunks_received, 1);
        StatCounters::add(&self.shared.counters.samples_received, chunk.len() as u64);

        let offset = self.clock.snapshot();
        if offset.generation != self.generation {
            self.restart_timeline(offset.generation)?;
        }

        let mut dropped = 0u64;
        for mut sample in chunk.samples {
            self.layout.check_sample(&sample)?;
            sample.timestamp = offset.to_local(sample.source_timestamp);
            if !self.reorder.offer(sample, &mut self.ready) {
                dropped += 1;
            }
        }
        dropped += self.commit_ready();
        self.count_dropped(dropped);
        Ok(())
    }

    fn release_held(&mut self) {
        if self.reorder.pending() == 0 {
            return;
        }
        self.reorder.flush(&mut self.ready);
        let rejected = self.commit_ready();
        self.count_dropped(rejected);
    }

    fn count_dropped(&self, dropped: u64) {
        if dropped > 0 {
            StatCounters::add(&self.shared.counters.samples_dropped_late, dropped);
            self.shared.emit(EngineEvent::SamplesDropped {
                session_id: self.shared.id,
                count: dropped,
            });
        }
    }

    /// Push released samples and their stim markers; returns samples rejected
    fn commit_ready(&mut self) -> u64 {
        if self.ready.is_empty() {
            return 0;
        }

        let edges = match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(&self.ready),
            None => Vec::new(),
        };

        let mut rejected = 0u64;
        for sample in self.ready.drain(..) {
            if let Err(e) = self.ring.push(&sample) {
                log::warn!("Session {}: sample not buffered: {}", self.shared.id, e);
                rejected += 1;
            }
        }

        for (timestamp, code) in edges {
            if let Some(marker) = self.bridge.offer(code, timestamp, self.generation) {
                self.record_marker(marker);
            }
        }

        rejected
    }

    /// Start a fresh ring for a new clock generation
    ///
    /// Samples still held for reordering were converted under the old
    /// estimate; they are discarded and counted as dropped.
    fn restart_timeline(&mut self, generation: u64) -> StreamResult<()> {
        let discarded = self.reorder.pending() as u64;
        log::warn!(
            "Session {}: clock generation {} -> {}, starting a new sample timeline ({} held samples discarded)",
            self.shared.id,
            self.generation,
            generation,
            discarded
        );
        self.reorder.reset();
        self.count_dropped(discarded);

        self.ring = RingBuffer::with_duration(&self.layout, self.config.buffer.duration_secs)?;
        self.shared_ring.replace(self.ring.reader(), generation);
        self.generation = generation;
        Ok(())
    }

    fn record_marker(&mut self, marker: Marker) {
        log::debug!(
            "Session {}: marker {} at {:.6}",
            self.shared.id,
            marker.code,
            marker.timestamp
        );
        self.markers.push(marker);
        StatCounters::add(&self.shared.counters.markers_recorded, 1);
        self.shared.emit(EngineEvent::MarkerRecorded {
            session_id: self.shared.id,
            marker,
        });
    }

    fn sync_bridge_counters(&mut self) {
        let coalesced = self.bridge.coalesced();
        StatCounters::add(
            &self.shared.counters.markers_coalesced,
            coalesced - self.seen_coalesced,
        );
        self.seen_coalesced = coalesced;

        let failures = self.bridge.read_failures();
        StatCounters::add(
            &self.shared.counters.trigger_read_failures,
            failures - self.seen_read_failures,
        );
        self.seen_read_failures = failures;
    }
}
