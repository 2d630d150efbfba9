//! Session controller
//!
//! Single writer for the session state. Commands and engine events both go
//! through one lock that is never held across an await; engine work runs on
//! spawned tasks and re-enters through the lock when it completes. Every
//! engine event carries the generation of the session that produced it, and
//! events for anything but the live session are dropped.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Session, SessionState};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::video::{CaptureConfig, CaptureSource};
use crate::webrtc::engine::{
    ConnectionState, EngineEvent, EngineFactory, EventSink, SessionEnvelope, TransportEngine,
};
use crate::webrtc::signaling::{self, SignalKind};

pub const STATUS_PREPARING: &str = "Streaming: preparing...";
pub const STATUS_OFFERING: &str = "Streaming: offering...";
pub const STATUS_OFFER_READY: &str = "Offer ready, scan/paste answer";
pub const STATUS_ANSWER_APPLIED: &str = "Answer applied, connecting...";
pub const STATUS_CONNECTED: &str = "Streaming: CONNECTED";
pub const STATUS_STOPPED: &str = "Stopped";
pub const STATUS_NOT_BOUND: &str = "Service not bound";

/// Mutable controller state, guarded by a single lock
struct Core {
    /// Last generation handed out
    generation: u64,
    session: Session,
    /// Engine of the live session
    engine: Option<Arc<dyn TransportEngine>>,
    /// Most recent background teardown
    teardown: Option<JoinHandle<()>>,
    /// Setup task of the most recent start
    setup: Option<JoinHandle<()>>,
}

impl Core {
    fn is_live(&self, session_id: u64) -> bool {
        self.session.id == session_id && self.session.state.is_active()
    }
}

/// Drives one streaming session at a time
pub struct SessionController {
    core: Mutex<Core>,
    factory: Arc<dyn EngineFactory>,
    events: Arc<EventBus>,
    state_tx: watch::Sender<Session>,
    event_tx: mpsc::Sender<SessionEnvelope>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

    /// Create a controller and start its engine event pump
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        events: Arc<EventBus>,
        event_queue_capacity: usize,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(event_queue_capacity.max(1));
        let (state_tx, _) = watch::channel(Session::idle());

        let controller = Arc::new(Self {
            core: Mutex::new(Core {
                generation: 0,
                session: Session::idle(),
                engine: None,
                teardown: None,
                setup: None,
            }),
            factory,
            events,
            state_tx,
            event_tx,
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::run_event_pump(Arc::downgrade(&controller), event_rx));
        *controller.pump.lock() = Some(pump);

        controller
    }

    /// Start a new session, stopping the current one first
    ///
    /// Returns the new session id right away. Engine setup runs in the
    /// background; failures land in [`SessionState::Error`] and are reported
    /// on the event bus.
    pub fn start(
        self: &Arc<Self>,
        config: CaptureConfig,
        source: Box<dyn CaptureSource>,
    ) -> Result<u64> {
        if self.event_tx.is_closed() {
            return Err(AppError::InvalidState(
                "session controller is shut down".to_string(),
            ));
        }

        let engine = self.factory.create_engine();
        let sink_tx = self.event_tx.clone();
        let controller = Arc::clone(self);

        let mut core = self.core.lock();
        if core.session.is_active() {
            info!("Stopping session {} before starting a new one", core.session.id);
            self.stop_locked(&mut core);
        }

        core.generation += 1;
        let id = core.generation;
        core.engine = Some(engine.clone());
        core.session = Session::preparing(id, config);
        self.announce(&mut core, STATUS_PREPARING);
        info!("Session {} starting ({})", id, config);

        // A superseded setup may still hold its source; it releases it before finishing
        let previous_setup = core.setup.take();
        let previous_teardown = core.teardown.take();
        let sink = EventSink::new(id, sink_tx);
        core.setup = Some(tokio::spawn(async move {
            for (what, previous) in [("setup", previous_setup), ("teardown", previous_teardown)] {
                if let Some(previous) = previous {
                    if let Err(e) = previous.await {
                        warn!("Previous session {} failed: {}", what, e);
                    }
                }
            }
            controller.run_start(id, engine, config, source, sink).await;
        }));

        Ok(id)
    }

    async fn run_start(
        &self,
        id: u64,
        engine: Arc<dyn TransportEngine>,
        config: CaptureConfig,
        mut source: Box<dyn CaptureSource>,
        sink: EventSink,
    ) {
        if !self.is_live(id) {
            debug!("Session {} superseded before engine setup", id);
            source.release().await;
            return;
        }

        if let Err(e) = engine.initialize().await {
            source.release().await;
            self.fail(id, "Error starting stream", &e);
            return;
        }

        if !self.is_live(id) {
            source.release().await;
            engine.teardown().await;
            return;
        }

        if let Err(e) = engine.create_connection(config, source, sink).await {
            self.fail(id, "Error starting stream", &e);
            return;
        }

        let live = {
            let mut core = self.core.lock();
            let live = core.is_live(id);
            if live && core.session.state == SessionState::Preparing {
                self.enter(&mut core, SessionState::Offering, STATUS_OFFERING);
            }
            live
        };
        if !live {
            // Stopped while the connection was being created
            engine.teardown().await;
            return;
        }

        if let Err(e) = engine.create_offer().await {
            self.fail(id, "Error creating offer", &e);
            return;
        }
        debug!("Session {} offer requested, gathering candidates", id);
    }

    /// Apply the remote answer blob
    ///
    /// A malformed or wrong-kind blob is rejected without touching the
    /// engine or the state, so the user can paste again.
    pub fn apply_answer(self: &Arc<Self>, text: &str) -> Result<()> {
        let (id, engine, payload) = {
            let mut core = self.core.lock();
            let id = core.session.id;

            match core.session.state {
                SessionState::Idle | SessionState::Stopped | SessionState::Error => {
                    self.notice(id, STATUS_NOT_BOUND);
                    return Err(AppError::NotBound);
                }
                SessionState::Preparing | SessionState::Offering => {
                    let e = AppError::InvalidState(format!(
                        "no offer issued yet (session is {})",
                        core.session.state
                    ));
                    self.notice(id, format!("Answer rejected: {}", e));
                    return Err(e);
                }
                SessionState::WaitingAnswer | SessionState::Connected => {}
            }

            let message = match signaling::decode_expecting(text, SignalKind::Answer) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Session {} rejected answer: {}", id, e);
                    self.notice(id, format!("Invalid answer ({}): {}", e.category(), e));
                    return Err(e);
                }
            };

            if core.session.state == SessionState::Connected {
                self.notice(id, "Already connected, answer ignored");
                return Ok(());
            }
            if core.session.remote_answer.is_some() {
                self.notice(id, "Answer already applied, ignoring");
                return Ok(());
            }

            let Some(engine) = core.engine.clone() else {
                self.notice(id, STATUS_NOT_BOUND);
                return Err(AppError::NotBound);
            };

            core.session.remote_answer = Some(message.payload.clone());
            self.publish_snapshot(&mut core);
            self.notice(id, STATUS_ANSWER_APPLIED);
            (id, engine, message.payload)
        };

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.apply_remote_answer(payload).await {
                controller.fail(id, "Error applying answer", &e);
            }
        });

        Ok(())
    }

    /// Stop the current session
    ///
    /// The state reads `stopped` when this returns; the engine is torn down
    /// in the background. Calling it again is a no-op.
    pub fn stop(&self) {
        let mut core = self.core.lock();
        if core.session.state == SessionState::Stopped {
            debug!("Session {} already stopped", core.session.id);
            return;
        }
        self.stop_locked(&mut core);
    }

    /// Stop and wait until the engine and capture source have been released
    pub async fn shutdown(&self) {
        self.stop();
        let (setup, teardown) = {
            let mut core = self.core.lock();
            (core.setup.take(), core.teardown.take())
        };
        if let Some(handle) = setup {
            if let Err(e) = handle.await {
                warn!("Session setup failed: {}", e);
            }
        }
        if let Some(handle) = teardown {
            if let Err(e) = handle.await {
                warn!("Session teardown failed: {}", e);
            }
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.core.lock().session.state
    }

    /// Latest session snapshot
    pub fn snapshot(&self) -> Session {
        self.core.lock().session.clone()
    }

    /// Watch session snapshots
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state_tx.subscribe()
    }

    /// Subscribe to status events
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn run_event_pump(controller: Weak<Self>, mut rx: mpsc::Receiver<SessionEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let Some(controller) = controller.upgrade() else {
                break;
            };
            controller.handle_engine_event(envelope);
        }
        debug!("Session event pump stopped");
    }

    fn handle_engine_event(&self, envelope: SessionEnvelope) {
        let mut core = self.core.lock();
        let id = envelope.session_id;
        if !core.is_live(id) {
            debug!(
                "Discarding event from stale session {} (current {}, {})",
                id, core.session.id, core.session.state
            );
            return;
        }

        match envelope.event {
            EngineEvent::GatheringComplete(sdp) => {
                if core.session.state != SessionState::Offering {
                    debug!("Session {} ignoring gathering complete in {}", id, core.session.state);
                    return;
                }
                core.session.local_offer = Some(signaling::encode(SignalKind::Offer, &sdp));
                self.enter(&mut core, SessionState::WaitingAnswer, STATUS_OFFER_READY);
            }
            EngineEvent::ConnectionStateChanged(state) => match state {
                ConnectionState::Connected => {
                    if core.session.state != SessionState::Connected {
                        self.enter(&mut core, SessionState::Connected, STATUS_CONNECTED);
                    }
                }
                ConnectionState::Failed => {
                    let e = AppError::EngineFailure("peer connection failed".to_string());
                    self.fail_locked(&mut core, "Streaming error", &e);
                }
                ConnectionState::Disconnected => {
                    self.notice(id, "Connection interrupted, waiting for recovery");
                }
                ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {
                    debug!("Session {} connection state: {}", id, state);
                }
            },
            EngineEvent::Failure(reason) => {
                let e = AppError::EngineFailure(reason);
                self.fail_locked(&mut core, "Streaming error", &e);
            }
        }
    }

    fn is_live(&self, session_id: u64) -> bool {
        self.core.lock().is_live(session_id)
    }

    fn fail(&self, session_id: u64, context: &str, error: &AppError) {
        let mut core = self.core.lock();
        if !core.is_live(session_id) {
            debug!("Dropping failure of stale session {}: {}", session_id, error);
            return;
        }
        self.fail_locked(&mut core, context, error);
    }

    fn fail_locked(&self, core: &mut Core, context: &str, error: &AppError) {
        warn!("Session {} failed: {}", core.session.id, error);
        core.session.last_error = Some(error.to_string());
        core.session.local_offer = None;
        core.session.remote_answer = None;
        self.begin_teardown(core);
        self.enter(
            core,
            SessionState::Error,
            format!("{} ({}): {}", context, error.category(), error),
        );
    }

    fn stop_locked(&self, core: &mut Core) {
        core.session.local_offer = None;
        core.session.remote_answer = None;
        self.begin_teardown(core);
        self.enter(core, SessionState::Stopped, STATUS_STOPPED);
    }

    /// Tear the live engine down in the background, after any earlier teardown
    fn begin_teardown(&self, core: &mut Core) {
        let Some(engine) = core.engine.take() else {
            return;
        };
        let previous = core.teardown.take();
        let id = core.session.id;
        core.teardown = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            engine.teardown().await;
            debug!("Session {} engine released", id);
        }));
    }

    fn enter(&self, core: &mut Core, state: SessionState, status: impl Into<String>) {
        let from = core.session.state;
        core.session.state = state;
        let status = status.into();
        info!("Session {}: {} -> {}", core.session.id, from, state);
        self.announce(core, status);
    }

    /// Publish the snapshot and a state change event for the current state
    fn announce(&self, core: &mut Core, status: impl Into<String>) {
        self.publish_snapshot(core);
        self.events.publish(SessionEvent::StateChanged {
            session_id: core.session.id,
            state: core.session.state,
            status: status.into(),
        });
    }

    fn publish_snapshot(&self, core: &mut Core) {
        core.session.updated_at = Utc::now();
        self.state_tx.send_replace(core.session.clone());
    }

    fn notice(&self, session_id: u64, message: impl Into<String>) {
        let message = message.into();
        debug!("Session {} notice: {}", session_id, message);
        self.events.publish(SessionEvent::Notice {
            session_id,
            message,
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        let engine = self.core.get_mut().engine.take();
        if let (Some(engine), Ok(handle)) = (engine, Handle::try_current()) {
            handle.spawn(async move { engine.teardown().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{CapturePreset, ChannelSource, VideoCodec, VideoFrame};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct MockEngine {
        index: usize,
        journal: Journal,
        calls: Mutex<Vec<String>>,
        sink: Mutex<Option<EventSink>>,
        source: Mutex<Option<Box<dyn CaptureSource>>>,
        fail_initialize: bool,
        fail_apply: bool,
        /// Holds `create_connection` until notified
        connection_gate: Option<Arc<Notify>>,
        torn_down: AtomicBool,
    }

    impl MockEngine {
        fn record(&self, call: impl Into<String>) {
            let call = call.into();
            self.journal.lock().push(format!("e{}:{}", self.index, call));
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn sink(&self) -> EventSink {
            self.sink.lock().clone().expect("connection not created")
        }

        fn torn_down(&self) -> bool {
            self.torn_down.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportEngine for MockEngine {
        async fn initialize(&self) -> Result<()> {
            self.record("initialize");
            if self.fail_initialize {
                return Err(AppError::EngineFailure("no encoder available".to_string()));
            }
            Ok(())
        }

        async fn create_connection(
            &self,
            _config: CaptureConfig,
            source: Box<dyn CaptureSource>,
            sink: EventSink,
        ) -> Result<()> {
            self.record("create_connection");
            if let Some(gate) = &self.connection_gate {
                gate.notified().await;
            }
            *self.source.lock() = Some(source);
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        async fn create_offer(&self) -> Result<()> {
            self.record("create_offer");
            Ok(())
        }

        async fn current_local_description(&self) -> Option<String> {
            None
        }

        async fn apply_remote_answer(&self, sdp: String) -> Result<()> {
            self.record(format!("apply_remote_answer:{}", sdp));
            if self.fail_apply {
                return Err(AppError::EngineFailure("answer does not match offer".to_string()));
            }
            Ok(())
        }

        async fn teardown(&self) {
            self.record("teardown");
            self.torn_down.store(true, Ordering::SeqCst);
            let source = self.source.lock().take();
            if let Some(mut source) = source {
                source.release().await;
                self.record("released");
            }
        }
    }

    #[derive(Default)]
    struct MockFactory {
        engines: Mutex<Vec<Arc<MockEngine>>>,
        journal: Journal,
        fail_initialize: bool,
        fail_apply: bool,
        /// Gate for the first engine's `create_connection`
        first_connection_gate: Option<Arc<Notify>>,
    }

    impl MockFactory {
        fn engine(&self, index: usize) -> Arc<MockEngine> {
            self.engines.lock()[index].clone()
        }

        fn journal_position(&self, entry: &str) -> usize {
            self.journal
                .lock()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{} not in journal", entry))
        }
    }

    impl EngineFactory for MockFactory {
        fn create_engine(&self) -> Arc<dyn TransportEngine> {
            let mut engines = self.engines.lock();
            let engine = Arc::new(MockEngine {
                index: engines.len(),
                journal: self.journal.clone(),
                fail_initialize: self.fail_initialize,
                fail_apply: self.fail_apply,
                connection_gate: if engines.is_empty() {
                    self.first_connection_gate.clone()
                } else {
                    None
                },
                ..Default::default()
            });
            engines.push(engine.clone());
            engine
        }
    }

    struct Harness {
        controller: Arc<SessionController>,
        factory: Arc<MockFactory>,
        states: watch::Receiver<Session>,
        status: broadcast::Receiver<SessionEvent>,
    }

    fn harness_with(factory: MockFactory) -> Harness {
        let factory = Arc::new(factory);
        let events = Arc::new(EventBus::new());
        let status = events.subscribe();
        let controller = SessionController::new(factory.clone(), events, 16);
        let states = controller.subscribe();
        Harness {
            controller,
            factory,
            states,
            status,
        }
    }

    fn harness() -> Harness {
        harness_with(MockFactory::default())
    }

    fn source() -> (Box<dyn CaptureSource>, mpsc::Sender<VideoFrame>) {
        let (source, tx) = ChannelSource::new("test", VideoCodec::VP8, 4);
        (Box::new(source), tx)
    }

    async fn wait_for(
        states: &mut watch::Receiver<Session>,
        f: impl FnMut(&Session) -> bool,
    ) -> Session {
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(f))
            .await
            .expect("timed out waiting for session state")
            .expect("controller dropped")
            .clone()
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn drain(status: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = status.try_recv() {
            events.push(event);
        }
        events
    }

    fn state_changes(events: &[SessionEvent]) -> Vec<(u64, SessionState)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged {
                    session_id, state, ..
                } => Some((*session_id, *state)),
                _ => None,
            })
            .collect()
    }

    /// Start a session and drive it to `waiting_answer`
    async fn offer_ready(h: &mut Harness) -> (u64, Arc<MockEngine>) {
        let (source, _tx) = source();
        let id = h
            .controller
            .start(CapturePreset::Hd720.config(), source)
            .unwrap();
        wait_for(&mut h.states, |s| s.id == id && s.state == SessionState::Offering).await;

        let last = h.factory.engines.lock().len() - 1;
        let engine = h.factory.engine(last);
        engine
            .sink()
            .send(EngineEvent::GatheringComplete("v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n".into()))
            .await;
        wait_for(&mut h.states, |s| s.state == SessionState::WaitingAnswer).await;
        (id, engine)
    }

    async fn connected(h: &mut Harness) -> (u64, Arc<MockEngine>) {
        let (id, engine) = offer_ready(h).await;
        h.controller
            .apply_answer(&signaling::encode(SignalKind::Answer, "v=0 answer"))
            .unwrap();
        engine
            .sink()
            .send(EngineEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;
        wait_for(&mut h.states, |s| s.state == SessionState::Connected).await;
        (id, engine)
    }

    #[tokio::test]
    async fn test_offer_published_after_gathering() {
        let mut h = harness();
        let (id, engine) = offer_ready(&mut h).await;
        assert_eq!(id, 1);

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::WaitingAnswer);
        assert_eq!(snapshot.config, Some(CaptureConfig::new(1280, 720, 30).unwrap()));

        let offer = signaling::decode(snapshot.local_offer.as_deref().unwrap()).unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.payload, "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n");

        wait_until(|| engine.count("create_offer") == 1).await;
        assert_eq!(
            engine.calls(),
            vec!["initialize", "create_connection", "create_offer"]
        );

        let changes = state_changes(&drain(&mut h.status));
        assert_eq!(
            changes,
            vec![
                (1, SessionState::Preparing),
                (1, SessionState::Offering),
                (1, SessionState::WaitingAnswer),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_answer_keeps_waiting() {
        let mut h = harness();
        let (_, engine) = offer_ready(&mut h).await;
        drain(&mut h.status);

        for _ in 0..2 {
            let result = h.controller.apply_answer("not-base64!!");
            assert!(matches!(result, Err(AppError::DecodeError(_))));
            assert_eq!(h.controller.current_state(), SessionState::WaitingAnswer);
        }

        assert_eq!(engine.count("apply_remote_answer"), 0);
        assert!(h.controller.snapshot().remote_answer.is_none());

        let events = drain(&mut h.status);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, SessionEvent::Notice { message, .. } if message.contains("decode"))));
    }

    #[tokio::test]
    async fn test_wrong_kind_answer_rejected() {
        let mut h = harness();
        let (_, engine) = offer_ready(&mut h).await;

        let result = h
            .controller
            .apply_answer(&signaling::encode(SignalKind::Offer, "v=0"));
        assert!(matches!(
            result,
            Err(AppError::ValidationError {
                expected: SignalKind::Answer,
                found: SignalKind::Offer
            })
        ));
        assert_eq!(h.controller.current_state(), SessionState::WaitingAnswer);
        assert_eq!(engine.count("apply_remote_answer"), 0);
    }

    #[tokio::test]
    async fn test_answer_applied_once() {
        let mut h = harness();
        let (_, engine) = offer_ready(&mut h).await;

        let answer = signaling::encode(SignalKind::Answer, "v=0 answer");
        h.controller.apply_answer(&answer).unwrap();
        assert_eq!(
            h.controller.snapshot().remote_answer.as_deref(),
            Some("v=0 answer")
        );
        wait_until(|| engine.count("apply_remote_answer") == 1).await;
        assert!(engine
            .calls()
            .contains(&"apply_remote_answer:v=0 answer".to_string()));

        // Duplicate paste before the connection comes up
        h.controller.apply_answer(&answer).unwrap();
        assert_eq!(h.controller.current_state(), SessionState::WaitingAnswer);

        engine
            .sink()
            .send(EngineEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;
        wait_for(&mut h.states, |s| s.state == SessionState::Connected).await;

        // Answers after connecting are ignored
        drain(&mut h.status);
        h.controller.apply_answer(&answer).unwrap();
        assert_eq!(h.controller.current_state(), SessionState::Connected);
        let events = drain(&mut h.status);
        assert!(matches!(&events[..], [SessionEvent::Notice { .. }]));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.count("apply_remote_answer"), 1);
    }

    #[tokio::test]
    async fn test_stop_discards_late_events() {
        let mut h = harness();
        let (id, engine) = connected(&mut h).await;
        let sink = engine.sink();

        h.controller.stop();
        assert_eq!(h.controller.current_state(), SessionState::Stopped);
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.id, id);
        assert!(snapshot.local_offer.is_none());
        assert!(snapshot.remote_answer.is_none());

        wait_until(|| engine.torn_down()).await;
        drain(&mut h.status);

        sink.send(EngineEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;
        sink.send(EngineEvent::Failure("late failure".into())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.controller.current_state(), SessionState::Stopped);
        assert!(drain(&mut h.status).is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness();
        let (_, engine) = offer_ready(&mut h).await;
        drain(&mut h.status);

        h.controller.stop();
        h.controller.stop();
        h.controller.shutdown().await;

        assert!(engine.torn_down());
        assert_eq!(engine.count("teardown"), 1);
        assert_eq!(
            state_changes(&drain(&mut h.status)),
            vec![(1, SessionState::Stopped)]
        );
    }

    #[tokio::test]
    async fn test_restart_replaces_active_session() {
        let mut h = harness();
        let (first, old_engine) = offer_ready(&mut h).await;
        let old_sink = old_engine.sink();

        let (source, _tx) = source();
        let second = h
            .controller
            .start(CapturePreset::Hd1080.config(), source)
            .unwrap();
        assert!(second > first);

        wait_for(&mut h.states, |s| {
            s.id == second && s.state == SessionState::Offering
        })
        .await;
        assert!(old_engine.torn_down());
        assert!(
            h.factory.journal_position("e0:teardown")
                < h.factory.journal_position("e1:initialize")
        );

        // The replaced engine can no longer move the new session
        old_sink
            .send(EngineEvent::GatheringComplete("v=0 stale".into()))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Offering);
        assert!(snapshot.local_offer.is_none());
        assert_eq!(
            snapshot.config,
            Some(CaptureConfig::new(1920, 1080, 30).unwrap())
        );

        let changes = state_changes(&drain(&mut h.status));
        assert!(changes.contains(&(first, SessionState::Stopped)));
        assert!(changes.contains(&(second, SessionState::Preparing)));
    }

    #[tokio::test]
    async fn test_restart_waits_for_superseded_setup() {
        let gate = Arc::new(Notify::new());
        let mut h = harness_with(MockFactory {
            first_connection_gate: Some(gate.clone()),
            ..Default::default()
        });

        let (first_source, first_tx) = source();
        h.controller
            .start(CapturePreset::Hd720.config(), first_source)
            .unwrap();
        let first_engine = h.factory.engine(0);
        wait_until(|| first_engine.count("create_connection") == 1).await;

        // Restart while the first engine is still taking over its source
        let (second_source, _second_tx) = source();
        let second = h
            .controller
            .start(CapturePreset::Hd720.config(), second_source)
            .unwrap();
        let second_engine = h.factory.engine(1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(second_engine.count("initialize"), 0);
        assert!(!first_tx.is_closed());

        gate.notify_one();
        wait_for(&mut h.states, |s| {
            s.id == second && s.state == SessionState::Offering
        })
        .await;

        assert!(first_tx.is_closed());
        assert!(
            h.factory.journal_position("e0:released")
                < h.factory.journal_position("e1:initialize")
        );
        assert_eq!(first_engine.count("create_offer"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_pending_setup() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(MockFactory {
            first_connection_gate: Some(gate.clone()),
            ..Default::default()
        });

        let (source, tx) = source();
        h.controller
            .start(CapturePreset::Hd720.config(), source)
            .unwrap();
        let engine = h.factory.engine(0);
        wait_until(|| engine.count("create_connection") == 1).await;

        let controller = h.controller.clone();
        let shutdown = tokio::spawn(async move { controller.shutdown().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();
        assert!(tx.is_closed());
        assert_eq!(h.controller.current_state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_from_idle_and_error() {
        let mut h = harness();
        h.controller.stop();
        assert_eq!(h.controller.current_state(), SessionState::Stopped);
        h.controller.stop();
        assert_eq!(
            state_changes(&drain(&mut h.status)),
            vec![(0, SessionState::Stopped)]
        );
        assert!(h.factory.engines.lock().is_empty());

        let mut h = harness_with(MockFactory {
            fail_initialize: true,
            ..Default::default()
        });
        let (source, tx) = source();
        let id = h
            .controller
            .start(CapturePreset::Hd720.config(), source)
            .unwrap();
        wait_for(&mut h.states, |s| s.state == SessionState::Error).await;
        let engine = h.factory.engine(0);
        wait_until(|| engine.torn_down()).await;
        drain(&mut h.status);

        h.controller.stop();
        h.controller.stop();
        h.controller.shutdown().await;

        assert_eq!(h.controller.current_state(), SessionState::Stopped);
        assert_eq!(
            state_changes(&drain(&mut h.status)),
            vec![(id, SessionState::Stopped)]
        );
        assert_eq!(engine.count("teardown"), 1);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_initialize_failure_lands_in_error() {
        let mut h = harness_with(MockFactory {
            fail_initialize: true,
            ..Default::default()
        });

        let (source, tx) = source();
        h.controller
            .start(CapturePreset::Hd720.config(), source)
            .unwrap();
        let snapshot = wait_for(&mut h.states, |s| s.state == SessionState::Error).await;
        assert!(snapshot.last_error.unwrap().contains("no encoder"));

        let engine = h.factory.engine(0);
        wait_until(|| engine.torn_down()).await;
        assert_eq!(engine.count("create_connection"), 0);
        // Source was never handed over and has been released
        assert!(tx.is_closed());

        let events = drain(&mut h.status);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { state: SessionState::Error, status, .. }
                if status.contains("engine")
        )));
    }

    #[tokio::test]
    async fn test_failed_connection_lands_in_error() {
        let mut h = harness();
        let (_, engine) = offer_ready(&mut h).await;

        engine
            .sink()
            .send(EngineEvent::ConnectionStateChanged(ConnectionState::Failed))
            .await;
        let snapshot = wait_for(&mut h.states, |s| s.state == SessionState::Error).await;
        assert!(snapshot.local_offer.is_none());
        assert!(snapshot.last_error.is_some());
        wait_until(|| engine.torn_down()).await;

        let answer = signaling::encode(SignalKind::Answer, "v=0");
        assert!(matches!(
            h.controller.apply_answer(&answer),
            Err(AppError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_engine_rejecting_answer_lands_in_error() {
        let mut h = harness_with(MockFactory {
            fail_apply: true,
            ..Default::default()
        });
        offer_ready(&mut h).await;

        h.controller
            .apply_answer(&signaling::encode(SignalKind::Answer, "v=0 bad"))
            .unwrap();
        wait_for(&mut h.states, |s| s.state == SessionState::Error).await;

        let events = drain(&mut h.status);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { status, .. } if status.starts_with("Error applying answer")
        )));
    }

    #[tokio::test]
    async fn test_answer_outside_waiting_state() {
        let mut h = harness();
        let answer = signaling::encode(SignalKind::Answer, "v=0");

        assert!(matches!(
            h.controller.apply_answer(&answer),
            Err(AppError::NotBound)
        ));
        assert_eq!(h.controller.current_state(), SessionState::Idle);

        let (source, _tx) = source();
        h.controller
            .start(CapturePreset::Hd720.config(), source)
            .unwrap();
        wait_for(&mut h.states, |s| s.state == SessionState::Offering).await;
        assert!(matches!(
            h.controller.apply_answer(&answer),
            Err(AppError::InvalidState(_))
        ));

        h.controller.stop();
        assert!(matches!(
            h.controller.apply_answer(&answer),
            Err(AppError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_only_a_notice() {
        let mut h = harness();
        let (_, engine) = connected(&mut h).await;
        drain(&mut h.status);

        engine
            .sink()
            .send(EngineEvent::ConnectionStateChanged(ConnectionState::Disconnected))
            .await;
        let event = tokio::time::timeout(Duration::from_secs(5), h.status.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::Notice { .. }));
        assert_eq!(h.controller.current_state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_at_most_one_engine_alive() {
        let mut h = harness();
        for _ in 0..3 {
            offer_ready(&mut h).await;
        }
        h.controller.shutdown().await;

        let engines = h.factory.engines.lock().clone();
        assert_eq!(engines.len(), 3);
        assert!(engines.iter().all(|e| e.torn_down()));
        assert!(engines.iter().all(|e| e.count("teardown") == 1));
    }
}
