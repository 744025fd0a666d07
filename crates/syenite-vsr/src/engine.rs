//! The replica engine: state, dispatcher, state machine, and ticker.
//!
//! [`ReplicaEngine`] wraps the pure [`ReplicaState`] kernel for hosts:
//! it serializes all access behind one mutex, hands outbound messages to
//! the dispatcher while that mutex is held (the transport must therefore
//! never re-enter the same engine from a send), applies committed
//! operations to the state machine, and owns the background ticker.
//!
//! Transports must serialize `consume_*` calls per engine or rely on the
//! internal lock; the ticker and inbound handlers race safely either
//! way. Tests that want determinism skip `start` and drive
//! [`ReplicaEngine::health_timeout_ticked`] by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use syenite_types::{ClientId, OpNumber, ReplicaId, ViewNumber};

use crate::config::{ClusterConfig, REPLICA_TICK_INTERVAL};
use crate::dispatch::{Dispatcher, StateMachine};
use crate::error::ConsumeError;
use crate::log::LogEntry;
use crate::message::{
    ClientOp, DoViewChange, GetMissingLogs, MissingLogsResponse, OpPersistedQuery, PersistedCliOp,
    Prepare, PrepareResponse, StartView, StartViewChange, StartViewResponse,
};
use crate::replica::{ClientOpOutcome, Outbound, Output, ReplicaState, Status};

struct Inner {
    state: ReplicaState,
    state_machine: Box<dyn StateMachine>,
}

/// A running VSR replica.
pub struct ReplicaEngine {
    inner: Mutex<Inner>,
    dispatcher: Arc<dyn Dispatcher>,
    tick_interval: Duration,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaEngine {
    /// Creates a replica with the default tick cadence.
    pub fn new(
        totreplicas: u32,
        replica: u32,
        dispatcher: Arc<dyn Dispatcher>,
        state_machine: Box<dyn StateMachine>,
    ) -> Self {
        Self::with_tick_interval(
            totreplicas,
            replica,
            dispatcher,
            state_machine,
            REPLICA_TICK_INTERVAL,
        )
    }

    pub fn with_tick_interval(
        totreplicas: u32,
        replica: u32,
        dispatcher: Arc<dyn Dispatcher>,
        state_machine: Box<dyn StateMachine>,
        tick_interval: Duration,
    ) -> Self {
        let config = ClusterConfig::new(totreplicas);
        Self {
            inner: Mutex::new(Inner {
                state: ReplicaState::new(config, ReplicaId::new(replica)),
                state_machine,
            }),
            dispatcher,
            tick_interval,
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }
    }

    // ========================================================================
    // Ticker Lifecycle
    // ========================================================================

    /// Spawns the background ticker. A second call while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // The ticker holds a weak back-link so dropping the last strong
        // handle ends the loop even without an explicit stop().
        let weak = Arc::downgrade(self);
        let interval = self.tick_interval;
        let handle = std::thread::spawn(move || {
            loop {
                let Some(engine) = weak.upgrade() else { break };
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                engine.health_timeout_ticked();
                drop(engine);
                std::thread::sleep(interval);
            }
        });
        *self.ticker.lock().expect("ticker lock poisoned") = Some(handle);
    }

    /// Signals the ticker to terminate and joins it. Idempotent and safe
    /// during shutdown; in-flight dispatcher calls complete.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.ticker.lock().expect("ticker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// One health tick: leader heartbeat / election reassertion /
    /// follower silence detection. Public so hosts and tests can drive
    /// time themselves.
    pub fn health_timeout_ticked(&self) {
        self.with_state(|state, out| state.on_tick(out));
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    pub fn consume_client_op(&self, msg: &ClientOp) -> ClientOpOutcome {
        self.with_state(|state, out| state.on_client_op(msg, out))
    }

    pub fn consume_start_view_change(
        &self,
        from: ReplicaId,
        msg: &StartViewChange,
    ) -> Result<(), ConsumeError> {
        self.with_state(|state, out| state.on_start_view_change(from, msg, out))
    }

    pub fn consume_do_view_change(
        &self,
        from: ReplicaId,
        msg: &DoViewChange,
    ) -> Result<(), ConsumeError> {
        self.with_state(|state, out| state.on_do_view_change(from, msg, out))
    }

    pub fn consume_start_view(&self, from: ReplicaId, msg: &StartView) -> StartViewResponse {
        self.with_state(|state, _| state.on_start_view(from, msg))
    }

    pub fn consume_prepare(&self, from: ReplicaId, msg: &Prepare) -> PrepareResponse {
        self.with_state(|state, out| state.on_prepare(from, msg, out))
    }

    pub fn consume_get_missing_logs(
        &self,
        from: ReplicaId,
        msg: &GetMissingLogs,
    ) -> MissingLogsResponse {
        self.with_state(|state, _| state.on_get_missing_logs(from, msg))
    }

    pub fn consume_op_persisted_query(
        &self,
        from: ClientId,
        msg: &OpPersistedQuery,
    ) -> Option<PersistedCliOp> {
        self.with_state(|state, _| state.on_op_persisted_query(from, &msg.perscliop))
    }

    // ========================================================================
    // Inbound Replies
    // ========================================================================

    pub fn consume_prepare_reply(
        &self,
        from: ReplicaId,
        reply: &PrepareResponse,
    ) -> Result<(), ConsumeError> {
        self.with_state(|state, out| state.on_prepare_response(from, reply, out))
    }

    pub fn consume_start_view_reply(
        &self,
        from: ReplicaId,
        reply: &StartViewResponse,
    ) -> Result<(), ConsumeError> {
        self.with_state(|state, out| state.on_start_view_response(from, reply, out))
    }

    pub fn consume_missing_logs_reply(
        &self,
        from: ReplicaId,
        reply: &MissingLogsResponse,
    ) -> Result<(), ConsumeError> {
        self.with_state(|state, out| state.on_missing_logs_response(from, reply, out))
    }

    // ========================================================================
    // Read Accessors
    // ========================================================================

    pub fn view(&self) -> ViewNumber {
        self.lock().state.view()
    }

    pub fn status(&self) -> Status {
        self.lock().state.status()
    }

    pub fn commit_id(&self) -> OpNumber {
        self.lock().state.commit_id()
    }

    pub fn op_id(&self) -> OpNumber {
        self.lock().state.op_id()
    }

    pub fn committed_logs(&self) -> Vec<LogEntry> {
        self.lock().state.committed_logs().to_vec()
    }

    pub fn log_hash(&self) -> u64 {
        self.lock().state.log_hash()
    }

    /// Clears log content and dedup state; see
    /// [`ReplicaState::reset_content`].
    pub fn reset_content(&self) {
        self.lock().state.reset_content();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("engine lock poisoned")
    }

    /// Runs a handler under the engine lock, then flushes its output:
    /// dispatcher sends first, state-machine application second, both
    /// still under the lock.
    fn with_state<R>(&self, f: impl FnOnce(&mut ReplicaState, &mut Output) -> R) -> R {
        let mut inner = self.lock();
        let mut out = Output::new();
        let ret = f(&mut inner.state, &mut out);
        for msg in out.outbound {
            match msg {
                Outbound::Peer(to, m) => self.dispatcher.send_to_replica(to, m),
                Outbound::Client(to, m) => self.dispatcher.send_to_client(to, m),
            }
        }
        for op in out.committed {
            inner.state_machine.execute(&op.opstr);
        }
        ret
    }
}

impl Drop for ReplicaEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
