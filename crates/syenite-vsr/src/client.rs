//! The client engine.
//!
//! A client tracks its own operations from submission through replicated
//! commit. It discovers the leader lazily: operations go to
//! `last_view mod totreplicas`, redirects update `last_view`, and a
//! round-robin retransmission timer walks the cluster when nobody
//! answers. An operation counts as consumed once a strict majority of
//! replicas have acknowledged it, so a single stale replica can never
//! fake a commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use syenite_types::{ClientId, OpId, ReplicaId, ViewNumber};
use thiserror::Error;

use crate::config::CLIENT_TICK_INTERVAL;
use crate::dispatch::Dispatcher;
use crate::message::{ClientOp, LeaderRedirect, PeerMessage, PersistedCliOp};

/// Default ticks before an unacknowledged op is retried elsewhere.
pub const DEFAULT_TIMEOUT_TICKS: u32 = 5;

/// First cliopid handed out by a fresh client.
const INITIAL_OP_ID: u64 = 7;

// ============================================================================
// Operation State
// ============================================================================

/// Externally visible lifecycle of a client operation.
///
/// The numeric values are a stable contract with embedders; do not
/// renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    /// Known id, not yet submitted (or unknown id).
    DoesntExist = 1,
    /// This `start_op` call performed the initial send.
    JustStarted = 7,
    /// Submitted, waiting for acknowledgements.
    Ongoing = 8,
    /// Acknowledged by a strict majority.
    Consumed = 9,
}

/// Why `delete_op` refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeleteError {
    #[error("unknown operation id")]
    UnknownId,
    #[error("operation still in flight")]
    NotConsumable,
}

impl DeleteError {
    /// Advisory integer code (`0` is reserved for success).
    pub fn code(self) -> i32 {
        match self {
            DeleteError::UnknownId => -1,
            DeleteError::NotConsumable => -2,
        }
    }
}

// ============================================================================
// Client State
// ============================================================================

#[derive(Debug, Clone)]
struct OpRecord {
    opstr: String,
    state: OpState,
    tick_count: u32,
    last_replica_tried: ReplicaId,
    received_from: HashSet<ReplicaId>,
}

/// Pure client-side protocol state; the engine wrapper adds the lock,
/// dispatcher, and ticker.
#[derive(Debug)]
pub struct ClientState {
    client_id: ClientId,
    totreplicas: u32,
    /// `⌊n/2⌋`; consumed requires strictly more acknowledgements.
    consensus_min: usize,
    timeout_tick: u32,
    last_view: ViewNumber,
    last_op_id: OpId,
    opmap: BTreeMap<OpId, OpRecord>,
}

/// An outbound `ClientOp` produced by a client state transition.
type OutboundOp = (ReplicaId, ClientOp);

impl ClientState {
    pub fn new(client_id: ClientId, totreplicas: u32, timeout_tick: u32) -> Self {
        Self {
            client_id,
            totreplicas,
            consensus_min: totreplicas as usize / 2,
            timeout_tick,
            last_view: ViewNumber::ZERO,
            last_op_id: OpId::new(INITIAL_OP_ID),
            opmap: BTreeMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn last_view(&self) -> ViewNumber {
        self.last_view
    }

    fn leader(&self) -> ReplicaId {
        self.last_view.leader(self.totreplicas)
    }

    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Registers an operation string and returns its fresh cliopid.
    /// Purely local; nothing is sent until [`ClientState::start_op`].
    pub fn init_op(&mut self, opstr: impl Into<String>) -> OpId {
        let id = self.last_op_id;
        self.last_op_id = id.next();
        let leader = self.leader();
        self.opmap.insert(
            id,
            OpRecord {
                opstr: opstr.into(),
                state: OpState::DoesntExist,
                tick_count: 0,
                last_replica_tried: leader,
                received_from: HashSet::new(),
            },
        );
        id
    }

    /// Submits an operation (first call) or polls its state.
    pub fn start_op(&mut self, id: OpId, sends: &mut Vec<OutboundOp>) -> OpState {
        let leader = self.leader();
        let Some(record) = self.opmap.get_mut(&id) else {
            return OpState::DoesntExist;
        };
        match record.state {
            OpState::DoesntExist => {
                record.state = OpState::Ongoing;
                record.tick_count = 0;
                record.last_replica_tried = leader;
                let msg = ClientOp::new(self.client_id, record.opstr.clone(), id);
                sends.push((leader, msg));
                OpState::JustStarted
            }
            state => state,
        }
    }

    /// Forgets a finished operation.
    ///
    /// In-flight operations refuse deletion so an acknowledgement can
    /// never arrive for an id the client no longer knows.
    pub fn delete_op(&mut self, id: OpId) -> Result<(), DeleteError> {
        let Some(record) = self.opmap.get(&id) else {
            return Err(DeleteError::UnknownId);
        };
        match record.state {
            OpState::Ongoing | OpState::JustStarted => Err(DeleteError::NotConsumable),
            OpState::Consumed | OpState::DoesntExist => {
                self.opmap.remove(&id);
                Ok(())
            }
        }
    }

    /// One retransmission tick: ops that have waited `timeout_tick`
    /// ticks are re-sent to the next replica, round-robin from the
    /// current leader.
    pub fn time_tick(&mut self, sends: &mut Vec<OutboundOp>) {
        let client_id = self.client_id;
        let totreplicas = self.totreplicas;
        for (&id, record) in &mut self.opmap {
            if record.state != OpState::Ongoing {
                continue;
            }
            record.tick_count += 1;
            if record.tick_count >= self.timeout_tick {
                record.tick_count = 0;
                record.last_replica_tried =
                    ReplicaId::new((record.last_replica_tried.as_u32() + 1) % totreplicas);
                let msg = ClientOp::new(client_id, record.opstr.clone(), id);
                sends.push((record.last_replica_tried, msg));
            }
        }
    }

    // ========================================================================
    // Inbound Handlers
    // ========================================================================

    /// Handles a replica's commit acknowledgement.
    ///
    /// Acknowledgements accumulate per op; strictly more than
    /// `⌊n/2⌋` distinct replicas marks the op consumed.
    pub fn consume_persisted(&mut self, from: ReplicaId, msg: &PersistedCliOp) {
        self.set_view(msg.view);
        let consensus_min = self.consensus_min;
        let Some(record) = self.opmap.get_mut(&msg.cliopid) else {
            return;
        };
        record.received_from.insert(from);
        if record.received_from.len() > consensus_min {
            if record.state != OpState::Consumed {
                tracing::debug!(
                    client = %self.client_id,
                    cliopid = %msg.cliopid,
                    acks = record.received_from.len(),
                    "op consumed"
                );
            }
            record.state = OpState::Consumed;
        }
    }

    /// Handles a leader redirect: adopt the newer view and re-drive
    /// every in-flight op at the named leader.
    pub fn consume_leader_redirect(
        &mut self,
        from: ReplicaId,
        msg: &LeaderRedirect,
        sends: &mut Vec<OutboundOp>,
    ) {
        tracing::debug!(
            client = %self.client_id,
            from = %from,
            view = %msg.view,
            leader = %msg.leader,
            "leader redirect"
        );
        self.set_view(msg.view);
        let client_id = self.client_id;
        for (&id, record) in &mut self.opmap {
            if matches!(record.state, OpState::DoesntExist | OpState::Consumed) {
                continue;
            }
            record.tick_count = 0;
            record.last_replica_tried = msg.leader;
            let m = ClientOp::new(client_id, record.opstr.clone(), id);
            sends.push((msg.leader, m));
        }
    }

    /// Adopts `view` if it is not older than what we have seen. A newer
    /// view invalidates every acknowledgement collected so far.
    fn set_view(&mut self, view: ViewNumber) {
        if view < self.last_view {
            return;
        }
        if view > self.last_view {
            for record in self.opmap.values_mut() {
                record.received_from.clear();
            }
            self.last_view = view;
        }
    }
}

// ============================================================================
// Client Engine (Threaded Wrapper)
// ============================================================================

/// A running client: [`ClientState`] behind a mutex, plus the dispatcher
/// and the retransmission ticker.
pub struct ClientEngine {
    state: Mutex<ClientState>,
    dispatcher: Arc<dyn Dispatcher>,
    tick_interval: Duration,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientEngine {
    /// Creates a client with the default retransmission budget and tick
    /// cadence.
    pub fn new(client_id: u32, dispatcher: Arc<dyn Dispatcher>, totreplicas: u32) -> Self {
        Self::with_timing(
            client_id,
            dispatcher,
            totreplicas,
            DEFAULT_TIMEOUT_TICKS,
            CLIENT_TICK_INTERVAL,
        )
    }

    pub fn with_timing(
        client_id: u32,
        dispatcher: Arc<dyn Dispatcher>,
        totreplicas: u32,
        timeout_tick: u32,
        tick_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(ClientState::new(
                ClientId::new(client_id),
                totreplicas,
                timeout_tick,
            )),
            dispatcher,
            tick_interval,
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }
    }

    /// Spawns the retransmission ticker. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.tick_interval;
        let handle = std::thread::spawn(move || {
            loop {
                let Some(engine) = weak.upgrade() else { break };
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                engine.time_tick();
                drop(engine);
                std::thread::sleep(interval);
            }
        });
        *self.ticker.lock().expect("ticker lock poisoned") = Some(handle);
    }

    /// Stops and joins the ticker. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.ticker.lock().expect("ticker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.lock().client_id()
    }

    pub fn last_view(&self) -> ViewNumber {
        self.lock().last_view()
    }

    pub fn init_op(&self, opstr: impl Into<String>) -> OpId {
        self.lock().init_op(opstr)
    }

    pub fn start_op(&self, id: OpId) -> OpState {
        self.with_sends(|state, sends| state.start_op(id, sends))
    }

    pub fn delete_op(&self, id: OpId) -> Result<(), DeleteError> {
        self.lock().delete_op(id)
    }

    /// One retransmission tick; public so tests and hosts can drive time
    /// themselves.
    pub fn time_tick(&self) {
        self.with_sends(|state, sends| state.time_tick(sends));
    }

    pub fn consume_persisted(&self, from: ReplicaId, msg: &PersistedCliOp) {
        self.lock().consume_persisted(from, msg);
    }

    pub fn consume_leader_redirect(&self, from: ReplicaId, msg: &LeaderRedirect) {
        self.with_sends(|state, sends| state.consume_leader_redirect(from, msg, sends));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().expect("client lock poisoned")
    }

    fn with_sends<R>(&self, f: impl FnOnce(&mut ClientState, &mut Vec<OutboundOp>) -> R) -> R {
        let mut state = self.lock();
        let mut sends = Vec::new();
        let ret = f(&mut state, &mut sends);
        for (to, msg) in sends {
            self.dispatcher
                .send_to_replica(to, PeerMessage::ClientOp(msg));
        }
        ret
    }
}

impl Drop for ClientEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
