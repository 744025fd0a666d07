//! Replica state structure.
//!
//! [`ReplicaState`] holds all mutable state of one replica. Handlers in
//! the sibling modules mutate it in place; the engine wrapper serializes
//! access behind a mutex and executes the [`super::Output`] they produce.

use std::collections::HashSet;

use syenite_types::{ClientId, OpId, OpNumber, ReplicaId, ViewNumber};

use crate::config::ClusterConfig;
use crate::dedup::DupTracker;
use crate::log::{EMPTY_LOG_HASH, LogEntry, merge_log_hashes, merge_one};
use crate::message::{
    ClientOp, PeerMessage, PersistedCliOp, Prepare, StartView, StartViewChange, StartViewResponse,
};

use super::Output;

/// Silence (in ticks) after which a follower suspects the leader.
pub(crate) const SUSPECT_SILENCE: u64 = 2;

/// Silence (in ticks) after which a leader abandons an unacknowledged op.
pub(crate) const OP_ABANDON_SILENCE: u64 = 3;

/// Replica engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Serving and replicating in the current view.
    Normal,
    /// Electing: reconciling after a view transition.
    Change,
}

/// The state of a VSR replica.
///
/// # State Categories
///
/// 1. **Identity**: `replica_id`, `config`
/// 2. **View state**: `view`, `status`
/// 3. **Log state**: `op`, `commit`, `logs`, `log_hash`, `cliop`
/// 4. **Dedup**: `persisted_ops` and the per-round tally trackers
/// 5. **Health**: `healthcheck_tick`, `latest_healthtick_received`,
///    `prepare_sent`
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub(crate) config: ClusterConfig,
    pub(crate) replica_id: ReplicaId,

    pub(crate) view: ViewNumber,
    pub(crate) status: Status,

    /// Highest prepared op; equals `commit` when idle.
    pub(crate) op: OpNumber,
    /// Highest committed op.
    pub(crate) commit: OpNumber,
    /// Running digest over `logs`; always equals `fold(logs)`.
    pub(crate) log_hash: u64,
    /// Committed entries, dense from op 0 through `commit`.
    pub(crate) logs: Vec<LogEntry>,
    /// The in-flight operation; meaningful only while `op > commit`.
    pub(crate) cliop: ClientOp,
    /// Every `(clientid, cliopid)` ever committed here; suppresses
    /// re-execution after leader changes.
    pub(crate) persisted_ops: HashSet<(ClientId, OpId)>,

    /// Set when a Prepare broadcast just went out; the next tick skips
    /// its heartbeat.
    pub(crate) prepare_sent: bool,
    pub(crate) healthcheck_tick: u64,
    pub(crate) latest_healthtick_received: u64,

    pub(crate) svc_tracker: DupTracker,
    pub(crate) dvc_tracker: DupTracker,
    pub(crate) prep_resp_tracker: DupTracker,
    pub(crate) sv_resp_tracker: DupTracker,
    /// Cached StartViewResponses, indexed by sender.
    pub(crate) sv_resps: Vec<Option<StartViewResponse>>,
}

impl ReplicaState {
    /// Creates a fresh replica.
    ///
    /// A fresh replica starts in `Change` status: it either inherits a
    /// view via `StartView` or self-elects on its first `DoViewChange`
    /// consensus.
    pub fn new(config: ClusterConfig, replica_id: ReplicaId) -> Self {
        debug_assert!(
            config.contains(replica_id),
            "replica must be in cluster config"
        );
        let n = config.cluster_size();
        Self {
            config,
            replica_id,
            view: ViewNumber::ZERO,
            status: Status::Change,
            op: OpNumber::NONE,
            commit: OpNumber::NONE,
            log_hash: EMPTY_LOG_HASH,
            logs: Vec::new(),
            cliop: ClientOp::default(),
            persisted_ops: HashSet::new(),
            prepare_sent: false,
            healthcheck_tick: 1,
            latest_healthtick_received: 1,
            svc_tracker: DupTracker::new(n),
            dvc_tracker: DupTracker::new(n),
            prep_resp_tracker: DupTracker::new(n),
            sv_resp_tracker: DupTracker::new(n),
            sv_resps: vec![None; n],
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn commit_id(&self) -> OpNumber {
        self.commit
    }

    pub fn op_id(&self) -> OpNumber {
        self.op
    }

    pub fn committed_logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn log_hash(&self) -> u64 {
        self.log_hash
    }

    /// The leader of the current view.
    pub fn leader(&self) -> ReplicaId {
        self.config.leader_for_view(self.view)
    }

    /// Returns true if this replica leads the current view.
    pub fn is_leader(&self) -> bool {
        self.leader() == self.replica_id
    }

    /// Clears the log, digest, dedup set, and sequence sentinels; the
    /// view and status survive. Lets a harness reuse an engine as a
    /// blank follower.
    pub fn reset_content(&mut self) {
        self.op = OpNumber::NONE;
        self.commit = OpNumber::NONE;
        self.log_hash = EMPTY_LOG_HASH;
        self.logs.clear();
        self.cliop = ClientOp::default();
        self.persisted_ops.clear();
        self.prepare_sent = false;
    }

    // ========================================================================
    // Health Accounting
    // ========================================================================

    /// Ticks since the last sign of a healthy round.
    pub(crate) fn silence(&self) -> u64 {
        self.healthcheck_tick
            .saturating_sub(self.latest_healthtick_received)
    }

    pub(crate) fn reset_silence(&mut self) {
        self.latest_healthtick_received = self.healthcheck_tick;
    }

    // ========================================================================
    // Tick Path
    // ========================================================================

    /// Advances the local health counter and runs the periodic duties:
    /// leader heartbeat (or election reassertion), follower silence
    /// detection, and abandonment of an op that never gathered quorum.
    pub fn on_tick(&mut self, out: &mut Output) {
        self.healthcheck_tick += 1;
        let diff = self.silence();

        if self.is_leader() {
            if self.prepare_sent {
                // A real Prepare went out since the previous tick; it
                // already served as the heartbeat.
                self.prepare_sent = false;
                return;
            }
            match self.status {
                Status::Normal => {
                    // Heartbeat: commit rides in the op slot and vice
                    // versa, which tells followers nothing new is being
                    // prepared.
                    for i in self.config.others(self.replica_id) {
                        out.peer(
                            i,
                            PeerMessage::Prepare(Prepare {
                                view: self.view,
                                op: self.commit,
                                commit: self.op,
                                loghash: self.log_hash,
                                cliop: self.cliop.clone(),
                            }),
                        );
                    }
                }
                Status::Change => {
                    for i in self.config.others(self.replica_id) {
                        out.peer(
                            i,
                            PeerMessage::StartView(StartView {
                                view: self.view,
                                last_commit: self.commit,
                            }),
                        );
                    }
                }
            }
            if self.op != self.commit && diff > OP_ABANDON_SILENCE {
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    op = %self.op,
                    commit = %self.commit,
                    "abandoning in-flight op without quorum"
                );
                self.op = self.commit;
                self.prep_resp_tracker.clear_all();
            }
            return;
        }

        // A follower: burst StartViewChange while the leader stays
        // silent, with a backoff cadence to limit gossip storms.
        if self.healthcheck_tick > self.latest_healthtick_received
            && diff > SUSPECT_SILENCE
            && (diff < 4 || (diff > 5 && diff % 8 == 0))
        {
            for i in self.config.replicas() {
                out.peer(
                    i,
                    PeerMessage::StartViewChange(StartViewChange {
                        view: self.view.next(),
                    }),
                );
            }
        }
    }

    // ========================================================================
    // Shared Log Mutation
    // ========================================================================

    /// Appends one committed entry, keeping `commit`, the digest, the
    /// dedup set, and the client notification in lockstep.
    pub(crate) fn commit_entry(&mut self, entry: LogEntry, out: &mut Output) {
        self.log_hash = merge_one(&entry, self.log_hash);
        self.commit = entry.op_number;
        self.persisted_ops.insert(entry.client_op.key());
        out.client(
            entry.client_op.clientid,
            PersistedCliOp {
                view: self.view,
                cliopid: entry.client_op.cliopid,
            },
        );
        out.record_commit(entry.client_op.clone());
        self.logs.push(entry);

        debug_assert!(
            self.commit <= self.op,
            "commit={} > op={}",
            self.commit,
            self.op
        );
        debug_assert_eq!(
            self.log_hash,
            merge_log_hashes(&self.logs, EMPTY_LOG_HASH),
            "log digest out of sync with log"
        );
    }

    /// Appends an entry adopted from a peer's log: dedup set, client
    /// notification, and state-machine application, but no `commit` or
    /// digest update; the catch-up paths reseed those in bulk.
    pub(crate) fn adopt_entry(&mut self, entry: LogEntry, out: &mut Output) {
        self.persisted_ops.insert(entry.client_op.key());
        out.client(
            entry.client_op.clientid,
            PersistedCliOp {
                view: self.view,
                cliopid: entry.client_op.cliopid,
            },
        );
        out.record_commit(entry.client_op.clone());
        self.logs.push(entry);
    }

    /// Drops the last log entry and rewinds `commit`/`op`/digest to the
    /// new tail. Used when a Prepare proves the local tail diverged from
    /// the leader's.
    pub(crate) fn pop_back_divergent(&mut self) {
        self.logs.pop();
        self.log_hash = merge_log_hashes(&self.logs, EMPTY_LOG_HASH);
        self.commit = self.logs.last().map_or(OpNumber::NONE, |e| e.op_number);
        self.op = self.commit;
    }

    /// Log entries with op numbers above `last_commit`, in reverse log
    /// order (newest first), as exchanged by the repair and view-change
    /// paths.
    pub(crate) fn entries_above(&self, last_commit: OpNumber) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for entry in self.logs.iter().rev() {
            if entry.op_number > last_commit {
                entries.push(entry.clone());
            } else {
                break;
            }
        }
        entries
    }

    // ========================================================================
    // Duplicate Tally Helper
    // ========================================================================

    /// Runs a tracker check, treating slot exhaustion as the bug it is.
    pub(crate) fn check_dup(
        tracker: &mut DupTracker,
        replica: ReplicaId,
        view: ViewNumber,
        from: ReplicaId,
        key: i64,
    ) -> (bool, usize) {
        match tracker.check(from, key) {
            Ok(res) => res,
            Err(e) => panic!(
                "{replica}:{view}<-{from} (check_duplicate) key:{key}: {e}"
            ),
        }
    }
}
