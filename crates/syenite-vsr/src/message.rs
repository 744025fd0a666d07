//! VSR protocol messages.
//!
//! This module defines all messages used in the replication protocol:
//!
//! ## Normal Operation
//! - [`ClientOp`] - Client → Leader: Replicate this operation
//! - [`Prepare`] - Leader → Follower: Prepare this operation (doubles as
//!   the heartbeat when the leader has nothing in flight)
//! - [`PrepareResponse`] - Follower → Leader: Prepare acknowledged
//! - [`PersistedCliOp`] - Replica → Client: Operation is committed
//! - [`LeaderRedirect`] - Replica → Client: Talk to the leader instead
//!
//! ## View Change
//! - [`StartViewChange`] - Follower → All: I think the leader is dead
//! - [`DoViewChange`] - Follower → Leader-elect: You have my vote
//! - [`StartView`] - Leader-elect → All: New view is starting
//! - [`StartViewResponse`] - Follower → Leader-elect: My log tail since
//!   your last commit
//!
//! ## Log Repair
//! - [`GetMissingLogs`] - Follower → Leader: I am behind, send entries
//! - [`MissingLogsResponse`] - Leader → Follower: Entries past your commit
//! - [`OpPersistedQuery`] - Client → Replica: Has my operation committed?
//!
//! Field order is binding: any wire codec must serialize fields in
//! declaration order. `op`/`commit` use `-1` for "nothing yet".

use serde::{Deserialize, Serialize};
use syenite_types::{ClientId, OpId, OpNumber, ReplicaId, ViewNumber};

use crate::log::LogEntry;

// ============================================================================
// Client-Originated Operations
// ============================================================================

/// A client operation submitted for replication.
///
/// `(clientid, cliopid)` identifies the operation for dedup purposes;
/// `opstr` is the opaque payload handed to the state machine on commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientOp {
    pub clientid: ClientId,
    pub opstr: String,
    /// Prevents `opstr` from re-executing, together with `clientid`.
    pub cliopid: OpId,
    /// Set on leader-to-follower rebroadcasts of an already-persisted op
    /// so followers do not echo further notifications.
    pub dont_notify: bool,
}

impl ClientOp {
    pub fn new(clientid: ClientId, opstr: impl Into<String>, cliopid: OpId) -> Self {
        Self {
            clientid,
            opstr: opstr.into(),
            cliopid,
            dont_notify: false,
        }
    }

    /// The `(clientid, cliopid)` dedup key.
    pub fn key(&self) -> (ClientId, OpId) {
        (self.clientid, self.cliopid)
    }
}

impl std::fmt::Display for ClientOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.clientid, self.cliopid, self.opstr)
    }
}

/// Tells a client which replica leads the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRedirect {
    pub view: ViewNumber,
    pub leader: ReplicaId,
}

/// Notifies a client that its operation has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedCliOp {
    pub view: ViewNumber,
    pub cliopid: OpId,
}

/// Client-side probe: has this operation been committed at the receiver?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPersistedQuery {
    pub perscliop: PersistedCliOp,
}

// ============================================================================
// Normal Operation
// ============================================================================

/// Leader's replication order for one operation.
///
/// An idle leader repurposes this as its heartbeat, carrying `commit` in
/// the `op` slot and vice versa; a heartbeat with the
/// `(commit = -1, op = -1, loghash = 1)` sentinel is a pure no-op (see
/// [`crate::log::HEARTBEAT_HASH`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub op: OpNumber,
    pub commit: OpNumber,
    pub loghash: u64,
    pub cliop: ClientOp,
}

/// Follower's acknowledgement of a [`Prepare`].
///
/// `op` reflects the follower's op number after processing; a non-empty
/// `err` means the Prepare was rejected and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub err: String,
    pub op: OpNumber,
}

// ============================================================================
// View Change
// ============================================================================

/// A follower's declaration that the current leader looks dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewChange {
    pub view: ViewNumber,
}

/// A follower's vote for the leader-elect of `view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoViewChange {
    pub view: ViewNumber,
}

/// Leader-elect's command to all possible followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartView {
    pub view: ViewNumber,
    pub last_commit: OpNumber,
}

/// Follower's response to the leader-elect.
///
/// `missing_entries` lists the follower's log entries with op numbers
/// above the leader-elect's `last_commit`, in reverse log order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewResponse {
    pub view: ViewNumber,
    pub err: String,
    pub last_commit: OpNumber,
    pub missing_entries: Vec<LogEntry>,
}

// ============================================================================
// Log Repair
// ============================================================================

/// Follower's request for the committed entries it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMissingLogs {
    pub view: ViewNumber,
    pub my_last_commit: OpNumber,
}

/// Leader's answer to [`GetMissingLogs`].
///
/// `comitted_logs` holds the entries above the requester's commit in
/// reverse log order; `op_log` is the leader's in-flight `(op, cliop)`
/// pair; `tothash` is the leader's log digest, which the requester must
/// reproduce before adopting the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingLogsResponse {
    pub view: ViewNumber,
    pub err: String,
    pub op_log: LogEntry,
    pub comitted_logs: Vec<LogEntry>,
    pub tothash: u64,
}

// ============================================================================
// Outbound Tagged Sum
// ============================================================================

/// The payload of a replica-bound message, as handed to the dispatcher.
///
/// Responses ([`PrepareResponse`], [`StartViewResponse`],
/// [`MissingLogsResponse`]) are not listed: they are return values of the
/// consume entry points, routed back by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    ClientOp(ClientOp),
    StartViewChange(StartViewChange),
    DoViewChange(DoViewChange),
    StartView(StartView),
    Prepare(Prepare),
    GetMissingLogs(GetMissingLogs),
    OpPersistedQuery(OpPersistedQuery),
}

impl PeerMessage {
    /// The message's name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::ClientOp(_) => "ClientOp",
            PeerMessage::StartViewChange(_) => "StartViewChange",
            PeerMessage::DoViewChange(_) => "DoViewChange",
            PeerMessage::StartView(_) => "StartView",
            PeerMessage::Prepare(_) => "Prepare",
            PeerMessage::GetMissingLogs(_) => "GetMissingLogs",
            PeerMessage::OpPersistedQuery(_) => "OpPersistedQuery",
        }
    }

    /// The view the message argues about, where it carries one.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            PeerMessage::ClientOp(_) => None,
            PeerMessage::StartViewChange(m) => Some(m.view),
            PeerMessage::DoViewChange(m) => Some(m.view),
            PeerMessage::StartView(m) => Some(m.view),
            PeerMessage::Prepare(m) => Some(m.view),
            PeerMessage::GetMissingLogs(m) => Some(m.view),
            PeerMessage::OpPersistedQuery(m) => Some(m.perscliop.view),
        }
    }
}
