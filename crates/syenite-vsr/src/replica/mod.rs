//! VSR replica state machine.
//!
//! This module implements the core Viewstamped Replication protocol as a
//! deterministic message-processing kernel: handlers take an inbound
//! message, mutate local state, collect outbound messages into an
//! [`Output`], and return the typed reply the transport routes back.
//! No I/O and no clocks live here (time arrives as tick events), which
//! keeps every protocol path drivable from tests.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──ClientOp──► Leader
//!                        │
//!                        ├──Prepare──► Follower₁
//!                        ├──Prepare──► Follower₂
//!                        │               │
//!                        │◄─PrepareResponse
//!                        │◄─PrepareResponse
//!                        │  (quorum: commit, notify client)
//! Client ◄─PersistedCliOp┘
//! ```
//!
//! ## View Change
//!
//! ```text
//! Follower ──StartViewChange──► All   (on leader silence)
//!             │
//!             ▼ (strict majority)
//! Follower ──DoViewChange──► Leader-elect
//!             │
//!             ▼ (strict majority)
//! Leader-elect ──StartView──► All
//!             │◄──StartViewResponse── (log tails; richest wins)
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: the per-replica protocol state
//! - [`Output`]: outbound messages and newly committed ops from one event
//! - [`ClientOpOutcome`]: the tri-state answer to a client submission

mod normal;
mod repair;
mod state;
mod view_change;

pub use state::{ReplicaState, Status};

use syenite_types::{ClientId, ReplicaId};

use crate::message::{ClientOp, LeaderRedirect, PeerMessage, PersistedCliOp};

// ============================================================================
// Handler Output
// ============================================================================

/// An outbound message produced while processing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A protocol message for a replica.
    Peer(ReplicaId, PeerMessage),
    /// A commit acknowledgement for a client.
    Client(ClientId, PersistedCliOp),
}

/// Everything a handler produced besides its direct reply.
///
/// The caller (the engine wrapper) is responsible for handing `outbound`
/// to the dispatcher and applying `committed` to the state machine, in
/// order.
#[derive(Debug, Default)]
pub struct Output {
    /// Messages to send, in emission order.
    pub outbound: Vec<Outbound>,
    /// Operations newly committed by this event, in op order.
    pub committed: Vec<ClientOp>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn peer(&mut self, to: ReplicaId, msg: PeerMessage) {
        self.outbound.push(Outbound::Peer(to, msg));
    }

    pub(crate) fn client(&mut self, to: ClientId, msg: PersistedCliOp) {
        self.outbound.push(Outbound::Client(to, msg));
    }

    pub(crate) fn record_commit(&mut self, op: ClientOp) {
        self.committed.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.committed.is_empty()
    }
}

// ============================================================================
// Client Submission Outcome
// ============================================================================

/// The replica's answer to a client operation submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOpOutcome {
    /// The op was accepted and a Prepare round is in flight.
    Accepted,
    /// This replica does not lead the current view.
    Redirect(LeaderRedirect),
    /// The op had already committed; here is the acknowledgement again.
    Persisted(PersistedCliOp),
    /// Mid-election or mid-prepare; the client must retry.
    Retry,
}
