//! # syenite-vsr: Viewstamped Replication consensus for Syenite
//!
//! A crash-tolerant state-machine replication engine: `2f + 1` replicas
//! agree on a totally ordered sequence of client operations while up to
//! `f` of them fail or sit behind a partition. Correctness holds under
//! arbitrary message loss, duplication, and reordering; no Byzantine
//! faults are assumed.
//!
//! The crate is organized around a pure message-processing kernel driven
//! by a periodic tick:
//!
//! - [`ReplicaState`] / [`ReplicaEngine`]: the per-replica protocol
//!   (view management, normal-case commit, log reconciliation across
//!   view changes, missing-log recovery)
//! - [`ClientState`] / [`ClientEngine`]: the client side (submission,
//!   leader discovery, replicated-commit acknowledgement)
//! - [`Dispatcher`] / [`StateMachine`]: the host-provided transport and
//!   op-applier boundaries
//!
//! Transports deliver inbound messages through the engines' `consume_*`
//! entry points and route the typed return values back to the sender;
//! outbound traffic goes through the dispatcher. Both engines run one
//! background ticker ([`ReplicaEngine::start`] / [`ClientEngine::start`])
//! or let the host drive ticks manually for deterministic runs.

pub mod client;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod message;
pub mod replica;

mod engine;

#[cfg(test)]
mod tests;

pub use client::{ClientEngine, ClientState, DeleteError, OpState};
pub use config::{CLIENT_TICK_INTERVAL, ClusterConfig, REPLICA_TICK_INTERVAL};
pub use dedup::DupTracker;
pub use dispatch::{Dispatcher, NullStateMachine, StateMachine};
pub use engine::ReplicaEngine;
pub use error::ConsumeError;
pub use log::{EMPTY_LOG_HASH, HEARTBEAT_HASH, LogEntry, merge_log_hashes};
pub use message::{
    ClientOp, DoViewChange, GetMissingLogs, LeaderRedirect, MissingLogsResponse, OpPersistedQuery,
    PeerMessage, PersistedCliOp, Prepare, PrepareResponse, StartView, StartViewChange,
    StartViewResponse,
};
pub use replica::{ClientOpOutcome, Outbound, Output, ReplicaState, Status};
