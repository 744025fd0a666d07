//! # syenite-types: Core types for Syenite
//!
//! This crate contains the shared types used across the Syenite system:
//! - Cluster member identity ([`ReplicaId`])
//! - Client identity ([`ClientId`])
//! - Protocol epochs ([`ViewNumber`])
//! - Log sequence numbers ([`OpNumber`])
//! - Client operation identifiers ([`OpId`])
//! - Quorum arithmetic ([`quorum_size`], [`max_failures`])

use std::fmt::Display;

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 4/8-byte values)
// ============================================================================

/// Unique identifier for a replica within a cluster.
///
/// Replicas are numbered densely from `0` to `totreplicas - 1`; the leader
/// of a view is always `view mod totreplicas`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u32);

impl ReplicaId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the id as a `u32`.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the id as a `usize` for indexing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ReplicaId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u32 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// Unique identifier for a client.
///
/// Client ids live above the replica id range in the shared address space
/// (the transport keeps a `client_min_index` separating the two), so a
/// bare index on the wire is unambiguous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u32);

impl ClientId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ClientId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ClientId> for u32 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

// ============================================================================
// Protocol Sequence Numbers
// ============================================================================

/// A view number: a monotonically increasing epoch designating a leader.
///
/// The leader of view `v` in a cluster of `n` replicas is `v mod n`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u32);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u32) -> Self {
        Self(view)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The next view in sequence.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The replica that leads this view in a cluster of `totreplicas`.
    pub fn leader(self, totreplicas: u32) -> ReplicaId {
        ReplicaId::new(self.0 % totreplicas)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ViewNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ViewNumber> for u32 {
    fn from(view: ViewNumber) -> Self {
        view.0
    }
}

/// An operation number: the position of a client operation in the
/// replicated log.
///
/// `OpNumber::NONE` (`-1` on the wire) means "nothing yet": a fresh
/// replica has prepared and committed nothing. Log positions proper start
/// at `0` and are dense.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpNumber(i32);

impl OpNumber {
    /// The "nothing yet" sentinel, `-1` on the wire.
    pub const NONE: OpNumber = OpNumber(-1);

    pub fn new(op: i32) -> Self {
        Self(op)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns true if this is the `NONE` sentinel.
    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    /// The next operation number; `NONE.next()` is `0`.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for OpNumber {
    fn default() -> Self {
        Self::NONE
    }
}

impl Display for OpNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for OpNumber {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<OpNumber> for i32 {
    fn from(op: OpNumber) -> Self {
        op.0
    }
}

/// A client-side operation identifier.
///
/// Allocated monotonically by each client; together with the client id it
/// prevents an operation string from being executed twice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId(u64);

impl OpId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<OpId> for u64 {
    fn from(id: OpId) -> Self {
        id.0
    }
}

// ============================================================================
// Quorum Arithmetic
// ============================================================================

/// The strict-majority quorum size for a cluster of `n` replicas.
///
/// Any two quorums overlap in at least one replica.
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

/// The number of simultaneous replica failures a cluster of `n` tolerates.
pub fn max_failures(n: usize) -> usize {
    (n - 1) / 2
}
