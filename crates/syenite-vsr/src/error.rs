//! Local rejection reasons for the consume entry points.
//!
//! These are advisory: the protocol's liveness never depends on a sender
//! acting on them. Response messages carry their own `err` string fields
//! on the wire; this type covers the locally-returned codes.

use syenite_types::{OpNumber, ReplicaId, ViewNumber};
use thiserror::Error;

/// Why a consume entry point rejected its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    /// The receiver leads the current view and the message assumes
    /// otherwise.
    #[error("I am not a follower!")]
    NotFollower,

    /// The receiver does not lead the view the message assumes.
    #[error("I am not the leader {replica}:{view}")]
    NotLeader { replica: ReplicaId, view: ViewNumber },

    /// The peer reported an error of its own; nothing to tally.
    #[error("peer error: {0}")]
    PeerError(String),

    /// The response argues about an op this replica is no longer
    /// preparing.
    #[error("op {got} does not match in-flight op {expected}")]
    OpMismatch { got: OpNumber, expected: OpNumber },

    /// The response came from a replica that is not the current leader.
    #[error("source {from} is not the leader of view {view}")]
    NotFromLeader { from: ReplicaId, view: ViewNumber },

    /// Adopting the offered entries would not reproduce the sender's
    /// digest; the entries are refused.
    #[error("log digest mismatch: ours would be {computed}, sender claims {claimed}")]
    HashMismatch { computed: u64, claimed: u64 },

    /// The engine is mid-election or mid-prepare; the caller should
    /// retry.
    #[error("not ready, retry")]
    Retry,
}

impl ConsumeError {
    /// The advisory integer code of this rejection: `0` is reserved for
    /// success, negative values are local reject reasons.
    pub fn code(&self) -> i32 {
        match self {
            ConsumeError::NotLeader { .. } | ConsumeError::NotFollower => -1,
            ConsumeError::PeerError(_) | ConsumeError::NotFromLeader { .. } => -2,
            ConsumeError::OpMismatch { .. } | ConsumeError::HashMismatch { .. } => -3,
            ConsumeError::Retry => -4,
        }
    }
}
