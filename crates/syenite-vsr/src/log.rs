//! Replicated log entries and the running log digest.
//!
//! Replicas exchange a single `u64` digest of their committed log as a
//! cheap cross-replica equality proof: a follower that sees the leader's
//! digest disagree with its own at the same commit point knows its tail
//! diverged. The digest folds per-entry hashes with an XOR-plus-shift
//! combine, so incremental folds compose:
//! `fold(fold(H, xs), ys) == fold(H, xs ++ ys)`.
//!
//! The combine is order-insensitive at the byte level, which makes it
//! collision-prone by construction; it is kept because the digest is not
//! wire-visible beyond equality, and every replica in a cluster uses the
//! same function. Per-entry hashes are CRC32-based so the digest is
//! stable across processes.

use serde::{Deserialize, Serialize};
use syenite_types::OpNumber;

use crate::message::ClientOp;

/// The digest of an empty log.
pub const EMPTY_LOG_HASH: u64 = 0;

/// Magic digest carried by a sentinel heartbeat `Prepare`.
///
/// Chosen distinct from [`EMPTY_LOG_HASH`] so a fresh replica's genuine
/// first-op pre-state `(commit = -1, op = -1, loghash = 0)` is never
/// mistaken for a heartbeat.
pub const HEARTBEAT_HASH: u64 = 1;

/// One committed `(op_number, client_op)` pair in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op_number: OpNumber,
    pub client_op: ClientOp,
}

impl LogEntry {
    pub fn new(op_number: OpNumber, client_op: ClientOp) -> Self {
        Self {
            op_number,
            client_op,
        }
    }
}

fn crc64(bytes: &[u8]) -> u64 {
    let mut h = crc32fast::Hasher::new();
    h.update(bytes);
    u64::from(h.finalize())
}

/// Hash of a single client operation.
///
/// `dont_notify` is delivery metadata, not operation identity, and is
/// excluded.
fn client_op_hash(cliop: &ClientOp) -> u64 {
    let mut h = crc64(&cliop.clientid.as_u32().to_le_bytes());
    h ^= crc64(cliop.opstr.as_bytes()) << 1;
    h ^ (crc64(&cliop.cliopid.as_u64().to_le_bytes()) << 1)
}

/// Folds log entries into a running digest.
///
/// Passing `EMPTY_LOG_HASH` as `inithash` digests a whole log; passing a
/// previous digest extends it with the new entries.
pub fn merge_log_hashes<'a, I>(entries: I, inithash: u64) -> u64
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut hash = inithash;
    for entry in entries {
        hash ^= crc64(&entry.op_number.as_i32().to_le_bytes()) << 1;
        hash ^= client_op_hash(&entry.client_op) << 1;
    }
    hash
}

/// Digest of one entry folded into `inithash`; convenience for the
/// append paths.
pub fn merge_one(entry: &LogEntry, inithash: u64) -> u64 {
    merge_log_hashes(std::iter::once(entry), inithash)
}
