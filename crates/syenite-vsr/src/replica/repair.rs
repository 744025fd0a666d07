//! Missing-log recovery handlers.
//!
//! A follower that discovers it is behind (via a Prepare whose commit is
//! ahead of its own log) asks the leader for the committed entries it is
//! missing. The leader answers with the entries above the follower's
//! commit plus its current in-flight `(op, cliop)` pair and its log
//! digest; the follower refuses the batch unless folding it in
//! reproduces the digest exactly.

use syenite_types::ReplicaId;

use crate::error::ConsumeError;
use crate::log::{LogEntry, merge_one};
use crate::message::{GetMissingLogs, MissingLogsResponse};

use super::{Output, ReplicaState};

impl ReplicaState {
    // ========================================================================
    // GetMissingLogs Handler (Leader)
    // ========================================================================

    /// Answers a follower's request for committed entries it is missing.
    ///
    /// Only the leader serves repairs; the entries above the requester's
    /// commit are listed newest first.
    pub fn on_get_missing_logs(
        &self,
        from: ReplicaId,
        msgml: &GetMissingLogs,
    ) -> MissingLogsResponse {
        tracing::debug!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            their_commit = %msgml.my_last_commit,
            "missing logs requested"
        );

        let mut ret = MissingLogsResponse {
            view: self.view,
            err: String::new(),
            op_log: LogEntry::new(self.op, self.cliop.clone()),
            comitted_logs: Vec::new(),
            tothash: self.log_hash,
        };
        if !self.is_leader() {
            ret.err = format!("I am not the leader {}:{}", self.replica_id, self.view);
            return ret;
        }

        ret.comitted_logs = self.entries_above(msgml.my_last_commit);
        ret
    }

    // ========================================================================
    // MissingLogsResponse Handler (Follower)
    // ========================================================================

    /// Adopts the leader's repair batch.
    ///
    /// The predicted post-apply digest must equal the leader's `tothash`
    /// or the whole batch is refused. On success the entries are
    /// committed in chronological order, their clients notified, and the
    /// in-flight `(op, cliop)` adopted from the leader.
    pub fn on_missing_logs_response(
        &mut self,
        from: ReplicaId,
        mlresp: &MissingLogsResponse,
        out: &mut Output,
    ) -> Result<(), ConsumeError> {
        if self.is_leader() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                "missing logs response but I am not a follower"
            );
            return Err(ConsumeError::NotFollower);
        }
        if from != self.leader() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                "missing logs response from a non-leader"
            );
            return Err(ConsumeError::NotFromLeader {
                from,
                view: self.view,
            });
        }

        let mut new_hash = self.log_hash;
        for entry in &mlresp.comitted_logs {
            new_hash = merge_one(entry, new_hash);
        }
        if new_hash != mlresp.tothash {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                computed = new_hash,
                claimed = mlresp.tothash,
                "digest mismatch, refusing repair batch"
            );
            return Err(ConsumeError::HashMismatch {
                computed: new_hash,
                claimed: mlresp.tothash,
            });
        }

        for entry in mlresp.comitted_logs.iter().rev() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                op = %entry.op_number,
                cliop = %entry.client_op,
                "adopting repaired entry"
            );
            self.adopt_entry(entry.clone(), out);
        }
        self.log_hash = new_hash;
        if let Some(last) = self.logs.last() {
            self.commit = last.op_number;
        }
        self.op = mlresp.op_log.op_number;
        self.cliop = mlresp.op_log.client_op.clone();

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            commit = %self.commit,
            op = %self.op,
            "repair applied"
        );
        debug_assert!(self.commit <= self.op, "commit={} > op={}", self.commit, self.op);

        Ok(())
    }
}
