//! Normal operation protocol handlers.
//!
//! This module implements the handlers for normal-case replication:
//! - `ClientOp` (client → leader)
//! - `Prepare` (leader → followers; doubles as the heartbeat)
//! - `PrepareResponse` (follower → leader)

use syenite_types::ReplicaId;

use crate::error::ConsumeError;
use crate::log::{HEARTBEAT_HASH, LogEntry};
use crate::message::{
    ClientOp, GetMissingLogs, LeaderRedirect, PeerMessage, PersistedCliOp, Prepare,
    PrepareResponse,
};

use super::{ClientOpOutcome, Output, ReplicaState, Status};

impl ReplicaState {
    // ========================================================================
    // ClientOp Handler (Leader)
    // ========================================================================

    /// Handles a client operation submission.
    ///
    /// Already-committed ops are acknowledged immediately (and gossiped
    /// to followers once, so they can short-circuit too). Otherwise only
    /// an idle leader in normal status accepts: it assigns the next op
    /// number and broadcasts a Prepare.
    pub fn on_client_op(&mut self, msg: &ClientOp, out: &mut Output) -> ClientOpOutcome {
        tracing::debug!(
            replica = %self.replica_id,
            view = %self.view,
            cliop = %msg,
            commit = %self.commit,
            op = %self.op,
            "client op received"
        );

        if self.persisted_ops.contains(&msg.key()) {
            let ack = PersistedCliOp {
                view: self.view,
                cliopid: msg.cliopid,
            };
            if !msg.dont_notify {
                let mut gossip = msg.clone();
                gossip.dont_notify = true;
                for i in self.config.others(self.replica_id) {
                    out.peer(i, PeerMessage::ClientOp(gossip.clone()));
                }
            }
            return ClientOpOutcome::Persisted(ack);
        }

        if !self.is_leader() {
            return ClientOpOutcome::Redirect(LeaderRedirect {
                view: self.view,
                leader: self.leader(),
            });
        }

        if self.op != self.commit || self.status != Status::Normal {
            return ClientOpOutcome::Retry;
        }

        self.op = self.op.next();
        self.cliop = msg.clone();
        self.reset_silence();
        self.prepare_sent = true;
        for i in self.config.others(self.replica_id) {
            out.peer(
                i,
                PeerMessage::Prepare(Prepare {
                    view: self.view,
                    op: self.op,
                    commit: self.commit,
                    loghash: self.log_hash,
                    cliop: msg.clone(),
                }),
            );
        }
        ClientOpOutcome::Accepted
    }

    // ========================================================================
    // Prepare Handler (Follower)
    // ========================================================================

    /// Handles a Prepare from the leader.
    ///
    /// The follower adopts newer views, detects tail divergence by
    /// `(commit, loghash)` mismatch and pops back, commits the in-flight
    /// op once the leader's commit reaches it, latches the next in-flight
    /// op, and requests missing entries when it has fallen behind.
    pub fn on_prepare(&mut self, from: ReplicaId, msgpr: &Prepare, out: &mut Output) -> PrepareResponse {
        if self.is_leader() && self.view == msgpr.view {
            // Two replicas believing they lead the same view is a bug
            // signal on the sender's side.
            return PrepareResponse {
                err: "I am not a follower!".to_string(),
                op: msgpr.op,
            };
        }

        tracing::debug!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            msg_view = %msgpr.view,
            msg_commit = %msgpr.commit,
            msg_op = %msgpr.op,
            "prepare received"
        );

        let mut err = String::new();
        if self.view < msgpr.view {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                msg_view = %msgpr.view,
                "outdated view, adopting leader's"
            );
            self.view = msgpr.view;
            self.status = Status::Normal;
            self.op = self.commit;
        } else if self.view > msgpr.view {
            return PrepareResponse {
                err: format!("skipping old PREP v:{} opstr:{}", msgpr.view, msgpr.cliop.opstr),
                op: msgpr.op,
            };
        }

        self.reset_silence();

        // Heartbeat sentinel: nothing new, just a liveness signal.
        if msgpr.commit.is_none() && msgpr.op.is_none() && msgpr.loghash == HEARTBEAT_HASH {
            return PrepareResponse { err, op: msgpr.op };
        }

        // Divergence: our tail committed under a leader that has since
        // been overruled. Drop it and fall back to the common prefix.
        if self.commit > msgpr.commit
            || (self.commit == msgpr.commit && msgpr.loghash != self.log_hash)
        {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                log_len = self.logs.len(),
                commit = %self.commit,
                op = %self.op,
                msg_commit = %msgpr.commit,
                msg_op = %msgpr.op,
                "divergent tail, popping back"
            );
            self.pop_back_divergent();
        }

        if msgpr.commit == self.op {
            if self.op > self.commit && !self.persisted_ops.contains(&self.cliop.key()) {
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    from = %from,
                    op = %self.op,
                    cliop = %self.cliop,
                    "committing in-flight op"
                );
                let entry = LogEntry::new(self.op, self.cliop.clone());
                self.commit_entry(entry, out);
            }

            if msgpr.op > self.commit {
                // Accept the new in-flight op.
                self.cliop = msgpr.cliop.clone();
                self.op = msgpr.op;
            }
        } else if self.commit < msgpr.commit || msgpr.commit != msgpr.op {
            err = format!(
                "My logs are not up-to-date {} >< {}/{}",
                msgpr.commit, self.op, self.commit
            );
            out.peer(
                self.leader(),
                PeerMessage::GetMissingLogs(GetMissingLogs {
                    view: self.view,
                    my_last_commit: self.commit,
                }),
            );
        }

        PrepareResponse { err, op: self.op }
    }

    // ========================================================================
    // PrepareResponse Handler (Leader)
    // ========================================================================

    /// Handles a follower's acknowledgement of the in-flight Prepare.
    ///
    /// On reaching acknowledgements from `⌊n/2⌋` distinct followers
    /// (a strict majority including self), the op commits: it is
    /// appended, folded into the digest, recorded for dedup, and the
    /// originating client is notified.
    pub fn on_prepare_response(
        &mut self,
        from: ReplicaId,
        presp: &PrepareResponse,
        out: &mut Output,
    ) -> Result<(), ConsumeError> {
        if !presp.err.is_empty() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                err = %presp.err,
                "prepare rejected by follower"
            );
            return Err(ConsumeError::PeerError(presp.err.clone()));
        }
        if !self.is_leader() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                msg_op = %presp.op,
                "prepare response but I am not the leader"
            );
            return Err(ConsumeError::NotLeader {
                replica: self.replica_id,
                view: self.view,
            });
        }
        if self.op != presp.op {
            if !presp.op.is_none() {
                tracing::debug!(
                    replica = %self.replica_id,
                    view = %self.view,
                    from = %from,
                    msg_op = %presp.op,
                    op = %self.op,
                    "prepare response for a different op"
                );
                return Err(ConsumeError::OpMismatch {
                    got: presp.op,
                    expected: self.op,
                });
            }
            // A heartbeat echo; nothing to tally.
            return Ok(());
        }

        let (isdup, idx) = Self::check_dup(
            &mut self.prep_resp_tracker,
            self.replica_id,
            self.view,
            from,
            i64::from(presp.op.as_i32()),
        );
        if isdup {
            return Ok(());
        }

        let cnt = self.prep_resp_tracker.count(idx);
        if cnt < self.config.peer_majority() {
            return Ok(());
        }

        self.prep_resp_tracker.clear(idx);
        self.reset_silence();

        if self.op == self.commit {
            // Already committed; late acknowledgements are harmless.
            return Ok(());
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            tally = cnt,
            op = %self.op,
            cliop = %self.cliop,
            "committing op on quorum"
        );
        let entry = LogEntry::new(self.op, self.cliop.clone());
        self.commit_entry(entry, out);

        debug_assert_eq!(self.commit, self.op);
        debug_assert_eq!(self.logs.len() as i32, self.commit.as_i32() + 1);

        Ok(())
    }

    // ========================================================================
    // Persisted-Op Query (Any Replica)
    // ========================================================================

    /// Answers a client probe about whether its op has committed here.
    pub fn on_op_persisted_query(
        &self,
        from: syenite_types::ClientId,
        perscliop: &PersistedCliOp,
    ) -> Option<PersistedCliOp> {
        if perscliop.view == self.view && self.persisted_ops.contains(&(from, perscliop.cliopid)) {
            return Some(PersistedCliOp {
                view: self.view,
                cliopid: perscliop.cliopid,
            });
        }
        None
    }
}
