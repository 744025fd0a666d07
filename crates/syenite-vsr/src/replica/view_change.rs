//! View change protocol handlers.
//!
//! 1. **`StartViewChange`**: a follower that stopped hearing the leader
//!    broadcasts its suspicion; a strict majority of suspicions moves the
//!    cluster to the new view.
//! 2. **`DoViewChange`**: votes converge on the leader-elect
//!    (`view mod n`).
//! 3. **`StartView`** / **`StartViewResponse`**: the leader-elect asserts
//!    the view, collects log tails from a quorum of followers, and adopts
//!    the richest one (single-source catch-up).
//!
//! # Safety Properties
//!
//! - Operations committed at a strict majority survive into later views
//! - At most one leader per view (derived, not negotiated)
//! - Progress resumes whenever a majority can exchange messages

use syenite_types::{OpNumber, ReplicaId};

use crate::error::ConsumeError;
use crate::log::merge_log_hashes;
use crate::message::{
    DoViewChange, PeerMessage, StartView, StartViewChange, StartViewResponse,
};

use super::{Output, ReplicaState, Status};

impl ReplicaState {
    // ========================================================================
    // StartViewChange Handler
    // ========================================================================

    /// Handles a peer's suspicion that the leader is dead.
    ///
    /// On a strict-majority tally for a view above ours, move to it and
    /// vote `DoViewChange` at the leader-elect. Below quorum, a
    /// suspicion for exactly `view + 1` while our own silence is still
    /// small is echoed to accelerate convergence.
    pub fn on_start_view_change(
        &mut self,
        from: ReplicaId,
        msgsvc: &StartViewChange,
        out: &mut Output,
    ) -> Result<(), ConsumeError> {
        let (isdup, idx) = Self::check_dup(
            &mut self.svc_tracker,
            self.replica_id,
            self.view,
            from,
            i64::from(msgsvc.view.as_u32()),
        );
        if isdup {
            return Ok(());
        }

        let cnt = self.svc_tracker.count(idx);
        if cnt > self.config.peer_majority() {
            if self.view < msgsvc.view {
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    from = %from,
                    tally = cnt,
                    new_view = %msgsvc.view,
                    "view change consensus"
                );
                self.status = Status::Change;
                self.view = msgsvc.view;
                self.op = self.commit;
            }
            if self.view == msgsvc.view {
                self.reset_silence();
                out.peer(
                    self.config.leader_for_view(msgsvc.view),
                    PeerMessage::DoViewChange(DoViewChange { view: msgsvc.view }),
                );
            }
        } else if msgsvc.view == self.view.next()
            && self.healthcheck_tick > self.latest_healthtick_received
            && self.silence() < 3
        {
            // Someone else noticed leader inactivity first; join the
            // burst (including to ourselves, so our own tally counts us).
            for i in self.config.replicas() {
                out.peer(
                    i,
                    PeerMessage::StartViewChange(StartViewChange {
                        view: self.view.next(),
                    }),
                );
            }
        }

        Ok(())
    }

    // ========================================================================
    // DoViewChange Handler (Leader-Elect)
    // ========================================================================

    /// Handles a vote for this replica as the leader of `dvc.view`.
    ///
    /// A strict majority of votes makes the election: adopt the view,
    /// abort uncommitted work, and broadcast `StartView` to everyone.
    pub fn on_do_view_change(
        &mut self,
        from: ReplicaId,
        dvc: &DoViewChange,
        out: &mut Output,
    ) -> Result<(), ConsumeError> {
        let (isdup, idx) = Self::check_dup(
            &mut self.dvc_tracker,
            self.replica_id,
            self.view,
            from,
            i64::from(dvc.view.as_u32()),
        );
        if isdup {
            return Ok(());
        }

        let cnt = self.dvc_tracker.count(idx);
        if cnt <= self.config.peer_majority() {
            return Ok(());
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            tally = cnt,
            new_view = %dvc.view,
            "elected by DoViewChange consensus"
        );
        if self.status == Status::Normal && self.view == dvc.view {
            // Election already concluded for this view.
            return Ok(());
        }

        self.view = dvc.view;
        self.op = self.commit;
        self.status = Status::Change;
        self.reset_silence();

        for i in self.config.others(self.replica_id) {
            out.peer(
                i,
                PeerMessage::StartView(StartView {
                    view: dvc.view,
                    last_commit: self.commit,
                }),
            );
        }

        Ok(())
    }

    // ========================================================================
    // StartView Handler (Follower)
    // ========================================================================

    /// Handles the leader-elect's view assertion.
    ///
    /// Adopting a newer view aborts uncommitted work. The response
    /// carries our log entries above the leader-elect's commit so it can
    /// recover operations that outlived the previous leader.
    pub fn on_start_view(&mut self, from: ReplicaId, sv: &StartView) -> StartViewResponse {
        if self.view < sv.view {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                new_view = %sv.view,
                "my view is smaller than received, adopting"
            );
            self.op = self.commit;
        }

        if self.view <= sv.view {
            self.reset_silence();
            self.view = sv.view;
            self.status = Status::Normal;
        } else {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                msg_view = %sv.view,
                "my view is bigger than received, skipping"
            );
            return StartViewResponse {
                view: self.view,
                err: format!("My view is bigger than received v:{}", sv.view),
                last_commit: OpNumber::NONE,
                missing_entries: Vec::new(),
            };
        }

        StartViewResponse {
            view: self.view,
            err: String::new(),
            last_commit: self.commit,
            missing_entries: self.entries_above(sv.last_commit),
        }
    }

    // ========================================================================
    // StartViewResponse Handler (Leader-Elect)
    // ========================================================================

    /// Collects followers' log tails after `StartView`.
    ///
    /// On a quorum of responses, the responder with the highest
    /// `last_commit` seeds the new leader's log: its missing entries are
    /// appended (they are listed newest first), committed, and their
    /// clients notified. Then normal operation begins.
    pub fn on_start_view_response(
        &mut self,
        from: ReplicaId,
        svresp: &StartViewResponse,
        out: &mut Output,
    ) -> Result<(), ConsumeError> {
        if !self.is_leader() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                last_commit = %svresp.last_commit,
                "start view response but I am not the leader"
            );
            return Err(ConsumeError::NotLeader {
                replica: self.replica_id,
                view: self.view,
            });
        }
        if !svresp.err.is_empty() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                from = %from,
                err = %svresp.err,
                "start view rejected by follower"
            );
            return Err(ConsumeError::PeerError(svresp.err.clone()));
        }

        let (isdup, idx) = Self::check_dup(
            &mut self.sv_resp_tracker,
            self.replica_id,
            self.view,
            from,
            i64::from(svresp.view.as_u32()),
        );
        if isdup {
            return Ok(());
        }
        if self.status == Status::Normal {
            return Ok(());
        }

        self.sv_resps[from.as_usize()] = Some(svresp.clone());

        let cnt = self.sv_resp_tracker.count(idx);
        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            from = %from,
            tally = cnt,
            commit = %self.commit,
            op = %self.op,
            last_commit = %svresp.last_commit,
            missing = svresp.missing_entries.len(),
            "start view response"
        );
        if cnt < self.config.peer_majority() {
            return Ok(());
        }

        // The responder with the richest committed prefix wins; no
        // reconciliation across diverging minorities is attempted.
        let mut max_commit = OpNumber::NONE;
        let mut max_idx: Option<usize> = None;
        for i in 0..self.config.cluster_size() {
            if self.sv_resp_tracker.is_marked(idx, ReplicaId::new(i as u32)) {
                if let Some(resp) = &self.sv_resps[i] {
                    if max_idx.is_none() || max_commit < resp.last_commit {
                        max_commit = resp.last_commit;
                        max_idx = Some(i);
                    }
                }
            }
        }

        self.sv_resp_tracker.clear(idx);

        if let Some(mi) = max_idx {
            let resp = self.sv_resps[mi]
                .clone()
                .expect("a marked responder always has a cached response");
            if let Some(first) = resp.missing_entries.first() {
                // Re-sync to the richest follower's tail before
                // appending it below.
                self.op = first.op_number;
                self.commit = first.op_number;
            }
            let cursz = self.logs.len();
            for entry in resp.missing_entries.iter().rev() {
                tracing::info!(
                    replica = %self.replica_id,
                    view = %self.view,
                    from = %from,
                    op = %entry.op_number,
                    cliop = %entry.client_op,
                    "adopting entry from richest follower"
                );
                self.adopt_entry(entry.clone(), out);
            }
            self.log_hash = merge_log_hashes(&self.logs[cursz..], self.log_hash);
        }
        self.status = Status::Normal;

        Ok(())
    }
}
