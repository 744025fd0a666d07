//! Integration tests for syenite-vsr.
//!
//! These exercise whole clusters (replica engines plus client engines)
//! over a deterministic in-memory network. The network queues every
//! send, delivers under a configurable partition predicate, and routes
//! the typed replies of the consume entry points back to their senders,
//! so dispatcher calls never re-enter a busy engine. Ticks are driven
//! manually; nothing here depends on wall-clock time.

#![allow(clippy::similar_names)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use syenite_types::{ClientId, OpId, OpNumber, ReplicaId, ViewNumber};

use crate::client::{ClientEngine, OpState};
use crate::dispatch::{Dispatcher, NullStateMachine};
use crate::engine::ReplicaEngine;
use crate::log::{EMPTY_LOG_HASH, merge_log_hashes};
use crate::message::{
    ClientOp, MissingLogsResponse, PeerMessage, PersistedCliOp, PrepareResponse, StartViewResponse,
};
use crate::replica::{ClientOpOutcome, Status};

/// Clients live above this index in the shared address space.
const CLIENT_MIN_IDX: u32 = 57;

fn rid(i: u32) -> ReplicaId {
    ReplicaId::new(i)
}

// ============================================================================
// Deterministic Buggy Network
// ============================================================================

/// One queued delivery, including reply legs.
enum Packet {
    Peer { from: u32, to: u32, msg: PeerMessage },
    ToClient { from: u32, to: u32, msg: PersistedCliOp },
    ClientOutcome { from: u32, to: u32, outcome: ClientOpOutcome },
    PrepareReply { from: u32, to: u32, msg: PrepareResponse },
    StartViewReply { from: u32, to: u32, msg: StartViewResponse },
    MissingLogsReply { from: u32, to: u32, msg: MissingLogsResponse },
}

type DecideFn = Box<dyn Fn(u32, u32) -> bool + Send>;

struct BuggyNet {
    queue: Mutex<VecDeque<Packet>>,
    /// Returns true when the link `from -> to` delivers.
    decide: Mutex<DecideFn>,
    /// Seeded reordering of the delivery queue; `None` is FIFO.
    shuffle: Mutex<Option<SmallRng>>,
}

impl BuggyNet {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            decide: Mutex::new(Box::new(|_, _| true)),
            shuffle: Mutex::new(None),
        }
    }

    fn push(&self, pkt: Packet) {
        self.queue.lock().unwrap().push_back(pkt);
    }

    fn pop(&self) -> Option<Packet> {
        let mut queue = self.queue.lock().unwrap();
        let mut shuffle = self.shuffle.lock().unwrap();
        match &mut *shuffle {
            Some(rng) if queue.len() > 1 => {
                // Bounded reordering: pick one of the next few packets.
                let idx = rng.gen_range(0..queue.len().min(4));
                queue.remove(idx)
            }
            _ => queue.pop_front(),
        }
    }

    fn alive(&self, from: u32, to: u32) -> bool {
        from == to || (self.decide.lock().unwrap())(from, to)
    }
}

/// Per-endpoint dispatcher: stamps the sender and queues.
struct NetDispatcher {
    id: u32,
    net: Arc<BuggyNet>,
}

impl Dispatcher for NetDispatcher {
    fn send_to_replica(&self, to: ReplicaId, msg: PeerMessage) {
        self.net.push(Packet::Peer {
            from: self.id,
            to: to.as_u32(),
            msg,
        });
    }

    fn send_to_client(&self, to: ClientId, msg: PersistedCliOp) {
        self.net.push(Packet::ToClient {
            from: self.id,
            to: to.as_u32(),
            msg,
        });
    }
}

// ============================================================================
// Cluster Harness
// ============================================================================

struct Cluster {
    net: Arc<BuggyNet>,
    replicas: Vec<Arc<ReplicaEngine>>,
    clients: Vec<Arc<ClientEngine>>,
}

impl Cluster {
    fn new(totreplicas: u32, clients: u32) -> Self {
        let net = Arc::new(BuggyNet::new());
        let replicas = (0..totreplicas)
            .map(|i| {
                let dispatcher = Arc::new(NetDispatcher {
                    id: i,
                    net: Arc::clone(&net),
                });
                Arc::new(ReplicaEngine::new(
                    totreplicas,
                    i,
                    dispatcher,
                    Box::new(NullStateMachine),
                ))
            })
            .collect();
        let clients = (0..clients)
            .map(|k| {
                let dispatcher = Arc::new(NetDispatcher {
                    id: CLIENT_MIN_IDX + k,
                    net: Arc::clone(&net),
                });
                Arc::new(ClientEngine::with_timing(
                    CLIENT_MIN_IDX + k,
                    dispatcher,
                    totreplicas,
                    3,
                    Duration::from_millis(100),
                ))
            })
            .collect();
        Self {
            net,
            replicas,
            clients,
        }
    }

    fn set_partition(&self, f: impl Fn(u32, u32) -> bool + Send + 'static) {
        *self.net.decide.lock().unwrap() = Box::new(f);
    }

    fn heal(&self) {
        self.set_partition(|_, _| true);
    }

    fn enable_shuffle(&self, seed: u64) {
        *self.net.shuffle.lock().unwrap() = Some(SmallRng::seed_from_u64(seed));
    }

    fn replica(&self, i: u32) -> &Arc<ReplicaEngine> {
        &self.replicas[i as usize]
    }

    fn client(&self, k: u32) -> &Arc<ClientEngine> {
        &self.clients[k as usize]
    }

    /// Delivers queued packets until the network is idle.
    fn pump(&self) {
        let mut processed = 0usize;
        while let Some(pkt) = self.net.pop() {
            processed += 1;
            assert!(processed < 100_000, "network livelock");
            self.deliver(pkt);
        }
    }

    /// One replica tick on every engine, then a pump.
    fn tick(&self) {
        for replica in &self.replicas {
            replica.health_timeout_ticked();
        }
        self.pump();
    }

    fn ticks(&self, count: usize) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// One client retransmission tick on every client, then a pump.
    fn tick_clients(&self) {
        for client in &self.clients {
            client.time_tick();
        }
        self.pump();
    }

    fn deliver(&self, pkt: Packet) {
        match pkt {
            Packet::Peer { from, to, msg } => {
                if !self.net.alive(from, to) {
                    return;
                }
                let target = &self.replicas[to as usize];
                match msg {
                    PeerMessage::ClientOp(op) => {
                        let outcome = target.consume_client_op(&op);
                        if from >= CLIENT_MIN_IDX {
                            self.net.push(Packet::ClientOutcome {
                                from: to,
                                to: from,
                                outcome,
                            });
                        }
                    }
                    PeerMessage::StartViewChange(m) => {
                        let _ = target.consume_start_view_change(rid(from), &m);
                    }
                    PeerMessage::DoViewChange(m) => {
                        let _ = target.consume_do_view_change(rid(from), &m);
                    }
                    PeerMessage::StartView(m) => {
                        let reply = target.consume_start_view(rid(from), &m);
                        self.net.push(Packet::StartViewReply {
                            from: to,
                            to: from,
                            msg: reply,
                        });
                    }
                    PeerMessage::Prepare(m) => {
                        let reply = target.consume_prepare(rid(from), &m);
                        self.net.push(Packet::PrepareReply {
                            from: to,
                            to: from,
                            msg: reply,
                        });
                    }
                    PeerMessage::GetMissingLogs(m) => {
                        let reply = target.consume_get_missing_logs(rid(from), &m);
                        self.net.push(Packet::MissingLogsReply {
                            from: to,
                            to: from,
                            msg: reply,
                        });
                    }
                    PeerMessage::OpPersistedQuery(m) => {
                        if let Some(ack) =
                            target.consume_op_persisted_query(ClientId::new(from), &m)
                        {
                            self.net.push(Packet::ToClient {
                                from: to,
                                to: from,
                                msg: ack,
                            });
                        }
                    }
                }
            }
            Packet::ToClient { from, to, msg } => {
                if !self.net.alive(from, to) {
                    return;
                }
                self.client_by_addr(to).consume_persisted(rid(from), &msg);
            }
            Packet::ClientOutcome { from, to, outcome } => {
                if !self.net.alive(from, to) {
                    return;
                }
                let client = self.client_by_addr(to);
                match outcome {
                    ClientOpOutcome::Redirect(lr) => client.consume_leader_redirect(rid(from), &lr),
                    ClientOpOutcome::Persisted(ack) => client.consume_persisted(rid(from), &ack),
                    ClientOpOutcome::Accepted | ClientOpOutcome::Retry => {}
                }
            }
            Packet::PrepareReply { from, to, msg } => {
                if !self.net.alive(from, to) {
                    return;
                }
                let _ = self.replicas[to as usize].consume_prepare_reply(rid(from), &msg);
            }
            Packet::StartViewReply { from, to, msg } => {
                if !self.net.alive(from, to) {
                    return;
                }
                let _ = self.replicas[to as usize].consume_start_view_reply(rid(from), &msg);
            }
            Packet::MissingLogsReply { from, to, msg } => {
                if !self.net.alive(from, to) {
                    return;
                }
                let _ = self.replicas[to as usize].consume_missing_logs_reply(rid(from), &msg);
            }
        }
    }

    fn client_by_addr(&self, addr: u32) -> &Arc<ClientEngine> {
        &self.clients[(addr - CLIENT_MIN_IDX) as usize]
    }

    /// Drives replica and client ticks until the client observes the op
    /// consumed; panics after `budget` rounds.
    fn drive_until_consumed(&self, client: u32, opid: OpId, budget: usize) {
        for _ in 0..budget {
            if self.client(client).start_op(opid) == OpState::Consumed {
                return;
            }
            self.pump();
            self.tick();
            self.tick_clients();
        }
        panic!("op {opid} not consumed within {budget} rounds");
    }

    // ========================================================================
    // Cluster-Wide Assertions
    // ========================================================================

    /// Log prefix agreement, digest consistency, and dense numbering on
    /// every replica.
    fn assert_invariants(&self) {
        for replica in &self.replicas {
            let logs = replica.committed_logs();
            for (i, entry) in logs.iter().enumerate() {
                assert_eq!(
                    entry.op_number,
                    OpNumber::new(i as i32),
                    "log must be dense"
                );
            }
            assert_eq!(
                replica.commit_id().as_i32(),
                logs.len() as i32 - 1,
                "commit must equal the log tail"
            );
            assert_eq!(
                replica.log_hash(),
                merge_log_hashes(&logs, EMPTY_LOG_HASH),
                "digest must equal the fold of the log"
            );
            assert!(replica.commit_id() <= replica.op_id());
        }

        for a in &self.replicas {
            for b in &self.replicas {
                let logs_a = a.committed_logs();
                let logs_b = b.committed_logs();
                let common = logs_a.len().min(logs_b.len());
                assert_eq!(
                    logs_a[..common],
                    logs_b[..common],
                    "replicas disagree on a committed prefix"
                );
            }
        }
    }

    fn assert_all_normal_at(&self, view: u32, replicas: &[u32]) {
        for &i in replicas {
            assert_eq!(
                self.replica(i).view(),
                ViewNumber::new(view),
                "replica {i} view"
            );
            assert_eq!(self.replica(i).status(), Status::Normal, "replica {i} status");
        }
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

#[test]
fn fresh_cluster_elects_initial_leader() {
    let cluster = Cluster::new(5, 0);
    for i in 0..5 {
        assert_eq!(cluster.replica(i).status(), Status::Change);
    }
    // Replica 0 leads view 0; its first tick reasserts the election and
    // the StartViewResponses confirm it.
    cluster.tick();
    cluster.assert_all_normal_at(0, &[0, 1, 2, 3, 4]);
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 1: Basic Commit, n=5, No Failures
// ============================================================================

#[test]
fn basic_commit_no_failures() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    let opid = cluster.client(0).init_op("x=1");
    assert_eq!(cluster.client(0).start_op(opid), OpState::JustStarted);
    cluster.pump();

    // The leader commits on quorum; the next two ticks' heartbeats drive
    // every follower's commit and acknowledgement.
    cluster.ticks(2);

    for i in 0..5 {
        assert_eq!(cluster.replica(i).commit_id(), OpNumber::new(0), "replica {i}");
        let logs = cluster.replica(i).committed_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].client_op.opstr, "x=1");
        assert_eq!(logs[0].client_op.cliopid, opid);
    }
    assert_eq!(cluster.client(0).start_op(opid), OpState::Consumed);
    assert_eq!(cluster.client(0).delete_op(opid), Ok(()));
    cluster.assert_invariants();
}

#[test]
fn successive_commits_build_a_dense_log() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    for k in 0..4 {
        let opid = cluster.client(0).init_op(format!("x={k}"));
        cluster.client(0).start_op(opid);
        cluster.pump();
        cluster.ticks(2);
        cluster.drive_until_consumed(0, opid, 20);
        cluster.client(0).delete_op(opid).unwrap();
    }

    for i in 0..5 {
        assert_eq!(cluster.replica(i).commit_id(), OpNumber::new(3), "replica {i}");
    }
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 2: Leader Isolation
// ============================================================================

#[test]
fn isolated_leader_is_replaced_and_converges_after_heal() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    // Commit one op so the new view has history to carry.
    let opid = cluster.client(0).init_op("pre=1");
    cluster.client(0).start_op(opid);
    cluster.pump();
    cluster.ticks(2);
    assert_eq!(cluster.client(0).start_op(opid), OpState::Consumed);

    // Cut replica 0 (the leader) off entirely.
    cluster.set_partition(|from, to| from != 0 && to != 0);

    // The isolated leader still accepts an op and advances its op
    // number, but without acknowledgements it can never commit.
    let orphan = ClientOp::new(ClientId::new(CLIENT_MIN_IDX), "lost=1", OpId::new(900));
    assert_eq!(
        cluster.replica(0).consume_client_op(&orphan),
        ClientOpOutcome::Accepted
    );
    assert_eq!(cluster.replica(0).op_id(), OpNumber::new(1));
    assert_eq!(cluster.replica(0).commit_id(), OpNumber::new(0));

    cluster.ticks(20);
    cluster.assert_all_normal_at(1, &[1, 2, 3, 4]);
    assert_eq!(cluster.replica(0).commit_id(), OpNumber::new(0), "no quorum, no commit");

    // Reconnect: the view-1 leader's heartbeats pull replica 0 forward.
    cluster.heal();
    cluster.ticks(5);
    cluster.assert_all_normal_at(1, &[0, 1, 2, 3, 4]);
    assert_eq!(cluster.replica(0).op_id(), cluster.replica(0).commit_id());
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 3: Sequential View Increments
// ============================================================================

#[test]
fn view_walks_past_dead_leader_elects() {
    let cluster = Cluster::new(5, 0);
    cluster.tick();

    // Cut off replicas 0 and 1: view 0's leader is dead, and so is the
    // leader-elect of view 1. The survivors must walk the view forward
    // until they find a live one.
    cluster.set_partition(|from, to| from > 1 && to > 1);

    cluster.ticks(20);
    cluster.assert_all_normal_at(2, &[2, 3, 4]);

    cluster.heal();
    cluster.ticks(6);
    cluster.assert_all_normal_at(2, &[0, 1, 2, 3, 4]);
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 4: Split Brain
// ============================================================================

#[test]
fn split_brain_minority_cannot_commit() {
    let cluster = Cluster::new(5, 2);
    cluster.tick();

    // Group A: replicas 1, 2 and client 57. Group B: replicas 0, 3, 4
    // and client 58. No cross-group delivery.
    let in_a = |x: u32| x == 1 || x == 2 || x == CLIENT_MIN_IDX;
    cluster.set_partition(move |from, to| in_a(from) == in_a(to));

    // The minority-side client's op can reach only replicas 1 and 2,
    // which redirect to the unreachable leader.
    let minority_op = cluster.client(0).init_op("minority=1");
    cluster.client(0).start_op(minority_op);
    cluster.pump();

    // The majority side keeps committing.
    let majority_op = cluster.client(1).init_op("majority=1");
    cluster.client(1).start_op(majority_op);
    cluster.pump();

    for _ in 0..12 {
        cluster.tick();
        cluster.tick_clients();
    }

    assert_eq!(
        cluster.client(1).start_op(majority_op),
        OpState::Consumed,
        "majority commits"
    );
    assert_eq!(
        cluster.client(0).start_op(minority_op),
        OpState::Ongoing,
        "minority stays in flight"
    );
    for i in [1u32, 2] {
        assert_eq!(
            cluster.replica(i).commit_id(),
            OpNumber::NONE,
            "two replicas can never reach quorum"
        );
    }

    // Heal: the minority catches up and the stranded op commits.
    cluster.heal();
    cluster.drive_until_consumed(0, minority_op, 40);
    cluster.ticks(4);

    let view = cluster.replica(0).view();
    for i in 0..5 {
        assert_eq!(cluster.replica(i).view(), view, "replica {i} converged");
        assert_eq!(cluster.replica(i).status(), Status::Normal);
    }
    let reference = cluster.replica(0).committed_logs();
    assert_eq!(reference.len(), 2, "both ops committed exactly once");
    for i in 1..5 {
        assert_eq!(cluster.replica(i).committed_logs(), reference);
    }
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 5: Prepare Timeout and Client Retry
// ============================================================================

#[test]
fn leader_abandons_unacknowledged_op_and_client_retries() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    // Block replica traffic inbound to the leader: Prepares still reach
    // the followers and clients still reach the leader, but no
    // acknowledgement makes it back.
    cluster.set_partition(|from, to| to != 0 || from >= CLIENT_MIN_IDX);

    let opid = cluster.client(0).init_op("x=1");
    cluster.client(0).start_op(opid);
    cluster.pump();
    assert_eq!(cluster.replica(0).op_id(), OpNumber::new(0));

    // Silence past the abandonment threshold reverts the op.
    cluster.ticks(5);
    assert_eq!(cluster.replica(0).op_id(), OpNumber::NONE);
    assert_eq!(cluster.replica(0).commit_id(), OpNumber::NONE);

    // Heal; the client's retransmission loop re-drives the same cliopid
    // to commit, exactly once.
    cluster.heal();
    cluster.drive_until_consumed(0, opid, 40);
    cluster.ticks(3);
    for i in 0..5 {
        let logs = cluster.replica(i).committed_logs();
        assert_eq!(logs.len(), 1, "replica {i}");
        assert_eq!(logs[0].client_op.cliopid, opid);
    }
    cluster.assert_invariants();
}

// ============================================================================
// Scenario 6: Missing-Log Catch-Up
// ============================================================================

#[test]
fn lagging_follower_catches_up_through_repair() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    // Replica 4 misses two commits while cut off.
    cluster.set_partition(|from, to| from != 4 && to != 4);
    for k in 0..2 {
        let opid = cluster.client(0).init_op(format!("x={k}"));
        cluster.client(0).start_op(opid);
        cluster.pump();
        cluster.ticks(2);
    }
    assert_eq!(cluster.replica(0).commit_id(), OpNumber::new(1));
    assert_eq!(cluster.replica(4).commit_id(), OpNumber::NONE);

    // On heal, the next Prepare exposes the gap; the follower pulls the
    // missing entries and matches the leader's digest.
    cluster.heal();
    cluster.ticks(4);
    assert_eq!(cluster.replica(4).commit_id(), OpNumber::new(1));
    assert_eq!(cluster.replica(4).log_hash(), cluster.replica(0).log_hash());
    cluster.assert_invariants();
}

// ============================================================================
// At-Most-Once Semantics
// ============================================================================

#[test]
fn resubmitted_op_is_not_reexecuted() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    let opid = cluster.client(0).init_op("x=1");
    cluster.client(0).start_op(opid);
    cluster.pump();
    cluster.ticks(2);
    assert_eq!(cluster.client(0).start_op(opid), OpState::Consumed);

    // A duplicate submission of the committed op is answered from the
    // dedup set, not replicated again.
    let dup = ClientOp::new(ClientId::new(CLIENT_MIN_IDX), "x=1", opid);
    let outcome = cluster.replica(0).consume_client_op(&dup);
    assert!(matches!(outcome, ClientOpOutcome::Persisted(_)));
    cluster.pump();
    cluster.ticks(2);

    for i in 0..5 {
        assert_eq!(cluster.replica(i).committed_logs().len(), 1, "replica {i}");
    }
    cluster.assert_invariants();
}

// ============================================================================
// Reordered Delivery
// ============================================================================

#[test]
fn commits_survive_shuffled_delivery() {
    let cluster = Cluster::new(5, 1);
    cluster.enable_shuffle(42);
    cluster.tick();

    for k in 0..3 {
        let opid = cluster.client(0).init_op(format!("x={k}"));
        cluster.client(0).start_op(opid);
        cluster.drive_until_consumed(0, opid, 30);
    }

    cluster.ticks(3);
    for i in 0..5 {
        assert_eq!(cluster.replica(i).commit_id(), OpNumber::new(2), "replica {i}");
    }
    cluster.assert_invariants();
}

// ============================================================================
// Persisted-Op Query End to End
// ============================================================================

#[test]
fn op_persisted_query_is_answered_from_the_dedup_set() {
    let cluster = Cluster::new(5, 1);
    cluster.tick();

    let opid = cluster.client(0).init_op("x=1");
    cluster.client(0).start_op(opid);
    cluster.pump();
    cluster.ticks(2);

    let view = cluster.replica(0).view();
    let ack = cluster.replica(0).consume_op_persisted_query(
        ClientId::new(CLIENT_MIN_IDX),
        &crate::message::OpPersistedQuery {
            perscliop: PersistedCliOp {
                view,
                cliopid: opid,
            },
        },
    );
    assert_eq!(
        ack,
        Some(PersistedCliOp {
            view,
            cliopid: opid,
        })
    );
}
