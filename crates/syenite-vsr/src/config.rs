//! Cluster configuration.

use std::time::Duration;

use syenite_types::{ReplicaId, ViewNumber, quorum_size};

/// Default replica tick cadence.
pub const REPLICA_TICK_INTERVAL: Duration = Duration::from_millis(150);

/// Default client tick cadence.
pub const CLIENT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A fixed cluster of `2f + 1` replicas with ids `0..totreplicas`.
///
/// Membership never changes at runtime; the leader of a view is derived,
/// not elected by name: `view mod totreplicas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    totreplicas: u32,
}

impl ClusterConfig {
    /// Creates a configuration for a cluster of `totreplicas` members.
    ///
    /// # Panics
    ///
    /// Panics if `totreplicas < 3`; a smaller group cannot survive any
    /// failure and the protocol degenerates.
    pub fn new(totreplicas: u32) -> Self {
        assert!(totreplicas >= 3, "cluster needs at least 3 replicas");
        Self { totreplicas }
    }

    pub fn cluster_size(self) -> usize {
        self.totreplicas as usize
    }

    pub fn totreplicas(self) -> u32 {
        self.totreplicas
    }

    /// The replica that leads `view`.
    pub fn leader_for_view(self, view: ViewNumber) -> ReplicaId {
        view.leader(self.totreplicas)
    }

    pub fn contains(self, replica: ReplicaId) -> bool {
        replica.as_u32() < self.totreplicas
    }

    /// Strict-majority quorum size.
    pub fn quorum_size(self) -> usize {
        quorum_size(self.totreplicas as usize)
    }

    /// The tally threshold used when counting messages from peers where
    /// the receiver's own voice is implicit: `⌊n/2⌋` peers plus self is a
    /// strict majority.
    pub fn peer_majority(self) -> usize {
        self.totreplicas as usize / 2
    }

    /// Iterates every replica id in the cluster.
    pub fn replicas(self) -> impl Iterator<Item = ReplicaId> {
        (0..self.totreplicas).map(ReplicaId::new)
    }

    /// Iterates every replica id except `me`.
    pub fn others(self, me: ReplicaId) -> impl Iterator<Item = ReplicaId> {
        self.replicas().filter(move |&r| r != me)
    }
}
