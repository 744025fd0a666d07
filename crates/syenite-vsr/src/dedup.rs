//! Duplicate suppression for quorum counting.
//!
//! Protocol rounds (view changes, prepare acknowledgements) tally
//! messages from distinct senders per view. The transport may duplicate
//! or reorder, and senders drift across views at different speeds, so
//! the tally must (a) count each sender at most once per round and
//! (b) let a sender abandon an old round when it moves to a new one.
//!
//! [`DupTracker`] is a small matrix: up to `totreplicas` concurrently
//! tracked rounds (slots), each recording which senders have contributed.
//! Capacity `totreplicas` suffices because each sender occupies at most
//! one slot, so at most `n` distinct rounds can coexist across `n`
//! senders.
//!
//! Slot keys are `i64` so the same structure serves both view-keyed
//! tallies and op-keyed tallies, where `-1` is a legitimate key.

use syenite_types::ReplicaId;

/// All slots are occupied by other rounds; unreachable while senders are
/// balanced, so callers treat it as a bug signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no free duplicate-tracker slot")]
pub struct SlotsExhausted;

/// One tracked round: the key it tallies and the per-sender marks.
#[derive(Debug, Clone)]
struct Slot {
    key: Option<i64>,
    marks: Vec<bool>,
}

/// Sender × round duplicate tracker.
#[derive(Debug, Clone)]
pub struct DupTracker {
    slots: Vec<Slot>,
}

impl DupTracker {
    pub fn new(totreplicas: usize) -> Self {
        Self {
            slots: (0..totreplicas)
                .map(|_| Slot {
                    key: None,
                    marks: vec![false; totreplicas],
                })
                .collect(),
        }
    }

    /// Records `(from, key)` and reports whether it was already counted.
    ///
    /// Returns `(is_duplicate, slot)`. A sender submitting a new key is
    /// migrated: its mark in the old slot is cleared, and the old slot is
    /// released once its last mark is gone.
    pub fn check(&mut self, from: ReplicaId, key: i64) -> Result<(bool, usize), SlotsExhausted> {
        let from = from.as_usize();

        if let Some(fromi) = self.find_sender(from) {
            if self.slots[fromi].key == Some(key) {
                return Ok((true, fromi));
            }
            self.slots[fromi].marks[from] = false;
            if !self.slots[fromi].marks.iter().any(|&m| m) {
                self.slots[fromi].key = None;
            }
        }

        if let Some(keyi) = self.slots.iter().position(|s| s.key == Some(key)) {
            let was_marked = self.slots[keyi].marks[from];
            self.slots[keyi].marks[from] = true;
            return Ok((was_marked, keyi));
        }

        let Some(emptyi) = self.slots.iter().position(|s| s.key.is_none()) else {
            return Err(SlotsExhausted);
        };
        self.slots[emptyi].key = Some(key);
        self.slots[emptyi].marks[from] = true;
        Ok((false, emptyi))
    }

    /// Number of distinct senders counted in `slot`.
    pub fn count(&self, slot: usize) -> usize {
        self.slots[slot].marks.iter().filter(|&&m| m).count()
    }

    /// Returns true if `from` is marked in `slot`.
    pub fn is_marked(&self, slot: usize, from: ReplicaId) -> bool {
        self.slots[slot].marks[from.as_usize()]
    }

    /// Releases one slot after its quorum decision has been acted upon.
    pub fn clear(&mut self, slot: usize) {
        self.slots[slot].key = None;
        self.slots[slot].marks.fill(false);
    }

    /// Releases every slot.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            slot.key = None;
            slot.marks.fill(false);
        }
    }

    fn find_sender(&self, from: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.key.is_some() && s.marks[from])
    }
}
