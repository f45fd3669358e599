use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A grow-only counter keyed by identity.
///
/// Each author only ever raises its own slot; merging takes the per-key
/// maximum, so merge is commutative, associative and idempotent. The counter
/// value is the sum of all slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: BTreeMap<String, u64>,
}

impl GCounter {
    pub fn new() -> GCounter {
        GCounter {
            counts: BTreeMap::new(),
        }
    }

    /// Raises `id`'s slot to `value` if it is higher than what is recorded.
    pub fn observe(&mut self, id: &str, value: u64) {
        let slot = self.counts.entry(id.to_owned()).or_insert(0);
        if *slot < value {
            *slot = value;
        }
    }

    /// Adds `amount` to `id`'s slot and returns the new slot value.
    pub fn increment(&mut self, id: &str, amount: u64) -> u64 {
        let slot = self.counts.entry(id.to_owned()).or_insert(0);
        *slot += amount;
        *slot
    }

    pub fn get(&self, id: &str) -> u64 {
        self.counts.get(id).copied().unwrap_or(0)
    }

    /// The counter value: the sum over all identity slots.
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn merge(&mut self, other: &GCounter) {
        for (id, value) in &other.counts {
            self.observe(id, *value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_sums_slots() {
        let mut counter = GCounter::new();
        counter.increment("a", 3);
        counter.increment("b", 4);
        counter.increment("a", 1);
        assert_eq!(counter.value(), 8);
        assert_eq!(counter.get("a"), 4);
    }

    #[test]
    fn observe_keeps_maximum() {
        let mut counter = GCounter::new();
        counter.observe("a", 5);
        counter.observe("a", 3);
        assert_eq!(counter.get("a"), 5);
        counter.observe("a", 9);
        assert_eq!(counter.get("a"), 9);
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let mut a = GCounter::new();
        a.increment("x", 2);
        a.increment("y", 1);
        let mut b = GCounter::new();
        b.increment("x", 5);
        b.increment("z", 7);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let once = ab.clone();
        ab.merge(&b);
        assert_eq!(ab, once);
        assert_eq!(ab.value(), 5 + 1 + 7);
    }
}
