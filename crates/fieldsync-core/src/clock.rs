//! Per-device vector clocks
//!
//! Clocks order operations causally. Two operations on the same entity
//! conflict iff their clocks compare as [`ClockOrdering::Concurrent`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOrdering {
    /// Left side happened before the right side
    Before,
    /// Left side happened after the right side
    After,
    /// Neither side dominates the other
    Concurrent,
    /// Both sides carry identical counters
    Equal,
}

/// Mapping from device id to the highest counter observed for that device.
///
/// Missing entries are treated as 0. Counters are unsigned, so a clock with a
/// negative counter is rejected when it is decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// Create an empty clock
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Counter for `device`, 0 when absent
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Overwrite the counter for `device`
    pub fn set(&mut self, device: impl Into<String>, counter: u64) {
        self.0.insert(device.into(), counter);
    }

    /// Bump the counter for `device` and return the new value
    pub fn increment(&mut self, device: &str) -> u64 {
        let counter = self.0.entry(device.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Pointwise maximum with `other`, in place.
    ///
    /// Returns whether any counter changed.
    pub fn merge_from(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(device.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
                changed = true;
            }
        }
        changed
    }

    /// Pointwise maximum of `self` and `other`
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// Causal comparison of `self` against `other`
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Iterate `(device, counter)` pairs in device order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(device, counter)| (device.as_str(), *counter))
    }

    /// Whether the clock has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(device, counter)| (device.into(), counter))
                .collect(),
        )
    }
}

/// Pointwise maximum of two clocks
pub fn merge(a: &VectorClock, b: &VectorClock) -> VectorClock {
    a.merged(b)
}

/// Causal comparison of `a` against `b`
pub fn compare(a: &VectorClock, b: &VectorClock) -> ClockOrdering {
    a.compare(b)
}
