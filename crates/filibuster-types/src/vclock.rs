use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-actor happens-before clock carried on every intercepted call.
///
/// Keys are service names, values monotonically increasing counters. The
/// backing `BTreeMap` keeps JSON serialization canonical: the same clock
/// always renders as the same string, which is what lets serialized clocks
/// act as comparison keys on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// The empty clock. Requests entering the system from the functional
    /// test carry this as their origin.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Advance `actor` by one, leaving `self` untouched.
    pub fn increment(&self, actor: &str) -> Self {
        let mut next = self.0.clone();
        *next.entry(actor.to_string()).or_insert(0) += 1;
        Self(next)
    }

    /// Pointwise max over the union of keys.
    pub fn merge(a: &Self, b: &Self) -> Self {
        let mut merged = a.0.clone();
        for (key, theirs) in &b.0 {
            let slot = merged.entry(key.clone()).or_insert(0);
            if *theirs > *slot {
                *slot = *theirs;
            }
        }
        Self(merged)
    }

    /// Does `other` descend `self`?
    ///
    /// True iff `other` is at least `self` on every key of `self` and is
    /// strictly ahead somewhere: a larger count, or a key `self` lacks.
    /// `x.descends(x)` is therefore false.
    pub fn descends(&self, other: &Self) -> bool {
        let at_least_equal = self
            .0
            .iter()
            .all(|(key, ours)| other.0.get(key).is_some_and(|theirs| theirs >= ours));

        let strictly_ahead = other.0.iter().any(|(key, theirs)| match self.0.get(key) {
            None => true,
            Some(ours) => theirs > ours,
        });

        at_least_equal && strictly_ahead
    }

    /// The counter for `actor`, 0 when absent.
    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical JSON object form, suitable for an HTTP header value.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.0).expect("string-keyed integer map serializes infallibly")
    }

    /// Parse a clock from its canonical JSON object form.
    pub fn from_json_string(serialized: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(serialized)
    }
}
