use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Deterministic encoding of the dynamic call path from the test entry
/// point.
///
/// `callstack` holds `(callsite hash, invocation count)` frames for the
/// path currently being executed; `counters` holds, per hash, how many
/// times that call site has been entered along this path. The hash is
/// chosen by the instrumentation (typically a digest of traceback, module,
/// method, and target) and identifies "the same call site in the same
/// dynamic context".
///
/// Only the callstack travels on the wire; counters are re-derived when a
/// serialized index is parsed. Equality likewise considers the callstack
/// only, so `pop` is a true inverse of `push`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionIndex {
    callstack: Vec<(String, u64)>,
    #[serde(skip)]
    counters: BTreeMap<String, u64>,
}

impl ExecutionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a call site: bump its counter along this path and push the
    /// frame. Re-entering the same hash from a loop body yields distinct
    /// frames `(h, 1)`, `(h, 2)`, ...
    pub fn push(&mut self, hash: &str) {
        let counter = self.counters.entry(hash.to_string()).or_insert(0);
        *counter += 1;
        self.callstack.push((hash.to_string(), *counter));
    }

    /// Leave the innermost call site.
    ///
    /// Popping with nothing on the stack is a double pop in the
    /// instrumentation and surfaces as a usage error.
    pub fn pop(&mut self) -> Result<(), DomainError> {
        if self.callstack.pop().is_none() {
            return Err(DomainError::EmptyCallstackPop);
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.callstack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callstack.is_empty()
    }

    /// Wire form: the JSON array of `[hash, count]` frames, callstack only.
    pub fn to_wire_string(&self) -> String {
        serde_json::to_string(&self.callstack).expect("callstack serializes infallibly")
    }

    /// Parse a wire-form index, re-deriving each hash's counter as the
    /// maximum count appearing for it on the callstack.
    pub fn from_wire_string(serialized: &str) -> Result<Self, serde_json::Error> {
        let callstack: Vec<(String, u64)> = serde_json::from_str(serialized)?;

        let mut counters = BTreeMap::new();
        for (hash, count) in &callstack {
            let slot = counters.entry(hash.clone()).or_insert(0);
            if *count > *slot {
                *slot = *count;
            }
        }

        Ok(Self { callstack, counters })
    }

    /// The serialized empty index (`"[]"`).
    ///
    /// Causal-descendent maps key requests caused directly by the test
    /// entry point under this synthetic root.
    pub fn root_key() -> String {
        Self::new().to_wire_string()
    }
}

impl PartialEq for ExecutionIndex {
    fn eq(&self, other: &Self) -> bool {
        self.callstack == other.callstack
    }
}

impl Eq for ExecutionIndex {}

impl fmt::Display for ExecutionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_inverts_push() {
        let mut index = ExecutionIndex::new();
        index.push("aaa");

        let before = index.clone();
        index.push("bbb");
        index.pop().unwrap();

        assert_eq!(index, before);
    }

    #[test]
    fn pop_on_empty_is_a_usage_error() {
        let mut index = ExecutionIndex::new();
        assert_eq!(index.pop(), Err(DomainError::EmptyCallstackPop));
    }

    #[test]
    fn repeated_pushes_of_one_hash_are_disambiguated_by_count() {
        let mut index = ExecutionIndex::new();
        index.push("loop-call");
        index.pop().unwrap();
        index.push("loop-call");

        assert_eq!(index.to_wire_string(), r#"[["loop-call",2]]"#);
    }

    #[test]
    fn wire_round_trip_preserves_callstack_order() {
        let mut index = ExecutionIndex::new();
        index.push("aaa");
        index.push("bbb");
        index.push("aaa");

        let serialized = index.to_wire_string();
        assert_eq!(serialized, r#"[["aaa",1],["bbb",1],["aaa",2]]"#);

        let parsed = ExecutionIndex::from_wire_string(&serialized).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn parsed_counters_continue_where_the_callstack_left_off() {
        let mut index = ExecutionIndex::from_wire_string(r#"[["aaa",3]]"#).unwrap();
        index.push("aaa");

        assert_eq!(index.to_wire_string(), r#"[["aaa",3],["aaa",4]]"#);
    }

    #[test]
    fn root_key_is_the_empty_array() {
        assert_eq!(ExecutionIndex::root_key(), "[]");
    }

    #[test]
    fn malformed_wire_string_is_rejected() {
        assert!(ExecutionIndex::from_wire_string("not json").is_err());
        assert!(ExecutionIndex::from_wire_string(r#"{"a":1}"#).is_err());
    }
}
