//! Dynamic reduction: skip executing a scheduled test whose observable
//! outcome at every service boundary is already implied by completed
//! executions.
//!
//! Soundness leans on two properties of the identity model: execution-index
//! determinism (the same call site reached by the same dynamic path gets
//! the same index across runs) and origin vector clocks identifying the
//! exact parent request. Whenever either is missing the pruner degrades to
//! "cannot prune" and logs; it never errors.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, error, warn};

use filibuster_types::{ExecutionIndex, ResponseLogEntry, TestExecution, VectorClock};

/// Map each execution index in `execution.log` to the indexes of entries
/// it directly caused (their `origin_vclock` equals its `vclock`). Entries
/// caused by the test entry point itself (empty origin) key under the
/// serialized empty index.
///
/// Returns `None` when any entry lacks clock or index data.
pub fn causal_descendents(execution: &TestExecution) -> Option<BTreeMap<String, Vec<String>>> {
    let mut descendents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    descendents.insert(ExecutionIndex::root_key(), Vec::new());

    let empty_clock = VectorClock::new();

    for entry in execution.log.iter() {
        let (Some(vclock), Some(origin_vclock), Some(index)) = (
            entry.vclock.as_ref(),
            entry.origin_vclock.as_ref(),
            entry.execution_index.as_ref(),
        ) else {
            error!(
                generated_id = entry.generated_id,
                "log entry is missing causality data; execution cannot be pruned"
            );
            return None;
        };

        for other in execution.log.iter() {
            let (Some(other_origin), Some(other_index)) = (
                other.origin_vclock.as_ref(),
                other.execution_index.as_ref(),
            ) else {
                error!(
                    generated_id = other.generated_id,
                    "log entry is missing causality data; execution cannot be pruned"
                );
                return None;
            };

            if other_origin == vclock {
                descendents
                    .entry(index.clone())
                    .or_default()
                    .push(other_index.clone());
            }
        }

        if origin_vclock == &empty_clock {
            descendents
                .entry(ExecutionIndex::root_key())
                .or_default()
                .push(index.clone());
        }
    }

    Some(descendents)
}

/// Is `b` a subset of `a`? Every key of `b` must appear in `a` with an
/// equal value; a key absent from `a` reads as JSON null. Non-object
/// operands degenerate to plain equality.
pub fn is_subset_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(key, value)| a.get(key).unwrap_or(&Value::Null) == value),
        _ => a == b,
    }
}

/// Python-style truthiness for the loosely shaped failure-metadata fields.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Does the outcome `execution` would produce at `prior_entry`'s call match
/// what a previous run observed there?
///
/// - Forcing an exception: the previous run must have been forced with the
///   exact same exception descriptor, or have observed an exception the
///   forced one is a superset of (fault propagation through a dependency).
/// - Forcing failure metadata: the previous run's return value (or
///   exception) must subset-match the forced shape.
/// - Not faulting: the previous run must not have been fault-injected and
///   the scheduled projection must be a subset of what it recorded.
pub fn outcomes_match(execution: &TestExecution, prior_entry: &ResponseLogEntry) -> bool {
    let scheduled = execution
        .log
        .iter()
        .find(|call| call.execution_index == prior_entry.execution_index);
    let Some(scheduled) = scheduled else {
        return false;
    };

    let failure = execution.failures.iter().find(|failure| {
        scheduled.execution_index.as_deref() == Some(failure.execution_index.as_str())
    });

    let Some(failure) = failure else {
        // Not failing it this time: a previously injected fault can't match,
        // and otherwise the previous record is purely additive over the
        // scheduled projection.
        if prior_entry.fault_injection {
            return false;
        }
        let (Ok(prior), Ok(scheduled)) = (
            serde_json::to_value(prior_entry),
            serde_json::to_value(scheduled),
        ) else {
            return false;
        };
        let matched = is_subset_match(&prior, &scheduled);
        if !matched {
            warn!(
                execution_index = ?prior_entry.execution_index,
                "execution indexes matched but the requests differ"
            );
        }
        return matched;
    };

    if let Some(forced) = &failure.forced_exception {
        // It had to fail in the previous run too, directly or indirectly.
        if let Some(prior_forced) = &prior_entry.forced_exception {
            return prior_forced == forced;
        }
        if let Some(prior_exception) = &prior_entry.exception {
            let Ok(forced_value) = serde_json::to_value(forced) else {
                return false;
            };
            return is_subset_match(prior_exception, &forced_value);
        }
        return false;
    }

    if let Some(failure_metadata) = &failure.failure_metadata {
        if let (Some(prior_return), Some(forced_return)) = (
            prior_entry.return_value.as_ref(),
            failure_metadata.get("return_value").filter(|v| !v.is_null()),
        ) {
            let matched = is_subset_match(prior_return, forced_return);
            if !matched {
                warn!(
                    execution_index = ?prior_entry.execution_index,
                    "execution indexes matched but the return values differ"
                );
            }
            return matched;
        }

        if let (Some(prior_exception), Some(forced_exception)) = (
            prior_entry.exception.as_ref(),
            failure_metadata.get("exception").filter(|v| is_truthy(v)),
        ) {
            return is_subset_match(prior_exception, forced_exception);
        }

        return false;
    }

    // A directive with neither field forces nothing recognizable.
    false
}

/// Decide whether `execution` is subsumed by the completed `ran` set.
///
/// Prunable iff every causal group — each request together with the
/// requests it directly caused — is witnessed by some single prior
/// execution whose response log matches every descendent's outcome. A
/// different witness may serve each group.
pub fn should_prune(execution: &TestExecution, ran: &[TestExecution]) -> bool {
    let Some(descendents) = causal_descendents(execution) else {
        return false;
    };

    let prunable = descendents.iter().all(|(cause, caused)| {
        let witnessed = ran.iter().any(|prior| {
            let Some(response_log) = &prior.response_log else {
                return false;
            };
            caused.iter().all(|needed| {
                response_log.iter().any(|entry| {
                    entry.execution_index.as_deref() == Some(needed.as_str())
                        && outcomes_match(execution, entry)
                })
            })
        });
        if !witnessed {
            debug!(%cause, "no prior execution witnesses this causal group");
        }
        witnessed
    });

    prunable
}

#[cfg(test)]
mod tests {
    use filibuster_types::{FaultDirective, ForcedException, RequestLogEntry};
    use serde_json::{Map, json};
    use similar_asserts::assert_eq;

    use super::*;

    fn entry(
        generated_id: u64,
        index: &str,
        vclock: Value,
        origin_vclock: Value,
        target: Option<&str>,
    ) -> RequestLogEntry {
        serde_json::from_value(json!({
            "generated_id": generated_id,
            "instrumentation_type": "invocation",
            "source_service_name": "api",
            "target_service_name": target,
            "module": "requests",
            "method": "get",
            "args": [format!("http://{}/", target.unwrap_or("unknown"))],
            "kwargs": {},
            "metadata": {},
            "callsite_file": "app.py",
            "callsite_line": "40",
            "full_traceback": index,
            "vclock": vclock,
            "origin_vclock": origin_vclock,
            "execution_index": index,
        }))
        .unwrap()
    }

    fn connection_error(index: &str) -> FaultDirective {
        FaultDirective {
            execution_index: index.to_string(),
            forced_exception: Some(ForcedException {
                name: "requests.exceptions.ConnectionError".to_string(),
                metadata: Map::new(),
            }),
            failure_metadata: None,
            args: None,
        }
    }

    /// A -> B and A -> C in sequence, both caused by the test entry point.
    fn fan_out_log() -> Vec<RequestLogEntry> {
        vec![
            entry(0, r#"[["b",1]]"#, json!({"api": 1}), json!({}), Some("b")),
            entry(1, r#"[["c",1]]"#, json!({"api": 2}), json!({}), Some("c")),
        ]
    }

    #[test]
    fn descendents_of_a_fan_out_all_key_under_the_root() {
        let execution = TestExecution::new(&fan_out_log(), Vec::new());

        let descendents = causal_descendents(&execution).unwrap();

        assert_eq!(
            descendents.get("[]").unwrap(),
            &vec![r#"[["b",1]]"#.to_string(), r#"[["c",1]]"#.to_string()]
        );
    }

    #[test]
    fn nested_calls_key_under_their_parent() {
        let log = vec![
            entry(0, r#"[["b",1]]"#, json!({"api": 1}), json!({}), Some("b")),
            entry(
                1,
                r#"[["b",1],["c",1]]"#,
                json!({"api": 1, "b": 1}),
                json!({"api": 1}),
                Some("c"),
            ),
        ];
        let execution = TestExecution::new(&log, Vec::new());

        let descendents = causal_descendents(&execution).unwrap();

        assert_eq!(descendents.get("[]").unwrap(), &vec![r#"[["b",1]]"#.to_string()]);
        assert_eq!(
            descendents.get(r#"[["b",1]]"#).unwrap(),
            &vec![r#"[["b",1],["c",1]]"#.to_string()]
        );
    }

    #[test_log::test]
    fn missing_clock_data_means_cannot_prune() {
        let mut log = fan_out_log();
        log[1].origin_vclock = None;
        let execution = TestExecution::new(&log, Vec::new());

        assert!(causal_descendents(&execution).is_none());
        assert!(!should_prune(&execution, &[]));
    }

    #[test]
    fn subset_match_reads_missing_keys_as_null() {
        assert!(is_subset_match(
            &json!({"status_code": "503", "text": "x"}),
            &json!({"status_code": "503"})
        ));
        assert!(is_subset_match(&json!({"a": 1}), &json!({"b": null})));
        assert!(!is_subset_match(&json!({"a": 1}), &json!({"a": 2})));
    }

    #[test]
    fn forced_exception_matches_an_identical_prior_injection() {
        let log = fan_out_log();
        let scheduled =
            TestExecution::new(&log, vec![connection_error(r#"[["b",1]]"#)]);
        let prior =
            TestExecution::completed(&log, vec![connection_error(r#"[["b",1]]"#)], &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(outcomes_match(&scheduled, prior_entry));
    }

    #[test]
    fn forced_exception_rejects_a_different_prior_exception() {
        let log = fan_out_log();
        let scheduled = TestExecution::new(&log, vec![connection_error(r#"[["b",1]]"#)]);

        let other = FaultDirective {
            forced_exception: Some(ForcedException {
                name: "requests.exceptions.ConnectTimeout".to_string(),
                metadata: Map::new(),
            }),
            ..connection_error(r#"[["b",1]]"#)
        };
        let prior = TestExecution::completed(&log, vec![other], &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(!outcomes_match(&scheduled, prior_entry));
    }

    #[test]
    fn forced_exception_subset_matches_a_propagated_exception() {
        let log = fan_out_log();
        let mut directive = connection_error(r#"[["b",1]]"#);
        directive.forced_exception = Some(ForcedException {
            name: "requests.exceptions.ConnectionError".to_string(),
            metadata: Map::new(),
        });
        let scheduled = TestExecution::new(&log, vec![directive]);

        // Previous run saw the same exception arise without injection.
        let mut observed = fan_out_log();
        observed[0].exception = Some(json!({
            "name": "requests.exceptions.ConnectionError",
            "metadata": {},
        }));
        let prior = TestExecution::completed(&observed, Vec::new(), &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(outcomes_match(&scheduled, prior_entry));
    }

    #[test]
    fn no_fault_scheduled_rejects_a_previously_injected_entry() {
        let log = fan_out_log();
        let clean = TestExecution::new(&log, Vec::new());
        let prior = TestExecution::completed(&log, vec![connection_error(r#"[["b",1]]"#)], &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(!outcomes_match(&clean, prior_entry));
    }

    #[test]
    fn no_fault_scheduled_subset_matches_a_clean_prior_entry() {
        let log = fan_out_log();
        let clean = TestExecution::new(&log, Vec::new());

        let mut observed = fan_out_log();
        observed[0].return_value = Some(json!({"status_code": "200"}));
        let prior = TestExecution::completed(&observed, Vec::new(), &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(outcomes_match(&clean, prior_entry));
    }

    #[test]
    fn failure_metadata_return_value_subset_matches() {
        let log = fan_out_log();
        let directive = FaultDirective {
            execution_index: r#"[["b",1]]"#.to_string(),
            forced_exception: None,
            failure_metadata: Some(json!({"return_value": {"status_code": "503"}})),
            args: None,
        };
        let scheduled = TestExecution::new(&log, vec![directive.clone()]);

        let mut observed = fan_out_log();
        observed[0].return_value = Some(json!({"status_code": "503", "text": ""}));
        let prior = TestExecution::completed(&observed, vec![directive], &[]);

        let prior_entry = &prior.response_log.as_ref().unwrap()[0];
        assert!(outcomes_match(&scheduled, prior_entry));
    }

    #[test]
    fn execution_identical_to_a_completed_run_is_pruned() {
        let log = fan_out_log();
        let prior = TestExecution::completed(
            &with_outcomes(&log, &[0]),
            vec![connection_error(r#"[["b",1]]"#)],
            &[],
        );

        let scheduled = TestExecution::new(&log, vec![connection_error(r#"[["b",1]]"#)]);

        assert!(should_prune(&scheduled, &[prior]));
    }

    #[test]
    fn coarser_return_fault_is_pruned_by_a_finer_prior_run() {
        let log = fan_out_log();

        // A previous run forced a full 503 response at B and recorded it.
        let finer = FaultDirective {
            execution_index: r#"[["b",1]]"#.to_string(),
            forced_exception: None,
            failure_metadata: Some(json!({"return_value": {"status_code": "503", "text": ""}})),
            args: None,
        };
        let mut observed = fan_out_log();
        observed[0].return_value = Some(json!({"status_code": "503", "text": ""}));
        observed[1].return_value = Some(json!({"status_code": "200"}));
        let prior = TestExecution::completed(&observed, vec![finer], &[]);

        // Scheduling just the status code is already implied by that run.
        let coarser = FaultDirective {
            execution_index: r#"[["b",1]]"#.to_string(),
            forced_exception: None,
            failure_metadata: Some(json!({"return_value": {"status_code": "503"}})),
            args: None,
        };
        let scheduled = TestExecution::new(&log, vec![coarser]);

        assert_ne!(scheduled, prior);
        assert!(should_prune(&scheduled, &[prior]));
    }

    #[test_log::test]
    fn fan_out_double_fault_is_not_witnessed_by_the_single_fault_runs() {
        let log = fan_out_log();

        // Both calls are root-caused, so one prior run must witness both
        // faults at once; the single-fault runs each witness only one.
        let clean = TestExecution::completed(&with_outcomes(&log, &[]), Vec::new(), &[]);
        let fail_b = TestExecution::completed(
            &with_outcomes(&log, &[0]),
            vec![connection_error(r#"[["b",1]]"#)],
            &[],
        );
        let fail_c = TestExecution::completed(
            &with_outcomes(&log, &[1]),
            vec![connection_error(r#"[["c",1]]"#)],
            &[],
        );
        let ran = vec![clean, fail_b, fail_c];

        let both = TestExecution::new(
            &log,
            vec![
                connection_error(r#"[["b",1]]"#),
                connection_error(r#"[["c",1]]"#),
            ],
        );

        assert!(!should_prune(&both, &ran));
    }

    #[test]
    fn nothing_prunes_against_an_empty_history() {
        let execution = TestExecution::new(&fan_out_log(), Vec::new());
        assert!(!should_prune(&execution, &[]));
    }

    #[test]
    fn unseen_fault_is_not_pruned() {
        let log = fan_out_log();
        let clean = TestExecution::completed(&with_outcomes(&log, &[]), Vec::new(), &[]);

        let fail_b = TestExecution::new(&log, vec![connection_error(r#"[["b",1]]"#)]);

        assert!(!should_prune(&fail_b, &[clean]));
    }

    /// Copy `log`, marking the entries at `injected` positions with the
    /// injected connection error and the rest with a clean 200.
    fn with_outcomes(log: &[RequestLogEntry], injected: &[usize]) -> Vec<RequestLogEntry> {
        log.iter()
            .enumerate()
            .map(|(position, entry)| {
                let mut entry = entry.clone();
                if injected.contains(&position) {
                    entry.exception = Some(json!({
                        "name": "requests.exceptions.ConnectionError",
                        "metadata": {},
                    }));
                } else {
                    entry.return_value = Some(json!({"status_code": "200"}));
                }
                entry
            })
            .collect()
    }
}
