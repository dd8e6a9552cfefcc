use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::fault::{FaultDirective, ForcedException};
use crate::request::RequestLogEntry;
use crate::vclock::VectorClock;

/// Target label for calls that never resolved to an instrumented service.
pub const EXTERNAL_SERVICE: &str = "external";

/// The comparable projection of a request-log entry.
///
/// Exactly the keys two executions are compared on; everything the runtime
/// merges in later (targets, outcomes, timestamps) is excluded so that a
/// scheduled execution and its completed twin still compare equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedCall {
    pub generated_id: u64,
    pub module: String,
    pub method: String,
    pub args: Value,
    pub kwargs: Value,
    pub callsite_file: String,
    pub callsite_line: String,
    pub full_traceback: String,
    pub metadata: Map<String, Value>,
    pub source_service_name: String,
    pub vclock: Option<VectorClock>,
    pub origin_vclock: Option<VectorClock>,
    pub execution_index: Option<String>,
}

impl From<&RequestLogEntry> for LoggedCall {
    fn from(entry: &RequestLogEntry) -> Self {
        Self {
            generated_id: entry.generated_id,
            module: entry.module.clone(),
            method: entry.method.clone(),
            args: entry.args.clone(),
            kwargs: entry.kwargs.clone(),
            callsite_file: entry.callsite_file.clone(),
            callsite_line: entry.callsite_line.clone(),
            full_traceback: entry.full_traceback.clone(),
            metadata: entry.metadata.clone(),
            source_service_name: entry.source_service_name.clone(),
            vclock: entry.vclock.clone(),
            origin_vclock: entry.origin_vclock.clone(),
            execution_index: entry.execution_index.clone(),
        }
    }
}

/// The completed view of one call: the comparable projection plus the
/// resolved target and the observed (or injected) outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseLogEntry {
    pub callsite_line: String,
    pub callsite_file: String,
    pub execution_index: Option<String>,
    pub full_traceback: String,
    pub module: String,
    pub method: String,
    pub args: Value,
    pub kwargs: Value,
    pub metadata: Map<String, Value>,
    pub vclock: Option<VectorClock>,
    pub origin_vclock: Option<VectorClock>,
    pub source_service_name: String,
    pub target_service_name: String,
    pub generated_id: u64,
    pub return_value: Option<Value>,
    pub exception: Option<Value>,
    pub fault_injection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_exception: Option<ForcedException>,
}

/// One schedule of forced faults plus the request log that produced it.
///
/// A value object: equality considers `log` and `failures` only, so a
/// scheduled execution equals the completed record of running it.
/// `response_log` exists iff the execution has been run to completion, and
/// records are immutable once appended to the orchestrator's history.
///
/// The projected log sits behind an `Arc`: scheduling N candidates from one
/// observed log shares a single projection instead of deep-copying it N
/// times.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestExecution {
    pub log: Arc<Vec<LoggedCall>>,
    pub failures: Vec<FaultDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_log: Option<Vec<ResponseLogEntry>>,
}

impl PartialEq for TestExecution {
    fn eq(&self, other: &Self) -> bool {
        self.log == other.log && self.failures == other.failures
    }
}

impl TestExecution {
    /// A scheduled (not yet run) execution over a raw request log.
    pub fn new(log: &[RequestLogEntry], failures: Vec<FaultDirective>) -> Self {
        Self {
            log: Self::project_log(log),
            failures,
            response_log: None,
        }
    }

    /// A scheduled execution sharing an already-projected log.
    pub fn with_failures(log: Arc<Vec<LoggedCall>>, failures: Vec<FaultDirective>) -> Self {
        Self {
            log,
            failures,
            response_log: None,
        }
    }

    /// Project a raw log once, for sharing across candidates.
    pub fn project_log(log: &[RequestLogEntry]) -> Arc<Vec<LoggedCall>> {
        Arc::new(log.iter().map(LoggedCall::from).collect())
    }

    /// The completed record of a finished execution.
    ///
    /// Builds the response log: per entry, resolve the target service name
    /// (unknown targets are retconned from `retcon` — prior completed
    /// executions that observed the same call — and fall back to
    /// [`EXTERNAL_SERVICE`]), mark whether the outcome was injected, and
    /// carry the matching directive's fields alongside the observed
    /// outcome.
    pub fn completed(
        log: &[RequestLogEntry],
        failures: Vec<FaultDirective>,
        retcon: &[TestExecution],
    ) -> Self {
        let response_log = log
            .iter()
            .map(|entry| {
                let target_service_name = entry
                    .target_service_name
                    .clone()
                    .or_else(|| retcon_target(entry, retcon))
                    .unwrap_or_else(|| EXTERNAL_SERVICE.to_string());

                let matched = failures.iter().find(|failure| failure.targets(entry));

                ResponseLogEntry {
                    callsite_line: entry.callsite_line.clone(),
                    callsite_file: entry.callsite_file.clone(),
                    execution_index: entry.execution_index.clone(),
                    full_traceback: entry.full_traceback.clone(),
                    module: entry.module.clone(),
                    method: entry.method.clone(),
                    args: entry.args.clone(),
                    kwargs: entry.kwargs.clone(),
                    metadata: entry.metadata.clone(),
                    vclock: entry.vclock.clone(),
                    origin_vclock: entry.origin_vclock.clone(),
                    source_service_name: entry.source_service_name.clone(),
                    target_service_name,
                    generated_id: entry.generated_id,
                    return_value: entry.return_value.clone(),
                    exception: entry.exception.clone(),
                    fault_injection: matched.is_some(),
                    failure_metadata: matched.and_then(|f| f.failure_metadata.clone()),
                    forced_exception: matched.and_then(|f| f.forced_exception.clone()),
                }
            })
            .collect();

        Self {
            log: Self::project_log(log),
            failures,
            response_log: Some(response_log),
        }
    }

    /// Hex SHA-256 over the canonical JSON of `(log, failures)` — the same
    /// fields equality is defined over. Each field is length-prefixed to
    /// prevent concatenation collisions.
    pub fn content_hash(&self) -> String {
        let log_bytes =
            serde_json::to_vec(&*self.log).expect("projected log serializes infallibly");
        let failure_bytes =
            serde_json::to_vec(&self.failures).expect("failures serialize infallibly");

        let mut hasher = Sha256::new();
        hasher.update((log_bytes.len() as u32).to_le_bytes());
        hasher.update(&log_bytes);
        hasher.update((failure_bytes.len() as u32).to_le_bytes());
        hasher.update(&failure_bytes);

        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Does any response-log entry at one of this execution's failure
    /// indexes satisfy `predicate`? Used by the fault-injected queries.
    pub fn any_injected_response<F>(&self, predicate: F) -> bool
    where
        F: Fn(&ResponseLogEntry) -> bool,
    {
        let Some(response_log) = &self.response_log else {
            return false;
        };
        self.failures.iter().any(|failure| {
            response_log.iter().any(|entry| {
                entry.execution_index.as_deref() == Some(failure.execution_index.as_str())
                    && predicate(entry)
            })
        })
    }
}

/// Scan prior completed executions for the same call and copy its resolved
/// target. A call is "the same" when module, method, args, kwargs,
/// traceback digest, and execution index all agree.
fn retcon_target(entry: &RequestLogEntry, retcon: &[TestExecution]) -> Option<String> {
    for prior in retcon {
        let Some(response_log) = &prior.response_log else {
            continue;
        };
        for resolved in response_log {
            if same_call(entry, resolved) {
                return Some(resolved.target_service_name.clone());
            }
        }
    }
    None
}

fn same_call(entry: &RequestLogEntry, resolved: &ResponseLogEntry) -> bool {
    entry.module == resolved.module
        && entry.method == resolved.method
        && entry.args == resolved.args
        && entry.kwargs == resolved.kwargs
        && entry.full_traceback == resolved.full_traceback
        && entry.execution_index == resolved.execution_index
}
