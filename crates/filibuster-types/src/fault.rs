use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::request::RequestLogEntry;

/// The exception a directive forces at a call site.
///
/// `name` is the language-level exception name raised by the client
/// instrumentation; `metadata` carries the knobs it honors (`code`,
/// `sleep`, `abort`, ...), already expanded from any catalog expressions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForcedException {
    pub name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The failure projection of a request: exactly the keys a scheduled fault
/// is identified by. A test execution's `failures` is a list of these,
/// sorted by execution index.
///
/// Exactly one of `forced_exception` (invocation faults) and
/// `failure_metadata` (request-received faults, `{return_value}` or
/// `{exception}` shaped) is set by the schedule generator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultDirective {
    pub execution_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_exception: Option<ForcedException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl FaultDirective {
    /// Does this directive target `entry`'s execution index?
    pub fn targets(&self, entry: &RequestLogEntry) -> bool {
        entry
            .execution_index
            .as_deref()
            .is_some_and(|index| index == self.execution_index)
    }
}

/// Coarse classification of a catalog fault.
///
/// The catalog names faults with language-level strings; the wire exchange
/// stays string-based. This tag is derived once at catalog load so that
/// scheduling and reporting can branch on fault shape without re-parsing
/// names at every call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// An altered HTTP response carrying this status code.
    HttpStatus(u16),
    /// An exception carrying a gRPC status code in its metadata.
    GrpcStatus(String),
    /// Any other named exception, raised by name in the client runtime.
    Custom(String),
}

impl FaultKind {
    /// Classify an exception template from its name and metadata.
    pub fn of_exception(name: &str, metadata: &Map<String, Value>) -> Self {
        match metadata.get("code").and_then(Value::as_str) {
            Some(code) => Self::GrpcStatus(code.to_string()),
            None => Self::Custom(name.to_string()),
        }
    }

    /// Classify an error template from its `types` entry.
    pub fn of_error_type(error_type: &Value) -> Self {
        if let Some(status_code) = error_type
            .get("return_value")
            .and_then(|rv| rv.get("status_code"))
        {
            let parsed = match status_code {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse::<u64>().ok(),
                _ => None,
            };
            if let Some(code) = parsed {
                return Self::HttpStatus(code as u16);
            }
        }

        if let Some(code) = error_type
            .get("exception")
            .and_then(|e| e.get("metadata"))
            .and_then(|m| m.get("code"))
            .and_then(Value::as_str)
        {
            return Self::GrpcStatus(code.to_string());
        }

        Self::Custom("unclassified".to_string())
    }
}
