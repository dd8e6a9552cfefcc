use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::vclock::VectorClock;

/// Which instrumentation hook produced a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentationType {
    /// Outbound call intercepted at the caller, reported via `/create`.
    Invocation,
    /// Inbound request observed at the target service, reported via
    /// `/update`.
    RequestReceived,
    /// Outbound call finished at the caller, reported via `/update`.
    InvocationComplete,
}

/// One intercepted call, as recorded in the per-execution request log.
///
/// `/create` supplies everything except `generated_id`, which the
/// coordinator assigns on append, and the outcome fields, which later
/// `/update` callbacks merge in. `received_at` is wall-clock for debugging
/// only and never takes part in comparisons.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestLogEntry {
    #[serde(default)]
    pub generated_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrumentation_type: Option<InstrumentationType>,
    pub source_service_name: String,
    /// Unknown at `/create` time for dynamically bound targets; filled in
    /// by the target's `request_received` update when it is instrumented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_name: Option<String>,
    pub module: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub kwargs: Value,
    /// Free-form call metadata; `metadata.timeout` is recognized by catalog
    /// restrictions and `@expr` expansion.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub callsite_file: String,
    #[serde(default)]
    pub callsite_line: String,
    /// Digest of the call-site traceback, computed by the instrumentation.
    #[serde(default)]
    pub full_traceback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vclock: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_vclock: Option<VectorClock>,
    /// Serialized execution index. Required on `/create`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_index: Option<String>,
    /// Merged on completion, e.g. `{status_code, class, text}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    /// Merged on completion, `{name, metadata{code, sleep, abort}}` shaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// A `generated_id` as it appears on the wire.
///
/// Some client runtimes echo the id back as a decimal string rather than a
/// JSON number; both parse to the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeneratedId(pub u64);

impl Serialize for GeneratedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for GeneratedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(Self(id)),
            Raw::Text(text) => text
                .trim()
                .parse::<u64>()
                .map(Self)
                .map_err(|_| D::Error::custom("generated_id is not a non-negative integer")),
        }
    }
}

/// `/update` payload: identifies a log entry by `generated_id` and merges
/// every present field into it. Absent fields leave the entry untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub generated_id: GeneratedId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrumentation_type: Option<InstrumentationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vclock: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
}

impl RequestLogEntry {
    /// Merge an update's present fields into this entry.
    pub fn merge_update(&mut self, update: &UpdateRequest) {
        if let Some(instrumentation_type) = update.instrumentation_type {
            self.instrumentation_type = Some(instrumentation_type);
        }
        if let Some(target) = &update.target_service_name {
            self.target_service_name = Some(target.clone());
        }
        if let Some(execution_index) = &update.execution_index {
            self.execution_index = Some(execution_index.clone());
        }
        if let Some(vclock) = &update.vclock {
            self.vclock = Some(vclock.clone());
        }
        if let Some(return_value) = &update.return_value {
            self.return_value = Some(return_value.clone());
        }
        if let Some(exception) = &update.exception {
            self.exception = Some(exception.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn create_body_parses_without_generated_id() {
        let entry: RequestLogEntry = serde_json::from_value(json!({
            "instrumentation_type": "invocation",
            "source_service_name": "api",
            "module": "requests",
            "method": "get",
            "args": ["http://users:5000/users/1"],
            "kwargs": {},
            "metadata": {"timeout": 10},
            "callsite_file": "app.py",
            "callsite_line": "40",
            "full_traceback": "3f2a",
            "vclock": {"api": 1},
            "origin_vclock": {},
            "execution_index": "[[\"3f2a\",1]]",
        }))
        .unwrap();

        assert_eq!(entry.generated_id, 0);
        assert_eq!(
            entry.instrumentation_type,
            Some(InstrumentationType::Invocation)
        );
        assert_eq!(entry.metadata.get("timeout"), Some(&json!(10)));
        assert!(entry.target_service_name.is_none());
        assert!(entry.return_value.is_none());
    }

    #[test]
    fn generated_id_accepts_number_and_numeric_string() {
        let from_number: GeneratedId = serde_json::from_value(json!(3)).unwrap();
        let from_text: GeneratedId = serde_json::from_value(json!("3")).unwrap();

        assert_eq!(from_number, GeneratedId(3));
        assert_eq!(from_text, GeneratedId(3));
        assert!(serde_json::from_value::<GeneratedId>(json!("-1")).is_err());
        assert!(serde_json::from_value::<GeneratedId>(json!("three")).is_err());
    }

    #[test]
    fn merge_update_overwrites_present_fields_only() {
        let mut entry: RequestLogEntry = serde_json::from_value(json!({
            "source_service_name": "api",
            "module": "requests",
            "method": "get",
            "execution_index": "[[\"3f2a\",1]]",
        }))
        .unwrap();

        let update: UpdateRequest = serde_json::from_value(json!({
            "generated_id": "0",
            "instrumentation_type": "request_received",
            "target_service_name": "users",
        }))
        .unwrap();
        entry.merge_update(&update);

        assert_eq!(entry.target_service_name.as_deref(), Some("users"));
        assert_eq!(
            entry.instrumentation_type,
            Some(InstrumentationType::RequestReceived)
        );
        assert_eq!(entry.execution_index.as_deref(), Some(r#"[["3f2a",1]]"#));

        let completion: UpdateRequest = serde_json::from_value(json!({
            "generated_id": 0,
            "return_value": {"status_code": "200"},
        }))
        .unwrap();
        entry.merge_update(&completion);

        assert_eq!(entry.return_value, Some(json!({"status_code": "200"})));
        assert_eq!(entry.target_service_name.as_deref(), Some("users"));
    }
}
