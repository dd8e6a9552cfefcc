//! Header names instrumented services exchange on propagated calls.
//!
//! On each outbound call a service merges the incoming vector clock into
//! its local one, increments its own entry, pushes the call-site hash onto
//! its execution index, and forwards the updated values under these
//! headers; the receiving instrumentation reads them back to report
//! `request_received`.

/// Correlates all callbacks belonging to one in-flight request.
pub const REQUEST_ID: &str = "X-Filibuster-Request-Id";

/// The id the coordinator assigned to the intercepted call at `/create`.
pub const GENERATED_ID: &str = "X-Filibuster-Generated-Id";

/// The caller's vector clock after incrementing for this call.
pub const VCLOCK: &str = "X-Filibuster-VClock";

/// The vector clock of the parent request that caused this call.
pub const ORIGIN_VCLOCK: &str = "X-Filibuster-Origin-VClock";

/// The caller's serialized execution index for this call.
pub const EXECUTION_INDEX: &str = "X-Filibuster-Execution-Index";

/// Seconds the receiver should stall before responding, for injected
/// timeout faults that let the call proceed.
pub const FORCED_SLEEP: &str = "X-Filibuster-Forced-Sleep";
