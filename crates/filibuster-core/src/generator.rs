use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use filibuster_types::{
    FaultDirective, ForcedException, InstrumentationType, LoggedCall, RequestLogEntry,
    TestExecution,
};

use crate::catalog::FaultCatalog;

/// Enumerate the candidate test executions a newly observed call gives
/// rise to.
///
/// Called when a call is seen for the first time in the current execution,
/// at `invocation` (outbound, exceptions apply) or `request_received`
/// (inbound at the target, errors apply). Faults branch only at the
/// frontier: a call that is not the deepest entry of the log sits on a path
/// some earlier execution already discovered, and its alternatives were
/// enumerated then.
///
/// The returned batch is deduplicated internally and every candidate shares
/// one projected log; the caller still applies the scheduler's
/// `should_schedule` filter before pushing.
pub fn enumerate_candidates(
    generated_id: u64,
    instrumentation_type: InstrumentationType,
    log: &[RequestLogEntry],
    failures: &[FaultDirective],
    catalog: &FaultCatalog,
) -> Vec<TestExecution> {
    let Some(request) = log.iter().find(|entry| entry.generated_id == generated_id) else {
        warn!(generated_id, "no log entry for observed call; nothing to schedule");
        return Vec::new();
    };

    if log.last().map(|entry| entry.generated_id) != Some(request.generated_id) {
        debug!(
            generated_id,
            "call is a prefix of an already-discovered path; not branching"
        );
        return Vec::new();
    }

    if failures.iter().any(|failure| failure.targets(request)) {
        debug!(generated_id, "call is already scheduled to fail; not branching");
        return Vec::new();
    }

    let Some(execution_index) = request.execution_index.clone() else {
        warn!(generated_id, "call has no execution index; cannot schedule faults");
        return Vec::new();
    };

    let callsite = format!("{}.{}", request.module, request.method);
    let projected = TestExecution::project_log(log);
    let mut candidates: Vec<TestExecution> = Vec::new();

    for module in catalog.matching_modules(&callsite) {
        match instrumentation_type {
            InstrumentationType::Invocation => {
                for exception in &module.exceptions {
                    if !exception.restriction_satisfied(&request.metadata) {
                        continue;
                    }
                    let Some(metadata) = exception.expand_metadata(&request.metadata) else {
                        continue;
                    };

                    debug!(
                        module = %module.id,
                        exception = %exception.name,
                        %execution_index,
                        "scheduling forced exception"
                    );

                    let directive = FaultDirective {
                        execution_index: execution_index.clone(),
                        forced_exception: Some(ForcedException {
                            name: exception.name.clone(),
                            metadata,
                        }),
                        failure_metadata: None,
                        args: Some(request.args.clone()),
                    };
                    push_candidate(&mut candidates, &projected, failures, directive);
                }
            }
            InstrumentationType::RequestReceived => {
                let Some(target) = request.target_service_name.as_deref() else {
                    warn!(
                        generated_id,
                        "request has no target service; it was made outside the system"
                    );
                    continue;
                };

                for error in &module.errors {
                    if !error.matches_service(target) {
                        continue;
                    }
                    for error_type in &error.types {
                        debug!(
                            module = %module.id,
                            target,
                            %execution_index,
                            "scheduling injected error"
                        );

                        let directive = FaultDirective {
                            execution_index: execution_index.clone(),
                            forced_exception: None,
                            failure_metadata: Some(error_type.body.clone()),
                            args: Some(request.args.clone()),
                        };
                        push_candidate(&mut candidates, &projected, failures, directive);
                    }
                }
            }
            InstrumentationType::InvocationComplete => {}
        }
    }

    candidates
}

/// Extend the running failure set with one new directive (kept sorted by
/// execution index) and add the resulting execution to the batch if it is
/// not already in it.
fn push_candidate(
    candidates: &mut Vec<TestExecution>,
    projected: &Arc<Vec<LoggedCall>>,
    failures: &[FaultDirective],
    directive: FaultDirective,
) {
    let mut new_failures = failures.to_vec();
    new_failures.push(directive);
    new_failures.sort_by(|a, b| a.execution_index.cmp(&b.execution_index));

    let candidate = TestExecution::with_failures(Arc::clone(projected), new_failures);
    if !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// Directive metadata for `/create` responses: the fields the client
/// instrumentation acts on when a request is scheduled to fail.
pub fn directive_response_fields(directive: &FaultDirective) -> Vec<(&'static str, Value)> {
    let mut fields = Vec::new();
    if let Some(forced_exception) = &directive.forced_exception {
        if let Ok(value) = serde_json::to_value(forced_exception) {
            fields.push(("forced_exception", value));
        }
    }
    if let Some(failure_metadata) = &directive.failure_metadata {
        fields.push(("failure_metadata", failure_metadata.clone()));
    }
    fields
}
