use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use serde_json::{Value, json};
use tracing::debug;

use filibuster_core::{FaultCatalog, ScheduleStack, enumerate_candidates, should_prune, should_schedule};
use filibuster_core::generator::directive_response_fields;
use filibuster_types::{
    FaultDirective, GeneratedId, InstrumentationType, LoggedCall, RequestLogEntry,
    ResponseLogEntry, ServerState, TestExecution, UpdateRequest,
};

/// Client-side errors on the control-plane callbacks. Reported as 4xx and
/// never mutate state.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("create payload is missing an execution index")]
    MissingExecutionIndex,
    #[error("generated_id {0} is out of range for the current execution")]
    UnknownGeneratedId(u64),
}

/// Everything the control-plane handlers and the orchestrator share about
/// one orchestration run.
///
/// Handlers close over this instead of process-wide globals. One mutex
/// guards the orchestration group (per-execution server state, the current
/// execution, its fault directives, the schedule stack, and the completed
/// history); lifecycle flags used by server-only mode are plain atomics.
/// Handlers hold the mutex only for the short log/schedule manipulations
/// and never across an await.
pub struct Coordinator {
    catalog: FaultCatalog,
    suppress_combinations: bool,
    /// Replaying a counterexample: take its failures verbatim, never
    /// generate new executions.
    replay_mode: bool,
    /// When replaying with a percentage, inject each matching fault only
    /// that fraction of the time.
    failure_percentage: Option<f64>,
    server_only: bool,
    inner: Mutex<Inner>,
    iteration_complete: AtomicBool,
    iteration_exit_code: AtomicI32,
    teardown_completed: AtomicBool,
    should_terminate: AtomicBool,
}

#[derive(Default)]
struct Inner {
    server_state: ServerState,
    current_test_execution: Option<TestExecution>,
    requests_to_fail: Vec<FaultDirective>,
    scheduled: ScheduleStack,
    ran: Vec<TestExecution>,
    pruned: usize,
}

impl Coordinator {
    pub fn new(catalog: FaultCatalog) -> Self {
        Self {
            catalog,
            suppress_combinations: false,
            replay_mode: false,
            failure_percentage: None,
            server_only: false,
            inner: Mutex::new(Inner::default()),
            iteration_complete: AtomicBool::new(false),
            iteration_exit_code: AtomicI32::new(0),
            teardown_completed: AtomicBool::new(false),
            should_terminate: AtomicBool::new(false),
        }
    }

    pub fn with_suppress_combinations(mut self, on: bool) -> Self {
        self.suppress_combinations = on;
        self
    }

    pub fn with_replay_mode(mut self, on: bool) -> Self {
        self.replay_mode = on;
        self
    }

    pub fn with_failure_percentage(mut self, percentage: Option<f64>) -> Self {
        self.failure_percentage = percentage;
        self
    }

    pub fn with_server_only(mut self, on: bool) -> Self {
        self.server_only = on;
        self
    }

    pub fn server_only(&self) -> bool {
        self.server_only
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a handler panicked; the state itself is
        // value-typed and safe to keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Control-plane operations ────────────────────────────────────────

    /// Handle `/create`: assign the next dense id, append the call to the
    /// log, answer with any fault directive targeting it, and branch new
    /// test executions when the call is new at the frontier.
    pub fn register_call(&self, entry: RequestLogEntry) -> Result<Value, CallError> {
        if entry.execution_index.is_none() {
            return Err(CallError::MissingExecutionIndex);
        }
        let instrumentation_type = entry.instrumentation_type;
        let execution_index = entry.execution_index.clone();

        let mut inner = self.lock();
        let inner = &mut *inner;

        let generated_id = inner.server_state.append(entry);

        let directive = inner
            .requests_to_fail
            .iter()
            .find(|failure| {
                Some(failure.execution_index.as_str()) == execution_index.as_deref()
            })
            .cloned()
            .filter(|_| self.sample_failure());

        let mut payload = json!({
            "generated_id": generated_id,
            "execution_index": execution_index,
        });
        if let Some(directive) = &directive {
            debug!(generated_id, "failing request");
            if let Value::Object(fields) = &mut payload {
                for (key, value) in directive_response_fields(directive) {
                    fields.insert(key.to_string(), value);
                }
            }
        }

        if instrumentation_type == Some(InstrumentationType::Invocation) {
            self.branch_locked(inner, generated_id, InstrumentationType::Invocation);
        }

        Ok(payload)
    }

    /// Handle `/update`: merge outcome fields into the identified entry;
    /// on `request_received`, branch new test executions if the call is
    /// new to the current execution's log.
    pub fn merge_update(&self, update: UpdateRequest) -> Result<(), CallError> {
        let GeneratedId(generated_id) = update.generated_id;

        let mut inner = self.lock();
        let inner = &mut *inner;

        let Some(entry) = inner.server_state.entry_mut(generated_id) else {
            return Err(CallError::UnknownGeneratedId(generated_id));
        };
        entry.merge_update(&update);

        if update.instrumentation_type == Some(InstrumentationType::RequestReceived) {
            self.branch_locked(inner, generated_id, InstrumentationType::RequestReceived);
        }

        Ok(())
    }

    /// Handle `/new-test-execution/{service}`.
    pub fn begin_new_test_execution(&self, service: &str) -> bool {
        self.lock().server_state.first_request_from(service)
    }

    /// Any forced failures in the current execution?
    pub fn fault_injected(&self) -> bool {
        self.lock()
            .current_test_execution
            .as_ref()
            .is_some_and(|execution| !execution.failures.is_empty())
    }

    pub fn fault_injected_for_service(&self, service: &str) -> bool {
        self.fault_injected_matching(|entry| entry.target_service_name == service)
    }

    pub fn fault_injected_for_method(&self, method: &str) -> bool {
        self.fault_injected_matching(|entry| entry.method == method)
    }

    /// Does some forced failure of the current execution resolve to a
    /// response-log entry satisfying `predicate`?
    ///
    /// The current execution rarely knows its targets (they are discovered
    /// at request receipt), so resolution scans prior executions' response
    /// logs — or the replayed counterexample's own, which carried them.
    fn fault_injected_matching(&self, predicate: impl Fn(&ResponseLogEntry) -> bool) -> bool {
        let inner = self.lock();
        let Some(current) = &inner.current_test_execution else {
            return false;
        };

        if self.replay_mode {
            return current.any_injected_response(&predicate);
        }

        inner.ran.iter().any(|prior| {
            let Some(response_log) = &prior.response_log else {
                return false;
            };
            current.failures.iter().any(|failure| {
                response_log.iter().any(|entry| {
                    entry.execution_index.as_deref() == Some(failure.execution_index.as_str())
                        && predicate(entry)
                })
            })
        })
    }

    /// Enumerate and enqueue the new test executions an observed call
    /// gives rise to. Skipped entirely when replaying, and for calls the
    /// current execution already observed when it was first scheduled.
    fn branch_locked(
        &self,
        inner: &mut Inner,
        generated_id: u64,
        instrumentation_type: InstrumentationType,
    ) {
        if self.replay_mode {
            return;
        }

        // A replayed `/create` appends a second entry under the same
        // execution index; branching from it would double-target that index.
        if let Some(index) = inner
            .server_state
            .entry(generated_id)
            .and_then(|entry| entry.execution_index.as_deref())
        {
            let duplicate = inner.server_state.service_request_log.iter().any(|earlier| {
                earlier.generated_id != generated_id
                    && earlier.execution_index.as_deref() == Some(index)
            });
            if duplicate {
                debug!(generated_id, "execution index already logged; not branching");
                return;
            }
        }

        if let (Some(current), Some(entry)) = (
            inner.current_test_execution.as_ref(),
            inner.server_state.entry(generated_id),
        ) {
            let projected = LoggedCall::from(entry);
            if current.log.iter().any(|call| call == &projected) {
                debug!(generated_id, "request already known to this execution; not branching");
                return;
            }
        }

        let candidates = enumerate_candidates(
            generated_id,
            instrumentation_type,
            &inner.server_state.service_request_log,
            &inner.requests_to_fail,
            &self.catalog,
        );

        let mut appended = 0;
        for candidate in candidates {
            if self.suppress_combinations && candidate.failures.len() != 1 {
                continue;
            }
            if !should_schedule(
                &candidate,
                &[],
                &inner.scheduled,
                inner.current_test_execution.as_ref(),
                &inner.ran,
            ) {
                continue;
            }
            inner.scheduled.push(candidate);
            appended += 1;
        }
        if appended > 0 {
            debug!(generated_id, appended, "scheduled additional test executions");
        }
    }

    fn sample_failure(&self) -> bool {
        match self.failure_percentage {
            None => true,
            Some(percentage) => rand::random::<f64>() * 100.0 < percentage,
        }
    }

    // ── Orchestrator-side iteration control ─────────────────────────────

    /// Install the next execution (or none, for the initial run) and reset
    /// the per-execution server state.
    pub fn begin_iteration(&self, next: Option<TestExecution>) {
        let mut inner = self.lock();
        inner.server_state = ServerState::new();
        inner.requests_to_fail = next
            .as_ref()
            .map(|execution| execution.failures.clone())
            .unwrap_or_default();
        inner.current_test_execution = next;
    }

    /// Build the completed record for the finished iteration, retconning
    /// unknown targets from everything ran so far, and append it to the
    /// immutable history.
    pub fn complete_iteration(&self) -> TestExecution {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let completed = TestExecution::completed(
            &inner.server_state.service_request_log,
            inner.requests_to_fail.clone(),
            &inner.ran,
        );
        inner.ran.push(completed.clone());
        completed
    }

    pub fn clear_current_execution(&self) {
        self.lock().current_test_execution = None;
    }

    pub fn has_current_execution(&self) -> bool {
        self.lock().current_test_execution.is_some()
    }

    pub fn push_scheduled(&self, execution: TestExecution) {
        self.lock().scheduled.push(execution);
    }

    pub fn pop_scheduled(&self) -> Option<TestExecution> {
        self.lock().scheduled.pop()
    }

    pub fn scheduled_remaining(&self) -> usize {
        self.lock().scheduled.len()
    }

    /// Is `next` subsumed by the completed history?
    pub fn is_subsumed(&self, next: &TestExecution) -> bool {
        should_prune(next, &self.lock().ran)
    }

    pub fn record_pruned(&self) {
        self.lock().pruned += 1;
    }

    pub fn pruned_count(&self) -> usize {
        self.lock().pruned
    }

    pub fn ran_count(&self) -> usize {
        self.lock().ran.len()
    }

    // ── Lifecycle flags (server-only mode) ──────────────────────────────

    /// External harness reports its iteration finished, with or without an
    /// exception.
    pub fn signal_iteration_complete(&self, failed: bool) {
        self.iteration_exit_code
            .store(if failed { 1 } else { 0 }, Ordering::SeqCst);
        self.iteration_complete.store(true, Ordering::SeqCst);
    }

    /// Consume a completed-iteration signal, if one is pending.
    pub fn take_iteration_complete(&self) -> Option<i32> {
        if self.iteration_complete.swap(false, Ordering::SeqCst) {
            Some(self.iteration_exit_code.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// External harness reports all after-each teardowns ran. Clears the
    /// current execution immediately so the next before-each observes the
    /// swap, then releases the orchestrator's barrier.
    pub fn signal_teardown_completed(&self) {
        self.clear_current_execution();
        self.teardown_completed.store(true, Ordering::SeqCst);
    }

    pub fn take_teardown_completed(&self) -> bool {
        self.teardown_completed.swap(false, Ordering::SeqCst)
    }

    pub fn request_termination(&self) {
        self.should_terminate.store(true, Ordering::SeqCst);
    }

    pub fn termination_requested(&self) -> bool {
        self.should_terminate.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::sync::Arc;

    use super::*;

    fn catalog() -> FaultCatalog {
        FaultCatalog::from_json_value(json!({
            "python.requests": {
                "pattern": "requests\\.(get|put|post|head|delete)",
                "exceptions": [{"name": "requests.exceptions.ConnectionError"}],
                "errors": [
                    {"service_name": "users", "types": [{"return_value": {"status_code": "503"}}]}
                ]
            }
        }))
        .unwrap()
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(catalog())
    }

    fn create_body(index: &str, vclock: Value) -> RequestLogEntry {
        serde_json::from_value(json!({
            "instrumentation_type": "invocation",
            "source_service_name": "api",
            "module": "requests",
            "method": "get",
            "args": ["http://users:5000/"],
            "kwargs": {},
            "metadata": {},
            "callsite_file": "app.py",
            "callsite_line": "40",
            "full_traceback": "3f2a",
            "vclock": vclock,
            "origin_vclock": {},
            "execution_index": index,
        }))
        .unwrap()
    }

    fn update_body(value: Value) -> UpdateRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn create_assigns_dense_ids_and_echoes_the_execution_index() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        let first = coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        let second = coordinator
            .register_call(create_body(r#"[["3f2a",2]]"#, json!({"api": 2})))
            .unwrap();

        assert_eq!(first["generated_id"], json!(0));
        assert_eq!(second["generated_id"], json!(1));
        assert_eq!(second["execution_index"], json!(r#"[["3f2a",2]]"#));
    }

    #[test]
    fn create_without_execution_index_is_rejected_without_mutation() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        let mut body = create_body(r#"[["3f2a",1]]"#, json!({"api": 1}));
        body.execution_index = None;

        assert_eq!(
            coordinator.register_call(body),
            Err(CallError::MissingExecutionIndex)
        );
        assert_eq!(coordinator.scheduled_remaining(), 0);
        let next = coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        assert_eq!(next["generated_id"], json!(0));
    }

    #[test]
    fn initial_run_branches_one_execution_per_catalog_exception() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();

        assert_eq!(coordinator.scheduled_remaining(), 1);
    }

    #[test]
    fn resubmitted_create_produces_no_new_enqueues() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        assert_eq!(coordinator.scheduled_remaining(), 1);

        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        assert_eq!(coordinator.scheduled_remaining(), 1);
    }

    #[test_log::test]
    fn known_calls_do_not_branch_again() {
        let coordinator = coordinator();

        coordinator.begin_iteration(None);
        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        coordinator.complete_iteration();

        let next = coordinator.pop_scheduled().unwrap();
        coordinator.begin_iteration(Some(next));
        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();

        assert_eq!(coordinator.scheduled_remaining(), 0);
    }

    #[test]
    fn scheduled_execution_fails_its_target_request() {
        let coordinator = coordinator();

        coordinator.begin_iteration(None);
        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        coordinator.complete_iteration();

        let next = coordinator.pop_scheduled().unwrap();
        coordinator.begin_iteration(Some(next));
        let response = coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();

        assert_eq!(
            response["forced_exception"]["name"],
            json!("requests.exceptions.ConnectionError")
        );
        assert!(coordinator.fault_injected());
    }

    #[test]
    fn request_received_branches_errors_once() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        assert_eq!(coordinator.scheduled_remaining(), 1);

        coordinator
            .merge_update(update_body(json!({
                "generated_id": "0",
                "instrumentation_type": "request_received",
                "target_service_name": "users",
            })))
            .unwrap();

        // One exception plus one error type.
        assert_eq!(coordinator.scheduled_remaining(), 2);
    }

    #[test]
    fn update_with_out_of_range_id_is_rejected() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        let result = coordinator.merge_update(update_body(json!({
            "generated_id": 7,
            "return_value": {"status_code": "200"},
        })));

        assert_eq!(result, Err(CallError::UnknownGeneratedId(7)));
    }

    #[test]
    fn new_test_execution_reports_each_service_once_per_iteration() {
        let coordinator = coordinator();
        coordinator.begin_iteration(None);

        assert!(coordinator.begin_new_test_execution("api"));
        assert!(!coordinator.begin_new_test_execution("api"));

        coordinator.begin_iteration(None);
        assert!(coordinator.begin_new_test_execution("api"));
    }

    #[test]
    fn fault_injected_for_service_resolves_through_prior_runs() {
        let coordinator = Arc::new(coordinator());

        // Initial run: the call's target is resolved by request_received.
        coordinator.begin_iteration(None);
        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();
        coordinator
            .merge_update(update_body(json!({
                "generated_id": 0,
                "instrumentation_type": "request_received",
                "target_service_name": "users",
            })))
            .unwrap();
        coordinator.complete_iteration();

        // Next execution forces a fault at that index; its own log never
        // learns the target (the request is aborted), so the query leans on
        // the initial run's response log.
        let next = coordinator.pop_scheduled().unwrap();
        coordinator.begin_iteration(Some(next));

        assert!(coordinator.fault_injected_for_service("users"));
        assert!(!coordinator.fault_injected_for_service("cart"));
        assert!(coordinator.fault_injected_for_method("get"));
        assert!(!coordinator.fault_injected_for_method("post"));
    }

    #[test]
    fn replay_mode_never_branches() {
        let coordinator = Coordinator::new(catalog()).with_replay_mode(true);
        coordinator.begin_iteration(None);

        coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();

        assert_eq!(coordinator.scheduled_remaining(), 0);
    }

    #[test]
    fn zero_failure_percentage_suppresses_injection() {
        let coordinator = Coordinator::new(catalog())
            .with_replay_mode(true)
            .with_failure_percentage(Some(0.0));

        let log = vec![create_body(r#"[["3f2a",1]]"#, json!({"api": 1}))];
        let execution = TestExecution::new(
            &log,
            vec![FaultDirective {
                execution_index: r#"[["3f2a",1]]"#.to_string(),
                forced_exception: Some(Default::default()),
                ..Default::default()
            }],
        );
        coordinator.begin_iteration(Some(execution));

        let response = coordinator
            .register_call(create_body(r#"[["3f2a",1]]"#, json!({"api": 1})))
            .unwrap();

        assert!(response.get("forced_exception").is_none());
    }

    #[test]
    fn lifecycle_flags_round_trip() {
        let coordinator = coordinator();

        assert!(coordinator.take_iteration_complete().is_none());
        coordinator.signal_iteration_complete(true);
        assert_eq!(coordinator.take_iteration_complete(), Some(1));
        assert!(coordinator.take_iteration_complete().is_none());

        coordinator.begin_iteration(Some(TestExecution::new(&[], Vec::new())));
        assert!(coordinator.has_current_execution());
        coordinator.signal_teardown_completed();
        assert!(!coordinator.has_current_execution());
        assert!(coordinator.take_teardown_completed());
        assert!(!coordinator.take_teardown_completed());

        assert!(!coordinator.termination_requested());
        coordinator.request_termination();
        assert!(coordinator.termination_requested());
    }
}
