//! Control-plane HTTP service.
//!
//! Thin axum handlers over the shared [`Coordinator`]; every handler does
//! its work inside the coordinator's short critical sections and returns
//! JSON. Malformed bodies and unknown ids are 4xx and leave state
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Json;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info};

use filibuster_types::{RequestLogEntry, UpdateRequest};

use crate::coordinator::{CallError, Coordinator};
use crate::error::EngineError;

pub const CREATE_ENDPOINT: &str = "/filibuster/create";
pub const UPDATE_ENDPOINT: &str = "/filibuster/update";
pub const NEW_TEST_EXECUTION_ENDPOINT: &str = "/filibuster/new-test-execution/{service_name}";
pub const FAULT_INJECTED_ENDPOINT: &str = "/filibuster/fault-injected";
pub const FAULT_INJECTED_SERVICE_ENDPOINT: &str = "/filibuster/fault-injected/service/{service_name}";
pub const FAULT_INJECTED_METHOD_ENDPOINT: &str = "/filibuster/fault-injected/method/{*method}";
pub const HAS_NEXT_ITERATION_ENDPOINT: &str = "/filibuster/has-next-iteration/{iteration}/{caller}";
pub const COMPLETE_ITERATION_ENDPOINT: &str =
    "/filibuster/complete-iteration/{iteration}/exception/{exception}";
pub const TEARDOWNS_COMPLETED_ENDPOINT: &str = "/teardowns-completed/{iteration}";
pub const HEALTH_CHECK_ENDPOINT: &str = "/health-check";
pub const TERMINATE_ENDPOINT: &str = "/terminate";

const CURRENT_EXECUTION_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route(CREATE_ENDPOINT, put(handle_create))
        .route(UPDATE_ENDPOINT, post(handle_update))
        .route(NEW_TEST_EXECUTION_ENDPOINT, get(handle_new_test_execution))
        .route(FAULT_INJECTED_ENDPOINT, get(handle_fault_injected))
        .route(
            FAULT_INJECTED_SERVICE_ENDPOINT,
            get(handle_fault_injected_service),
        )
        .route(
            FAULT_INJECTED_METHOD_ENDPOINT,
            get(handle_fault_injected_method),
        )
        .route(HAS_NEXT_ITERATION_ENDPOINT, get(handle_has_next_iteration))
        .route(COMPLETE_ITERATION_ENDPOINT, post(handle_complete_iteration))
        .route(
            TEARDOWNS_COMPLETED_ENDPOINT,
            get(handle_teardowns_completed),
        )
        .route(HEALTH_CHECK_ENDPOINT, get(handle_health_check))
        .route(TERMINATE_ENDPOINT, get(handle_terminate))
        .with_state(coordinator)
}

/// Bind the control plane on `port`.
pub async fn bind(port: u16) -> Result<TcpListener, EngineError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| EngineError::Bind { port, source })?;
    info!(port, "control plane listening");
    Ok(listener)
}

/// Serve the control plane until the task is aborted.
pub async fn serve(coordinator: Arc<Coordinator>, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, build_router(coordinator)).await
}

fn client_error(error: &CallError) -> Response {
    let status = match error {
        CallError::MissingExecutionIndex => StatusCode::BAD_REQUEST,
        CallError::UnknownGeneratedId(_) => StatusCode::NOT_FOUND,
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

async fn handle_index() -> Json<Value> {
    Json(json!({
        "uri": "/",
        "subresource_uris": {
            "create": "filibuster/create",
            "update": "filibuster/update",
        }
    }))
}

async fn handle_create(
    State(coordinator): State<Arc<Coordinator>>,
    Json(entry): Json<RequestLogEntry>,
) -> Response {
    debug!(source = %entry.source_service_name, "create called");
    match coordinator.register_call(entry) {
        Ok(payload) => {
            debug!(%payload, "create returning");
            Json(payload).into_response()
        }
        Err(error) => client_error(&error),
    }
}

async fn handle_update(
    State(coordinator): State<Arc<Coordinator>>,
    Json(update): Json<UpdateRequest>,
) -> Response {
    debug!(generated_id = update.generated_id.0, "update called");
    match coordinator.merge_update(update) {
        Ok(()) => Json(json!({})).into_response(),
        Err(error) => client_error(&error),
    }
}

async fn handle_new_test_execution(
    State(coordinator): State<Arc<Coordinator>>,
    Path(service_name): Path<String>,
) -> Json<Value> {
    let new_test_execution = coordinator.begin_new_test_execution(&service_name);
    Json(json!({"new-test-execution": new_test_execution}))
}

async fn handle_fault_injected(State(coordinator): State<Arc<Coordinator>>) -> Json<Value> {
    Json(json!({"result": coordinator.fault_injected()}))
}

async fn handle_fault_injected_service(
    State(coordinator): State<Arc<Coordinator>>,
    Path(service_name): Path<String>,
) -> Json<Value> {
    Json(json!({"result": coordinator.fault_injected_for_service(&service_name)}))
}

async fn handle_fault_injected_method(
    State(coordinator): State<Arc<Coordinator>>,
    Path(method): Path<String>,
) -> Json<Value> {
    Json(json!({"result": coordinator.fault_injected_for_method(&method)}))
}

/// Whether the iteration about to start is a real test. In server-only
/// mode the external harness calls this between iterations and blocks
/// until the orchestrator has swapped the next execution in.
async fn handle_has_next_iteration(
    State(coordinator): State<Arc<Coordinator>>,
    Path((iteration, caller)): Path<(String, String)>,
) -> Json<Value> {
    debug!(%iteration, %caller, "has-next-iteration called");

    if coordinator.has_current_execution() {
        return Json(json!({"has-next-iteration": true}));
    }

    if coordinator.scheduled_remaining() > 0 {
        while coordinator.server_only() && !coordinator.has_current_execution() {
            tokio::time::sleep(CURRENT_EXECUTION_POLL_INTERVAL).await;
        }
        return Json(json!({"has-next-iteration": true}));
    }

    Json(json!({"has-next-iteration": false}))
}

async fn handle_complete_iteration(
    State(coordinator): State<Arc<Coordinator>>,
    Path((iteration, exception)): Path<(String, String)>,
) -> Json<Value> {
    let failed = exception != "0";
    info!(%iteration, failed, "external harness completed iteration");
    coordinator.signal_iteration_complete(failed);
    Json(json!({}))
}

async fn handle_teardowns_completed(
    State(coordinator): State<Arc<Coordinator>>,
    Path(iteration): Path<String>,
) -> Json<Value> {
    debug!(%iteration, "teardowns completed");
    coordinator.signal_teardown_completed();
    Json(json!({}))
}

async fn handle_health_check() -> Json<Value> {
    Json(json!({"status": "OK"}))
}

async fn handle_terminate(State(coordinator): State<Arc<Coordinator>>) -> Json<Value> {
    info!("terminating server process");
    coordinator.request_termination();
    Json(json!({}))
}
