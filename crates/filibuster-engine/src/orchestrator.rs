use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use filibuster_core::Counterexample;
use filibuster_types::TestExecution;

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::EngineError;
use crate::runner::{ScriptPhase, TestCommand, run_script};

/// Poll interval for the server-only lifecycle flags.
const FLAG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long to wait for an external harness to finish one iteration.
const EXTERNAL_ITERATION_TIMEOUT: Duration = Duration::from_secs(100);

/// How an orchestration run ended. Failing *tests* land here, not in
/// `EngineError`: discovering one is Filibuster doing its job.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every execution passed (or the run was bounded and nothing failed).
    AllPassed { ran: usize, pruned: usize },
    /// A failing execution was found and persisted for replay.
    CounterexampleWritten { path: PathBuf, ran: usize },
    /// The supplied counterexample made the test fail again.
    CounterexampleReproduced,
}

impl RunOutcome {
    /// Process exit code: 0 when everything passed, 1 when a failing
    /// execution was found or reproduced.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AllPassed { .. } => 0,
            Self::CounterexampleWritten { .. } | Self::CounterexampleReproduced => 1,
        }
    }
}

/// Drives the run: one initial fault-free execution, then drain the
/// schedule stack, pruning executions the completed history already
/// subsumes, until the stack is empty or a test fails.
pub struct Orchestrator {
    coordinator: Arc<Coordinator>,
    config: EngineConfig,
    command: Option<Arc<dyn TestCommand>>,
    replay: Option<Counterexample>,
}

impl Orchestrator {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config: EngineConfig,
        command: Option<Arc<dyn TestCommand>>,
        replay: Option<Counterexample>,
    ) -> Self {
        Self {
            coordinator,
            config,
            command,
            replay,
        }
    }

    pub async fn run(&self) -> Result<RunOutcome, EngineError> {
        let started = Instant::now();
        let mut iteration: u64 = 1;

        if let Some(counterexample) = &self.replay {
            // Replay mode: schedule exactly the persisted execution.
            let execution = counterexample.execution()?;
            info!("replaying counterexample");
            self.coordinator.push_scheduled(execution);
        } else {
            info!(
                command = %self.command_description(),
                "running the initial non-failing execution (test 1)"
            );
            self.coordinator.begin_iteration(None);
            let exit_code = self.run_iteration().await?;
            if exit_code != 0 || self.forced_failure_at(iteration) {
                return Err(EngineError::InitialExecutionFailed {
                    command: self.command_description(),
                });
            }
            self.coordinator.complete_iteration();
            info!("[done] initial non-failing execution (test 1)");
            self.wait_for_teardown().await;
        }

        if !self.config.only_initial_execution {
            while let Some(next) = self.coordinator.pop_scheduled() {
                iteration += 1;

                if let Some(max) = self.config.max_executions {
                    if iteration > max {
                        info!(max, "reached the configured execution bound");
                        break;
                    }
                }

                info!(
                    iteration,
                    pruned_so_far = self.coordinator.pruned_count(),
                    remaining = self.coordinator.scheduled_remaining(),
                    "running test"
                );
                describe_execution(&next, iteration);

                if self.replay.is_none()
                    && !self.config.disable_dynamic_reduction
                    && self.coordinator.is_subsumed(&next)
                {
                    info!(iteration, "outcome implied by prior executions; pruned");
                    self.coordinator.record_pruned();
                    continue;
                }

                self.coordinator.begin_iteration(Some(next));
                let exit_code = self.run_iteration().await?;
                let completed = self.coordinator.complete_iteration();

                if exit_code != 0 || self.forced_failure_at(iteration) {
                    if self.replay.is_some() {
                        error!("counterexample reproduced");
                        return Ok(RunOutcome::CounterexampleReproduced);
                    }

                    let path = self.config.counterexample_output.clone();
                    Counterexample::new(&self.command_description(), &completed)
                        .map_err(filibuster_core::CounterexampleError::Execution)?
                        .store(&path)?;
                    error!(path = %path.display(), "test failed; counterexample file written");
                    return Ok(RunOutcome::CounterexampleWritten {
                        path,
                        ran: self.coordinator.ran_count(),
                    });
                }

                self.wait_for_teardown().await;
                info!(iteration, "test completed");
            }
        }

        self.coordinator.clear_current_execution();

        let ran = self.coordinator.ran_count();
        let pruned = self.coordinator.pruned_count();
        info!(
            ran,
            pruned,
            total = ran + pruned,
            elapsed_seconds = started.elapsed().as_secs_f64(),
            "completed testing"
        );

        if self.coordinator.server_only() {
            self.wait_for_termination().await;
        }

        Ok(RunOutcome::AllPassed { ran, pruned })
    }

    /// One iteration: setup script, the functional test (or the external
    /// harness's completion signal), teardown script.
    async fn run_iteration(&self) -> Result<i32, EngineError> {
        if let Some(script) = &self.config.setup_script {
            run_script(script, ScriptPhase::Setup).await?;
        }

        let exit_code = match &self.command {
            Some(command) => command.run().await?,
            None => self.await_external_iteration().await,
        };

        if let Some(script) = &self.config.teardown_script {
            run_script(script, ScriptPhase::Teardown).await?;
        }

        Ok(exit_code)
    }

    /// Server-only mode: poll for the harness's `complete-iteration`
    /// signal. Timing out counts as a failed iteration.
    async fn await_external_iteration(&self) -> i32 {
        info!("waiting for external test to complete");
        let deadline = Instant::now() + EXTERNAL_ITERATION_TIMEOUT;

        while Instant::now() < deadline {
            if let Some(exit_code) = self.coordinator.take_iteration_complete() {
                return exit_code;
            }
            tokio::time::sleep(FLAG_POLL_INTERVAL).await;
        }

        error!("timed out waiting for the external harness; marking iteration failed");
        1
    }

    /// Server-only mode: block until the harness reports its after-each
    /// teardowns finished, so the next iteration's setup observes the swap.
    async fn wait_for_teardown(&self) {
        if !self.coordinator.server_only() {
            return;
        }
        debug!("waiting for teardown to complete");
        loop {
            if self.coordinator.take_teardown_completed() {
                return;
            }
            tokio::time::sleep(FLAG_POLL_INTERVAL).await;
        }
    }

    /// Server-only mode: idle after the drain until `/terminate` arrives.
    async fn wait_for_termination(&self) {
        info!("waiting for shutdown");
        loop {
            if self.coordinator.termination_requested() {
                return;
            }
            tokio::time::sleep(FLAG_POLL_INTERVAL).await;
        }
    }

    fn forced_failure_at(&self, iteration: u64) -> bool {
        self.config.forced_failure == Some(iteration)
    }

    fn command_description(&self) -> String {
        match &self.command {
            Some(command) => command.describe(),
            None => "<server-only>".to_string(),
        }
    }
}

/// Log what an execution is about to force, one line per directive.
fn describe_execution(execution: &TestExecution, iteration: u64) {
    if execution.failures.is_empty() {
        debug!(iteration, "no forced failures");
        return;
    }
    for failure in &execution.failures {
        match (&failure.forced_exception, &failure.failure_metadata) {
            (Some(exception), _) => debug!(
                iteration,
                execution_index = %failure.execution_index,
                exception = %exception.name,
                "will force exception"
            ),
            (None, Some(metadata)) => debug!(
                iteration,
                execution_index = %failure.execution_index,
                %metadata,
                "will force failure"
            ),
            (None, None) => warn!(
                iteration,
                execution_index = %failure.execution_index,
                "directive forces nothing"
            ),
        }
    }
}
