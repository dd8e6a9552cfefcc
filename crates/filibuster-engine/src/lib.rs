pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod runner;

use std::sync::Arc;

use filibuster_core::{Counterexample, FaultCatalog};

pub use config::EngineConfig;
pub use coordinator::{CallError, Coordinator};
pub use error::EngineError;
pub use orchestrator::{Orchestrator, RunOutcome};
pub use runner::{ShellCommand, TestCommand};

/// Wire the full engine together and drive one orchestration run: load
/// the catalog (and counterexample, when replaying), start the control
/// plane on a background task, and hand the loop to the orchestrator.
pub async fn run(config: EngineConfig) -> Result<RunOutcome, EngineError> {
    let catalog = FaultCatalog::load(&config.analysis_file)?;
    let replay = match &config.counterexample_file {
        Some(path) => Some(Counterexample::load(path)?),
        None => None,
    };

    let coordinator = Arc::new(
        Coordinator::new(catalog)
            .with_suppress_combinations(config.suppress_combinations)
            .with_server_only(config.functional_test.is_none())
            .with_replay_mode(replay.is_some())
            .with_failure_percentage(replay.as_ref().and_then(|c| c.failure_percentage)),
    );

    let listener = http::bind(config.port).await?;
    let server = tokio::spawn(http::serve(Arc::clone(&coordinator), listener));

    let command: Option<Arc<dyn TestCommand>> = config
        .functional_test
        .as_deref()
        .map(|line| Arc::new(ShellCommand::new(line)) as Arc<dyn TestCommand>);

    let orchestrator = Orchestrator::new(Arc::clone(&coordinator), config, command, replay);
    let outcome = orchestrator.run().await;

    server.abort();
    outcome
}
