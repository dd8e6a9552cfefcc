use filibuster_core::{CatalogError, CounterexampleError};

/// Engine-level failures. Everything here aborts the orchestration run;
/// failing *tests* are not errors (finding one is the point) and travel
/// through `RunOutcome` instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("setup script failed with exit code {code}; fix it before continuing")]
    SetupScriptFailed { code: i32 },
    #[error("teardown script failed with exit code {code}; fix it before continuing")]
    TeardownScriptFailed { code: i32 },
    #[error("initial fault-free execution of '{command}' failed; not injecting faults")]
    InitialExecutionFailed { command: String },
    #[error("failed to spawn '{command}'")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind control plane on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Counterexample(#[from] CounterexampleError),
}
