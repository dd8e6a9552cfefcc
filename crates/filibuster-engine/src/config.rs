use std::path::PathBuf;

/// Orchestrator configuration, typically parsed from the CLI.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Shell command line for the functional test. `None` selects
    /// server-only mode: an external harness drives iterations and signals
    /// completion over the control plane.
    pub functional_test: Option<String>,
    pub analysis_file: PathBuf,
    /// Replay exactly this persisted failing schedule instead of exploring.
    pub counterexample_file: Option<PathBuf>,
    /// Where a newly discovered counterexample is written.
    pub counterexample_output: PathBuf,
    pub only_initial_execution: bool,
    pub disable_dynamic_reduction: bool,
    /// Treat this iteration as failing even when the test passes; used to
    /// produce a counterexample file on demand.
    pub forced_failure: Option<u64>,
    /// Single-fault mode: never schedule executions with more than one
    /// forced failure.
    pub suppress_combinations: bool,
    /// Bound on iterations, counting the initial execution.
    pub max_executions: Option<u64>,
    pub setup_script: Option<String>,
    pub teardown_script: Option<String>,
    pub port: u16,
}

pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_COUNTEREXAMPLE_OUTPUT: &str = "counterexample.json";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            functional_test: None,
            analysis_file: PathBuf::from("default-analysis.json"),
            counterexample_file: None,
            counterexample_output: PathBuf::from(DEFAULT_COUNTEREXAMPLE_OUTPUT),
            only_initial_execution: false,
            disable_dynamic_reduction: false,
            forced_failure: None,
            suppress_combinations: false,
            max_executions: None,
            setup_script: None,
            teardown_script: None,
            port: DEFAULT_PORT,
        }
    }
}
