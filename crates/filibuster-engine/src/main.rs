use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::filter::LevelFilter;

use filibuster_engine::EngineConfig;
use filibuster_engine::config::{DEFAULT_COUNTEREXAMPLE_OUTPUT, DEFAULT_PORT};

/// Test a microservice application by systematically injecting faults
/// into the calls a functional test actually makes.
#[derive(Parser)]
#[command(name = "filibuster", version)]
struct Cli {
    /// Functional test command. Omit to run in server-only mode, where an
    /// external harness drives iterations over the control plane.
    #[arg(long)]
    functional_test: Option<String>,

    /// Analysis file listing per-module call-site patterns and faults.
    #[arg(long, default_value = "default-analysis.json")]
    analysis_file: PathBuf,

    /// Counterexample file to replay.
    #[arg(long)]
    counterexample_file: Option<PathBuf>,

    /// Only run a fault-free execution of the test.
    #[arg(long)]
    only_initial_execution: bool,

    /// Disable dynamic reduction.
    #[arg(long)]
    disable_dynamic_reduction: bool,

    /// Force a failure at iteration N to generate a counterexample file.
    #[arg(long)]
    forced_failure: Option<u64>,

    /// Never schedule executions with more than one forced failure.
    #[arg(long)]
    suppress_combinations: bool,

    /// Bound the number of iterations, counting the initial execution.
    #[arg(long)]
    max_executions: Option<u64>,

    /// Command to run before each iteration; non-zero exit aborts.
    #[arg(long)]
    setup_script: Option<String>,

    /// Command to run after each iteration; non-zero exit aborts.
    #[arg(long)]
    teardown_script: Option<String>,

    /// Control-plane port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl Cli {
    fn into_config(self) -> EngineConfig {
        EngineConfig {
            functional_test: self.functional_test,
            analysis_file: self.analysis_file,
            counterexample_file: self.counterexample_file,
            counterexample_output: PathBuf::from(DEFAULT_COUNTEREXAMPLE_OUTPUT),
            only_initial_execution: self.only_initial_execution,
            disable_dynamic_reduction: self.disable_dynamic_reduction,
            forced_failure: self.forced_failure,
            suppress_combinations: self.suppress_combinations,
            max_executions: self.max_executions,
            setup_script: self.setup_script,
            teardown_script: self.teardown_script,
            port: self.port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(LevelFilter::from(cli.log_level))
            .finish(),
    )
    .context("failed to set global default tracing subscriber")?;

    let outcome = filibuster_engine::run(cli.into_config())
        .await
        .context("orchestration aborted")?;

    process::exit(outcome.exit_code());
}
