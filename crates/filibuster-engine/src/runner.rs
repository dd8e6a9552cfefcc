use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::EngineError;

/// Seam between the orchestrator and the functional test.
///
/// Production runs shell out ([`ShellCommand`]); tests inject scripted
/// implementations that drive the coordinator directly.
#[async_trait]
pub trait TestCommand: Send + Sync {
    /// Run one iteration of the functional test; resolves to its exit
    /// code.
    async fn run(&self) -> Result<i32, EngineError>;

    /// How the command is described in logs and counterexample files.
    fn describe(&self) -> String;
}

/// Runs a shell command line via `sh -c`, inheriting stdio.
pub struct ShellCommand {
    command_line: String,
}

impl ShellCommand {
    pub fn new(command_line: &str) -> Self {
        Self {
            command_line: command_line.to_string(),
        }
    }
}

#[async_trait]
impl TestCommand for ShellCommand {
    async fn run(&self) -> Result<i32, EngineError> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command_line)
            .status()
            .await
            .map_err(|source| EngineError::CommandSpawn {
                command: self.command_line.clone(),
                source,
            })?;

        // A command killed by a signal has no code; count it as failing.
        let code = status.code().unwrap_or(1);
        info!(command = %self.command_line, code, "test command exited");
        Ok(code)
    }

    fn describe(&self) -> String {
        self.command_line.clone()
    }
}

/// Which bracket script is running; selects the fatal error on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptPhase {
    Setup,
    Teardown,
}

/// Run a setup or teardown script via `sh -c`. Non-zero exit is fatal.
pub async fn run_script(script: &str, phase: ScriptPhase) -> Result<(), EngineError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(script)
        .status()
        .await
        .map_err(|source| EngineError::CommandSpawn {
            command: script.to_string(),
            source,
        })?;

    let code = status.code().unwrap_or(1);
    if code != 0 {
        return Err(match phase {
            ScriptPhase::Setup => EngineError::SetupScriptFailed { code },
            ScriptPhase::Teardown => EngineError::TeardownScriptFailed { code },
        });
    }
    Ok(())
}
