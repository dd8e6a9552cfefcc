use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use filibuster_types::TestExecution;

use crate::error::CounterexampleError;

/// A persisted failing schedule, replayable with `--counterexample-file`.
///
/// The test execution is stored as a nested JSON-encoded string, which is
/// how the file format has always carried it; `execution()` decodes it
/// back into a value object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Counterexample {
    pub functional_test: String,
    #[serde(rename = "TestExecution")]
    pub test_execution: String,
    /// When present, replay injects each matching fault only this
    /// percentage of the time (load-style reproduction of flaky failures).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_percentage: Option<f64>,
}

impl Counterexample {
    pub fn new(
        functional_test: &str,
        execution: &TestExecution,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            functional_test: functional_test.to_string(),
            test_execution: execution.to_json()?,
            failure_percentage: None,
        })
    }

    /// Decode the embedded test execution.
    pub fn execution(&self) -> Result<TestExecution, CounterexampleError> {
        TestExecution::from_json(&self.test_execution).map_err(CounterexampleError::Execution)
    }

    pub fn load(path: &Path) -> Result<Self, CounterexampleError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CounterexampleError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let counterexample: Self =
            serde_json::from_str(&contents).map_err(|source| CounterexampleError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "loaded counterexample");
        Ok(counterexample)
    }

    pub fn store(&self, path: &Path) -> Result<(), CounterexampleError> {
        let contents = serde_json::to_string(self).map_err(CounterexampleError::Execution)?;
        std::fs::write(path, contents).map_err(|source| CounterexampleError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "counterexample written");
        Ok(())
    }
}
