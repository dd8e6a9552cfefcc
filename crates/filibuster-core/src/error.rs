use std::path::PathBuf;

/// Errors loading the fault catalog. All are fatal at orchestrator startup:
/// a catalog that cannot be fully compiled would silently narrow the fault
/// space, so nothing runs until it parses.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read analysis file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("analysis file {path} is not valid JSON")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("module '{module}' has an invalid call-site pattern")]
    InvalidPattern {
        module: String,
        #[source]
        source: regex::Error,
    },
    #[error("module '{module}' error entry has an invalid service-name pattern")]
    InvalidServicePattern {
        module: String,
        #[source]
        source: regex::Error,
    },
    #[error("module '{module}' exception '{name}' has an unrecognized expression '{expression}'")]
    UnknownExpression {
        module: String,
        name: String,
        expression: String,
    },
}

/// Errors loading or writing counterexample files. Load errors are fatal
/// at startup; write errors surface through the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CounterexampleError {
    #[error("failed to read counterexample {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("counterexample {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("counterexample carries an unparsable test execution")]
    Execution(#[source] serde_json::Error),
    #[error("failed to write counterexample {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
