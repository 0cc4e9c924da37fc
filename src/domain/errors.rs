//! Structured error types for the fusion engine
//!
//! Using thiserror for automatic Display implementation and error chaining,
//! one variant per error kind from the engine's error taxonomy. `NumericWarning`
//! from the design has no variant here: it is logged via `log::warn!` at the
//! call site and does not abort the operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("I/O failure accessing {path}: {source}")]
    IoFailure { path: String, #[source] source: std::io::Error },

    #[error("profiler execution failed after {attempts} attempt(s): {reason}")]
    ExecutionFailure { attempts: u32, reason: String },

    #[error("data not found: {0}")]
    DataNotFound(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::IoFailure { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_displays_reason() {
        let err = EngineError::InvalidConfig("missing 'binary' field".into());
        assert_eq!(err.to_string(), "invalid configuration: missing 'binary' field");
    }

    #[test]
    fn execution_failure_displays_attempts() {
        let err = EngineError::ExecutionFailure { attempts: 3, reason: "exit code 1".into() };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("exit code 1"));
    }
}
