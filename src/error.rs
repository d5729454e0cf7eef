use std::path::PathBuf;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Closed error taxonomy for the operational kernel.
///
/// Anything fatal within an engine tick is caught at the tick boundary; the
/// engine keeps the previous snapshot and surfaces the error on the next
/// status read.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("input defect: {0}")]
    InputDefect(String),

    #[error("missing service date and no parseable timestamp to derive it from")]
    MissingServiceDate,

    #[error("bad topology: {0}")]
    BadTopology(String),

    #[error("safety invariant broken: {0}")]
    SafetyInvariantBroken(String),

    #[error("ingest failure on adapter {adapter}: {message}")]
    Ingest { adapter: String, message: String },

    #[error("persistence failure for {path:?}: {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("missing artifact: {0:?}")]
    MissingArtifact(PathBuf),

    #[error("policy rejected: {0}")]
    Policy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Process exit code for CLI operations.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::MissingArtifact(_) => 2,
            CoreError::BadTopology(_) => 3,
            CoreError::SafetyInvariantBroken(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CoreError::MissingArtifact(PathBuf::from("x.json")).exit_code(), 2);
        assert_eq!(CoreError::BadTopology("dup".to_string()).exit_code(), 3);
        assert_eq!(
            CoreError::SafetyInvariantBroken("overlap".to_string()).exit_code(),
            4
        );
        assert_eq!(CoreError::InputDefect("bad row".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_messages_name_the_failing_artifact() {
        let err = CoreError::Persistence {
            path: PathBuf::from("artifacts/sec/2024-01-01/rec_plan.json"),
            message: "rename failed".to_string(),
        };
        assert!(err.to_string().contains("rec_plan.json"));

        let err = CoreError::MissingArtifact(PathBuf::from("section_nodes.parquet"));
        assert!(err.to_string().contains("section_nodes.parquet"));
    }
}
