use std::fmt;

use thiserror::Error;

use crate::stage::{Outcome, Stage};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// No eligible compute resource could be leased or bound.
    #[error("claim failed for {run_tag}: {message}")]
    Claim { run_tag: String, message: String },

    /// Malformed or unroutable job request.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("job {job} timed out after {attempts} status queries")]
    PollTimeout { job: String, attempts: u32 },

    #[error("job {job} finished with state {outcome}: {detail}")]
    ExecutionFailure {
        job: String,
        outcome: Outcome,
        detail: String,
    },

    #[error("storage sync failed: {0}")]
    Sync(String),

    #[error("invalid run tag component {field}: {value:?}")]
    InvalidRunTag { field: &'static str, value: String },

    #[error("config error: {0}")]
    Config(String),

    /// A collaborator command could not be run or its output was unparseable.
    #[error("backend call `{command}` failed: {message}")]
    Backend { command: String, message: String },

    #[error("stage {stage} failed for run {run_tag}: {source}")]
    Stage {
        stage: Stage,
        run_tag: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    pub fn claim(run_tag: impl fmt::Display, message: impl Into<String>) -> Self {
        OrchestrationError::Claim {
            run_tag: run_tag.to_string(),
            message: message.into(),
        }
    }

    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestrationError::Backend {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn in_stage(self, stage: Stage, run_tag: impl fmt::Display) -> Self {
        match self {
            already @ OrchestrationError::Stage { .. } => already,
            other => OrchestrationError::Stage {
                stage,
                run_tag: run_tag.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Short machine-readable code for JSON error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::Claim { .. } => "claim_error",
            OrchestrationError::Dispatch(_) => "dispatch_error",
            OrchestrationError::PollTimeout { .. } => "poll_timeout",
            OrchestrationError::ExecutionFailure { .. } => "execution_failure",
            OrchestrationError::Sync(_) => "sync_error",
            OrchestrationError::InvalidRunTag { .. } => "invalid_run_tag",
            OrchestrationError::Config(_) => "config_error",
            OrchestrationError::Backend { .. } => "backend_error",
            OrchestrationError::Stage { source, .. } => source.code(),
            OrchestrationError::Io(_) => "io_error",
        }
    }
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_stage_does_not_double_wrap() {
        let err = OrchestrationError::Sync("bucket gone".to_string())
            .in_stage(Stage::Mesh, "IAN_2022_7")
            .in_stage(Stage::Solve, "IAN_2022_7");
        match &err {
            OrchestrationError::Stage { stage, .. } => assert_eq!(*stage, Stage::Mesh),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.code(), "sync_error");
        assert!(err.to_string().contains("IAN_2022_7"));
    }
}
