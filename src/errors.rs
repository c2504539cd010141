//! Typed error hierarchy for the phaseflow orchestrator.
//!
//! Only structural errors surface here. Gate failures and policy exhaustion
//! are ordinary outcomes (`GateResult`, `RoutingDecision`) and never become
//! errors.

use crate::session::PhaseStatus;
use thiserror::Error;

/// Errors returned by the workflow orchestrator's public operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Flow '{flow_key}' is not defined")]
    UnknownFlow { flow_key: String },

    #[error("Flow '{flow_key}' has no phases")]
    EmptyFlow { flow_key: String },

    #[error("Phase '{phase}' is not part of flow '{flow_key}'")]
    UnknownPhase { flow_key: String, phase: String },

    #[error("No session found at {path}")]
    NoSession { path: std::path::PathBuf },

    #[error("A session already exists at {path}")]
    SessionExists { path: std::path::PathBuf },

    #[error("Cannot {operation} phase '{phase}' while it is {status}")]
    InvalidTransition {
        operation: &'static str,
        phase: String,
        status: PhaseStatus,
    },

    #[error("Phase '{requested}' is not the current phase ('{current}')")]
    NotCurrentPhase { requested: String, current: String },

    #[error("Session was modified concurrently (expected version {expected}, found {found})")]
    StaleSession { expected: u64, found: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_operation_and_status() {
        let err = WorkflowError::InvalidTransition {
            operation: "resume",
            phase: "Phase1".to_string(),
            status: PhaseStatus::Ready,
        };
        let msg = err.to_string();
        assert!(msg.contains("resume"));
        assert!(msg.contains("Phase1"));
        assert!(msg.contains("ready"));
    }

    #[test]
    fn stale_session_carries_versions() {
        let err = WorkflowError::StaleSession {
            expected: 3,
            found: 4,
        };
        match &err {
            WorkflowError::StaleSession { expected, found } => {
                assert_eq!(*expected, 3);
                assert_eq!(*found, 4);
            }
            _ => panic!("Expected StaleSession"),
        }
    }

    #[test]
    fn anyhow_errors_convert_into_other() {
        let err: WorkflowError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, WorkflowError::Other(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::EmptyFlow {
            flow_key: "draft".into(),
        });
    }
}
