use thiserror::Error;

use crate::domain::request::RequestState;
use crate::flows::FlowTransitionError;
use crate::resolution::ResolutionError;

/// Blocking workflow failures. Every variant is raised before any mutation is applied.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("cannot {operation} a request in state `{state}`")]
    State { state: RequestState, operation: &'static str },
}

impl WorkflowError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::Authorization(_) => "authorization",
            Self::State { .. } => "state",
        }
    }
}

impl From<FlowTransitionError> for WorkflowError {
    fn from(value: FlowTransitionError) -> Self {
        match value {
            FlowTransitionError::InvalidTransition { state, event } => {
                Self::State { state, operation: event.operation() }
            }
            FlowTransitionError::MissingRequiredFields { missing_fields, .. } => {
                Self::Validation(format!("missing required fields: {}", missing_fields.join(", ")))
            }
            FlowTransitionError::NoApprovers { .. } => Self::Configuration(
                "no approvers configured; please contact your administrator".to_owned(),
            ),
        }
    }
}

impl From<ResolutionError> for WorkflowError {
    fn from(value: ResolutionError) -> Self {
        Self::Configuration(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}
