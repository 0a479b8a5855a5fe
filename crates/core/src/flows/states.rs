use serde::{Deserialize, Serialize};

use crate::domain::request::RequestState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEvent {
    Submit,
    ThresholdReached,
    Veto,
    Withdraw,
    Cancel,
}

impl RequestEvent {
    /// Verb used in state error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::ThresholdReached => "approve",
            Self::Veto => "refuse",
            Self::Withdraw => "withdraw",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransitionContext {
    pub approver_count: usize,
    pub missing_required_fields: Vec<String>,
}

/// Side effects the workflow runs after a transition is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowAction {
    MarkApproversPending,
    ResetApprovers,
    NotifyApprovers,
    PostNote,
    SendSubmittedEmail,
    SendApprovedEmail,
    SendRefusedEmail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: RequestState,
    pub to: RequestState,
    pub event: RequestEvent,
    pub actions: Vec<WorkflowAction>,
}
