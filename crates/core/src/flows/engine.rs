use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::request::RequestState;
use crate::flows::states::{RequestEvent, TransitionContext, TransitionOutcome, WorkflowAction};

pub trait FlowDefinition {
    fn initial_state(&self) -> RequestState;
    fn transition(
        &self,
        current: &RequestState,
        event: &RequestEvent,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct ApprovalFlow;

impl FlowDefinition for ApprovalFlow {
    fn initial_state(&self) -> RequestState {
        RequestState::Draft
    }

    fn transition(
        &self,
        current: &RequestState,
        event: &RequestEvent,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_approval(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> RequestState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &RequestState,
        event: &RequestEvent,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &RequestState,
        event: &RequestEvent,
        context: &TransitionContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    audit
                        .event(
                            "workflow.transition_applied",
                            AuditCategory::Workflow,
                            AuditOutcome::Success,
                        )
                        .with_metadata("from", outcome.from.as_str())
                        .with_metadata("to", outcome.to.as_str())
                        .with_metadata("event", outcome.event.operation()),
                );
            }
            Err(error) => {
                sink.emit(
                    audit
                        .event(
                            "workflow.transition_rejected",
                            AuditCategory::Workflow,
                            AuditOutcome::Rejected,
                        )
                        .with_metadata("state", current.as_str())
                        .with_metadata("event", event.operation())
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<ApprovalFlow> {
    fn default() -> Self {
        Self::new(ApprovalFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("missing required fields before transition from {state}: {missing_fields:?}")]
    MissingRequiredFields { state: RequestState, missing_fields: Vec<String> },
    #[error("no approvers on request in state {state}")]
    NoApprovers { state: RequestState },
    #[error("invalid transition from {state} using event {event:?}")]
    InvalidTransition { state: RequestState, event: RequestEvent },
}

fn transition_approval(
    current: &RequestState,
    event: &RequestEvent,
    context: &TransitionContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use RequestEvent::{Cancel, Submit, ThresholdReached, Veto, Withdraw};
    use RequestState::{Approved, Draft, Pending, Refused};
    use WorkflowAction::{
        MarkApproversPending, NotifyApprovers, PostNote, ResetApprovers, SendApprovedEmail,
        SendRefusedEmail, SendSubmittedEmail,
    };

    let (to, actions) = match (current, event) {
        (Draft, Submit) => {
            if context.approver_count == 0 {
                return Err(FlowTransitionError::NoApprovers { state: *current });
            }
            if !context.missing_required_fields.is_empty() {
                return Err(FlowTransitionError::MissingRequiredFields {
                    state: *current,
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            (Pending, vec![MarkApproversPending, NotifyApprovers, PostNote, SendSubmittedEmail])
        }
        (Pending, ThresholdReached) => (Approved, vec![PostNote, SendApprovedEmail]),
        (Pending, Veto) => (Refused, vec![SendRefusedEmail, PostNote]),
        (Pending, Withdraw) => (Draft, vec![ResetApprovers, PostNote]),
        (Approved, Cancel) | (Refused, Cancel) => {
            return Err(FlowTransitionError::InvalidTransition { state: *current, event: *event });
        }
        (_, Cancel) => {
            if context.approver_count == 0 {
                return Err(FlowTransitionError::NoApprovers { state: *current });
            }
            (RequestState::Cancel, vec![PostNote])
        }
        _ => {
            return Err(FlowTransitionError::InvalidTransition { state: *current, event: *event });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: *event, actions })
}
