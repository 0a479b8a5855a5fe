pub mod engine;
pub mod states;

pub use engine::{ApprovalFlow, FlowDefinition, FlowEngine, FlowTransitionError};
pub use states::{RequestEvent, TransitionContext, TransitionOutcome, WorkflowAction};
