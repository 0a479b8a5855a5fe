pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod host;
pub mod notify;
pub mod resolution;
pub mod sequence;
pub mod workflow;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use domain::approver::{ApproverLine, ApproverLineId, ApproverStatus};
pub use domain::category::{ApprovalType, Category, CategoryId, CategoryStats, RequiredFields};
pub use domain::identity::{Actor, Directory, Employee, EmployeeId, InMemoryDirectory, User, UserId};
pub use domain::payment_method::{PaymentMethod, PaymentMethodId};
pub use domain::request::{ApprovalRequest, RequestDraft, RequestId, RequestPayload, RequestState};
pub use errors::{ApplicationError, WorkflowError};
pub use host::{HostApprovalStatus, HostDocument, ResourceRef};
pub use notify::{
    InMemoryNotifier, MailTemplates, NotificationError, Notifier, OutboxNotifier, TracingNotifier,
};
pub use resolution::{ApproverResolver, ApproverSlot, Resolution, ResolutionError, ResolutionMode};
pub use sequence::{InMemoryReferenceSequence, ReferenceSequence, SequenceFormat};
pub use workflow::{ApprovalWorkflow, WorkflowSettings};
