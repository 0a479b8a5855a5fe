//! Bridge to external documents (for example a purchase order) gated by approval requests.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::category::Category;
use crate::domain::identity::UserId;
use crate::domain::request::{ApprovalRequest, RequestDraft, RequestState};
use crate::errors::WorkflowError;

/// `(model, id)` pointer at a host record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub model: String,
    pub id: i64,
}

impl ResourceRef {
    pub fn new(model: impl Into<String>, id: i64) -> Self {
        Self { model: model.into(), id }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.model, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostApprovalStatus {
    No,
    ToApprove,
    Approved,
    Refused,
}

impl HostApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::ToApprove => "to_approve",
            Self::Approved => "approved",
            Self::Refused => "refused",
        }
    }
}

/// Any approved request wins, then any refused, then any pending.
pub fn host_approval_status<'a, I>(requests: I) -> HostApprovalStatus
where
    I: IntoIterator<Item = &'a ApprovalRequest>,
{
    let states: Vec<RequestState> = requests.into_iter().map(|request| request.state).collect();
    if states.contains(&RequestState::Approved) {
        HostApprovalStatus::Approved
    } else if states.contains(&RequestState::Refused) {
        HostApprovalStatus::Refused
    } else if states.contains(&RequestState::Pending) {
        HostApprovalStatus::ToApprove
    } else {
        HostApprovalStatus::No
    }
}

/// Gate for the host's advancing action. Documents without linked requests pass.
pub fn ensure_host_confirmable(
    resource: &ResourceRef,
    requests: &[ApprovalRequest],
) -> Result<(), WorkflowError> {
    if requests.is_empty() {
        return Ok(());
    }
    match host_approval_status(requests) {
        HostApprovalStatus::Approved => Ok(()),
        status => Err(WorkflowError::Validation(format!(
            "cannot confirm `{resource}` because its approval request is not approved (status `{}`)",
            status.as_str()
        ))),
    }
}

/// What a host document hands over when asking for approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDocument {
    pub resource: ResourceRef,
    pub display_name: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub partner_id: Option<String>,
}

/// Picks the first active category whose name contains `hint`, else the first active one.
pub fn pick_category<'a>(categories: &'a [Category], hint: &str) -> Option<&'a Category> {
    let mut active: Vec<&Category> = categories.iter().filter(|category| category.active).collect();
    active.sort_by(|left, right| {
        left.sequence.cmp(&right.sequence).then_with(|| left.name.cmp(&right.name))
    });
    let hint = hint.trim().to_ascii_lowercase();
    active
        .iter()
        .copied()
        .find(|category| !hint.is_empty() && category.name.to_ascii_lowercase().contains(&hint))
        .or_else(|| active.first().copied())
}

pub fn host_request_draft(
    document: &HostDocument,
    category: &Category,
    owner_id: UserId,
) -> RequestDraft {
    let mut draft = RequestDraft::new(category.id.clone(), owner_id);
    draft.name = Some(format!("Approval for {}", document.display_name));
    draft.source = Some(document.resource.clone());
    draft.payload.amount = document.amount;
    draft.payload.currency = document.currency.clone();
    draft.payload.partner_id = document.partner_id.clone();
    draft
}
