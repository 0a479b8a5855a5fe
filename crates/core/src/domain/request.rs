use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::approver::{ApproverLine, ApproverLineId, ApproverStatus};
use crate::domain::category::{CategoryId, RequiredFields};
use crate::domain::identity::{Actor, UserId};
use crate::domain::payment_method::PaymentMethodId;
use crate::errors::WorkflowError;
use crate::host::ResourceRef;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Draft,
    Pending,
    Approved,
    Refused,
    Cancel,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Refused => "refused",
            Self::Cancel => "cancel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "refused" => Some(Self::Refused),
            "cancel" | "cancelled" => Some(Self::Cancel),
            _ => None,
        }
    }

    /// Label shown to requesters; a draft reads as `new`.
    pub fn request_status(&self) -> &'static str {
        match self {
            Self::Draft => "new",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional business attributes; the category decides which are mandatory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub date: Option<NaiveDate>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub quantity: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub reference: Option<String>,
    pub partner_id: Option<String>,
    pub location: Option<String>,
    pub product_id: Option<String>,
    pub payment_method_id: Option<PaymentMethodId>,
}

impl RequestPayload {
    pub fn check_period(&self) -> Result<(), WorkflowError> {
        match (self.date_start, self.date_end) {
            (Some(start), Some(end)) if start > end => Err(WorkflowError::Validation(
                "period start date must be before end date".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    /// Labels of mandatory attributes that are unset. Zero quantity/amount counts as unset.
    pub fn missing_fields(&self, required: &RequiredFields) -> Vec<String> {
        let mut missing = Vec::new();
        if required.date && self.date.is_none() {
            missing.push("date");
        }
        if required.period && (self.date_start.is_none() || self.date_end.is_none()) {
            missing.push("period");
        }
        if required.quantity && self.quantity.map_or(true, |quantity| quantity.is_zero()) {
            missing.push("quantity");
        }
        if required.amount && self.amount.map_or(true, |amount| amount.is_zero()) {
            missing.push("amount");
        }
        if required.reference && is_blank(&self.reference) {
            missing.push("reference");
        }
        if required.location && is_blank(&self.location) {
            missing.push("location");
        }
        if required.partner && is_blank(&self.partner_id) {
            missing.push("contact");
        }
        if required.product && is_blank(&self.product_id) {
            missing.push("product");
        }
        missing.into_iter().map(str::to_owned).collect()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |value| value.trim().is_empty())
}

/// Input for creating a request. An explicit `name` skips reference generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub category_id: CategoryId,
    pub owner_id: UserId,
    pub name: Option<String>,
    pub company_id: Option<String>,
    pub payload: RequestPayload,
    pub source: Option<ResourceRef>,
    pub description: Option<String>,
}

impl RequestDraft {
    pub fn new(category_id: CategoryId, owner_id: UserId) -> Self {
        Self {
            category_id,
            owner_id,
            name: None,
            company_id: None,
            payload: RequestPayload::default(),
            source: None,
            description: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub name: String,
    pub category_id: CategoryId,
    pub owner_id: UserId,
    pub company_id: Option<String>,
    pub payload: RequestPayload,
    pub source: Option<ResourceRef>,
    pub state: RequestState,
    pub reason: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub approvers: Vec<ApproverLine>,
    /// Optimistic concurrency token; 0 means never persisted.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        id: RequestId,
        name: String,
        category_id: CategoryId,
        owner_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            category_id,
            owner_id,
            company_id: None,
            payload: RequestPayload { date: Some(now.date_naive()), ..RequestPayload::default() },
            source: None,
            state: RequestState::Draft,
            reason: None,
            description: None,
            active: true,
            approvers: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn approved_count(&self) -> usize {
        self.approvers.iter().filter(|line| line.status == ApproverStatus::Approved).count()
    }

    pub fn approver(&self, id: &ApproverLineId) -> Option<&ApproverLine> {
        self.approvers.iter().find(|line| &line.id == id)
    }

    pub fn approver_mut(&mut self, id: &ApproverLineId) -> Option<&mut ApproverLine> {
        self.approvers.iter_mut().find(|line| &line.id == id)
    }

    /// First line `user` is currently allowed to decide, in `(sequence, position)` order.
    pub fn eligible_line(&self, user: &UserId, sequential: bool) -> Option<&ApproverLine> {
        let mut lines: Vec<&ApproverLine> = self.approvers.iter().collect();
        lines.sort_by_key(|line| line.ordering_key());
        lines.into_iter().find(|line| line.can_approve(self, sequential, user))
    }

    pub fn is_approver(&self, user: &UserId) -> bool {
        self.approvers.iter().any(|line| &line.user_id == user)
    }

    pub fn has_access(&self, actor: &Actor) -> bool {
        actor.is_admin || self.owner_id == actor.user_id || self.is_approver(&actor.user_id)
    }

    pub fn request_link(&self, base_url: &str) -> String {
        format!("{}/requests/{}", base_url.trim_end_matches('/'), self.id.0)
    }

    pub fn set_all_statuses(&mut self, status: ApproverStatus) {
        for line in &mut self.approvers {
            line.status = status;
        }
    }
}
