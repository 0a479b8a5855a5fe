use serde::{Deserialize, Serialize};

use crate::domain::approver::{sort_lines, ApproverLine, ApproverLineId};
use crate::domain::identity::UserId;
use crate::domain::request::{ApprovalRequest, RequestState};
use crate::errors::WorkflowError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    User,
    Manager,
    Both,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Manager => "manager",
            Self::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "users" => Some(Self::User),
            "manager" => Some(Self::Manager),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn uses_template_approvers(&self) -> bool {
        matches!(self, Self::User | Self::Both)
    }
}

/// Which optional request attributes are mandatory for requests of a category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredFields {
    pub date: bool,
    pub period: bool,
    pub quantity: bool,
    pub amount: bool,
    pub reference: bool,
    pub payment_method: bool,
    pub location: bool,
    pub partner: bool,
    pub product: bool,
}

impl Default for RequiredFields {
    fn default() -> Self {
        Self {
            date: true,
            period: false,
            quantity: false,
            amount: false,
            reference: false,
            payment_method: false,
            location: false,
            partner: false,
            product: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub sequence: i32,
    pub active: bool,
    pub company_id: Option<String>,
    pub description: Option<String>,
    pub required: RequiredFields,
    pub approval_type: ApprovalType,
    pub approval_minimum: u32,
    pub approval_sequence: bool,
    pub require_my_approval: bool,
    pub require_employee_manager: bool,
    /// Template approver rows; none of them carries a request id.
    pub approvers: Vec<ApproverLine>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: CategoryId(id.into()),
            name: name.into(),
            sequence: 10,
            active: true,
            company_id: None,
            description: None,
            required: RequiredFields::default(),
            approval_type: ApprovalType::User,
            approval_minimum: 1,
            approval_sequence: false,
            require_my_approval: false,
            require_employee_manager: false,
            approvers: Vec::new(),
        }
    }

    /// Administrative path: adds a template row without any request context.
    pub fn add_template_approver(&mut self, user_id: UserId, sequence: i32) -> ApproverLineId {
        let position = self.approvers.iter().map(|line| line.position + 1).max().unwrap_or(0);
        let line = ApproverLine::template(self.id.clone(), user_id, sequence, position);
        let id = line.id.clone();
        self.approvers.push(line);
        sort_lines(&mut self.approvers);
        id
    }

    pub fn remove_template_approver(&mut self, user_id: &UserId) -> bool {
        let before = self.approvers.len();
        self.approvers.retain(|line| &line.user_id != user_id);
        before != self.approvers.len()
    }

    /// Template rows in `(sequence, position)` order.
    pub fn template_approvers(&self) -> Vec<&ApproverLine> {
        let mut templates: Vec<&ApproverLine> =
            self.approvers.iter().filter(|line| line.is_template()).collect();
        templates.sort_by_key(|line| line.ordering_key());
        templates
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::Validation("category name is required".to_owned()));
        }
        if self.approval_minimum < 1 {
            return Err(WorkflowError::Validation(
                "minimum approvals must be at least 1".to_owned(),
            ));
        }

        let templates = self.template_approvers();
        let template_count = templates.len();
        for (index, line) in templates.iter().enumerate() {
            if templates[..index].iter().any(|earlier| earlier.user_id == line.user_id) {
                return Err(WorkflowError::Validation(format!(
                    "user `{}` is listed more than once as approver of category `{}`",
                    line.user_id.0, self.name
                )));
            }
        }
        if self.approval_type.uses_template_approvers() {
            if template_count == 0 {
                return Err(WorkflowError::Validation(format!(
                    "approvers must be defined when approval type is `{}`; add at least one approver to category `{}`",
                    self.approval_type.as_str(),
                    self.name
                )));
            }
            if self.approval_minimum as usize > template_count {
                return Err(WorkflowError::Validation(format!(
                    "minimum approvals ({}) cannot exceed the number of approvers ({template_count})",
                    self.approval_minimum
                )));
            }
        }

        Ok(())
    }

    pub fn stats<'a>(&self, requests: impl IntoIterator<Item = &'a ApprovalRequest>) -> CategoryStats {
        let mut stats = CategoryStats::default();
        for request in requests.into_iter().filter(|request| request.category_id == self.id) {
            stats.request_count += 1;
            if request.state == RequestState::Pending {
                stats.to_validate_count += 1;
            }
        }
        stats
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub request_count: usize,
    pub to_validate_count: usize,
}

/// Orders categories by `(sequence, name)`.
pub fn sort_categories(categories: &mut [Category]) {
    categories.sort_by(|left, right| {
        left.sequence.cmp(&right.sequence).then_with(|| left.name.cmp(&right.name))
    });
}
