//! Derives the ordered approver slots a request needs from its category and requester.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approver::ApproverLine;
use crate::domain::category::{ApprovalType, Category};
use crate::domain::identity::{resolve_manager, Directory, ManagerLookupError, UserId};
use crate::domain::request::RequestId;

const MANAGER_SEQUENCE: i32 = 10;
const BOTH_MANAGER_SEQUENCE: i32 = 5;
const BOTH_TEMPLATE_OFFSET: i32 = 10;
const APPENDED_MANAGER_STEP: i32 = 10;
const REQUESTER_SEQUENCE: i32 = 0;

/// Preview tolerates missing data while a request is edited; commit refuses it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    Preview,
    Commit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSlot {
    pub user_id: UserId,
    pub sequence: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub slots: Vec<ApproverSlot>,
    /// Slots that were skipped without failing, e.g. a missing manager under `both`.
    pub notes: Vec<String>,
}

impl Resolution {
    fn contains(&self, user: &UserId) -> bool {
        self.slots.iter().any(|slot| &slot.user_id == user)
    }

    fn push_unique(&mut self, user_id: UserId, sequence: i32) {
        if !self.contains(&user_id) {
            self.slots.push(ApproverSlot { user_id, sequence });
        }
    }

    fn max_sequence(&self) -> i32 {
        self.slots.iter().map(|slot| slot.sequence).max().unwrap_or(0)
    }

    /// Materialises request-bound lines in `new` status; positions follow slot order.
    pub fn into_lines(self, category: &Category, request_id: &RequestId) -> Vec<ApproverLine> {
        let mut lines: Vec<ApproverLine> = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                ApproverLine::bound(
                    category.id.clone(),
                    request_id.clone(),
                    slot.user_id,
                    slot.sequence,
                    position as u32,
                )
            })
            .collect();
        lines.sort_by_key(ApproverLine::ordering_key);
        lines
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error(
        "no approvers defined for category `{category}`; define approvers in the category configuration before submitting requests"
    )]
    NoTemplateApprovers { category: String },
    #[error(
        "no manager found for user `{user}` required by category `{category}` ({source}); ensure the user has an employee record with a manager assigned"
    )]
    MissingManager {
        category: String,
        user: String,
        #[source]
        source: ManagerLookupError,
    },
    #[error(
        "no approvers found for category `{category}`; define approvers or assign the requester a manager"
    )]
    NoApprovers { category: String },
}

pub struct ApproverResolver<'a, D: ?Sized> {
    directory: &'a D,
}

impl<'a, D> ApproverResolver<'a, D>
where
    D: Directory + ?Sized,
{
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    /// Best-effort resolution for editing; never fails.
    pub fn preview(&self, category: &Category, owner: &UserId) -> Resolution {
        match self.resolve(category, owner, ResolutionMode::Preview) {
            Ok(resolution) => resolution,
            Err(error) => Resolution { slots: Vec::new(), notes: vec![error.to_string()] },
        }
    }

    pub fn commit(&self, category: &Category, owner: &UserId) -> Result<Resolution, ResolutionError> {
        self.resolve(category, owner, ResolutionMode::Commit)
    }

    pub fn resolve(
        &self,
        category: &Category,
        owner: &UserId,
        mode: ResolutionMode,
    ) -> Result<Resolution, ResolutionError> {
        let commit = mode == ResolutionMode::Commit;
        let templates = category.template_approvers();
        let mut resolution = Resolution::default();

        match category.approval_type {
            ApprovalType::User => {
                if templates.is_empty() {
                    if commit {
                        return Err(ResolutionError::NoTemplateApprovers {
                            category: category.name.clone(),
                        });
                    }
                    return Ok(resolution);
                }
                for template in &templates {
                    resolution.push_unique(template.user_id.clone(), template.sequence);
                }
            }
            ApprovalType::Manager => match self.manager(category, owner) {
                Ok(manager) => resolution.push_unique(manager, MANAGER_SEQUENCE),
                Err(error) if commit => return Err(error),
                Err(error) => resolution.notes.push(error.to_string()),
            },
            ApprovalType::Both => {
                match self.manager(category, owner) {
                    Ok(manager) => resolution.push_unique(manager, BOTH_MANAGER_SEQUENCE),
                    Err(error) => resolution.notes.push(format!("manager slot skipped: {error}")),
                }
                for template in &templates {
                    resolution
                        .push_unique(template.user_id.clone(), template.sequence + BOTH_TEMPLATE_OFFSET);
                }
                if commit && resolution.slots.is_empty() {
                    return Err(ResolutionError::NoApprovers { category: category.name.clone() });
                }
            }
        }

        if category.require_employee_manager {
            match self.manager(category, owner) {
                Ok(manager) => {
                    if !resolution.contains(&manager) {
                        let sequence = resolution.max_sequence() + APPENDED_MANAGER_STEP;
                        resolution.push_unique(manager, sequence);
                    }
                }
                Err(error) if commit => return Err(error),
                Err(error) => resolution.notes.push(error.to_string()),
            }
        }

        if category.require_my_approval {
            resolution.push_unique(owner.clone(), REQUESTER_SEQUENCE);
        }

        if commit && resolution.slots.is_empty() {
            return Err(ResolutionError::NoApprovers { category: category.name.clone() });
        }

        Ok(resolution)
    }

    fn manager(&self, category: &Category, owner: &UserId) -> Result<UserId, ResolutionError> {
        resolve_manager(self.directory, owner).map_err(|source| ResolutionError::MissingManager {
            category: category.name.clone(),
            user: owner.0.clone(),
            source,
        })
    }
}
