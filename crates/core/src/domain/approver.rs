use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::category::CategoryId;
use crate::domain::identity::UserId;
use crate::domain::request::{ApprovalRequest, RequestId, RequestState};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApproverLineId(pub String);

impl ApproverLineId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverStatus {
    New,
    Pending,
    Approved,
    Refused,
}

impl ApproverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Refused => "refused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "refused" => Some(Self::Refused),
            _ => None,
        }
    }
}

/// One decision slot. A line without `request_id` is a category template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverLine {
    pub id: ApproverLineId,
    pub category_id: CategoryId,
    pub request_id: Option<RequestId>,
    pub user_id: UserId,
    pub sequence: i32,
    /// Creation index within the owning collection; breaks ties on equal sequence.
    pub position: u32,
    pub status: ApproverStatus,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl ApproverLine {
    pub fn template(category_id: CategoryId, user_id: UserId, sequence: i32, position: u32) -> Self {
        Self {
            id: ApproverLineId::generate(),
            category_id,
            request_id: None,
            user_id,
            sequence,
            position,
            status: ApproverStatus::New,
            decided_at: None,
            comment: None,
        }
    }

    pub fn bound(
        category_id: CategoryId,
        request_id: RequestId,
        user_id: UserId,
        sequence: i32,
        position: u32,
    ) -> Self {
        Self { request_id: Some(request_id), ..Self::template(category_id, user_id, sequence, position) }
    }

    pub fn is_template(&self) -> bool {
        self.request_id.is_none()
    }

    pub fn ordering_key(&self) -> (i32, u32) {
        (self.sequence, self.position)
    }

    /// Whether `user` may decide this line right now. Derived on every read, never stored.
    pub fn can_approve(&self, request: &ApprovalRequest, sequential: bool, user: &UserId) -> bool {
        if self.request_id.as_ref() != Some(&request.id) {
            return false;
        }
        if request.state != RequestState::Pending
            || self.status != ApproverStatus::Pending
            || &self.user_id != user
        {
            return false;
        }
        if !sequential {
            return true;
        }

        // equal sequences are parallel
        request
            .approvers
            .iter()
            .filter(|other| other.sequence < self.sequence)
            .all(|other| other.status == ApproverStatus::Approved)
    }
}

pub fn sort_lines(lines: &mut [ApproverLine]) {
    lines.sort_by_key(ApproverLine::ordering_key);
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ApproverLine, ApproverStatus};
    use crate::domain::category::CategoryId;
    use crate::domain::identity::UserId;
    use crate::domain::request::{ApprovalRequest, RequestId, RequestState};

    fn request_with(lines: &[(&str, i32, ApproverStatus)], state: RequestState) -> ApprovalRequest {
        let mut request = ApprovalRequest::new(
            RequestId("r-1".to_string()),
            "APR/00001".to_string(),
            CategoryId("c-1".to_string()),
            UserId("u-owner".to_string()),
            Utc::now(),
        );
        request.state = state;
        request.approvers = lines
            .iter()
            .enumerate()
            .map(|(index, (user, sequence, status))| {
                let mut line = ApproverLine::bound(
                    CategoryId("c-1".to_string()),
                    RequestId("r-1".to_string()),
                    UserId((*user).to_string()),
                    *sequence,
                    index as u32,
                );
                line.status = *status;
                line
            })
            .collect();
        request
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[test]
    fn parallel_lines_are_all_eligible_when_pending() {
        let request = request_with(
            &[("u1", 10, ApproverStatus::Pending), ("u2", 20, ApproverStatus::Pending)],
            RequestState::Pending,
        );

        assert!(request.approvers[1].can_approve(&request, false, &user("u2")));
        assert!(!request.approvers[1].can_approve(&request, false, &user("u1")));
    }

    #[test]
    fn sequential_gating_waits_for_strictly_lower_sequences() {
        let mut request = request_with(
            &[
                ("u1", 10, ApproverStatus::Pending),
                ("u2", 20, ApproverStatus::Pending),
                ("u3", 20, ApproverStatus::Pending),
            ],
            RequestState::Pending,
        );

        assert!(request.approvers[0].can_approve(&request, true, &user("u1")));
        assert!(!request.approvers[1].can_approve(&request, true, &user("u2")));

        request.approvers[0].status = ApproverStatus::Approved;
        assert!(request.approvers[1].can_approve(&request, true, &user("u2")));
        assert!(request.approvers[2].can_approve(&request, true, &user("u3")));
    }

    #[test]
    fn ineligible_outside_pending_or_after_decision() {
        let draft = request_with(&[("u1", 10, ApproverStatus::Pending)], RequestState::Draft);
        assert!(!draft.approvers[0].can_approve(&draft, false, &user("u1")));

        let decided = request_with(&[("u1", 10, ApproverStatus::Approved)], RequestState::Pending);
        assert!(!decided.approvers[0].can_approve(&decided, false, &user("u1")));
    }

    #[test]
    fn template_lines_are_never_eligible() {
        let request = request_with(&[("u1", 10, ApproverStatus::Pending)], RequestState::Pending);
        let mut template = ApproverLine::template(CategoryId("c-1".to_string()), user("u1"), 10, 0);
        template.status = ApproverStatus::Pending;

        assert!(template.is_template());
        assert!(!template.can_approve(&request, false, &user("u1")));
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            ApproverStatus::New,
            ApproverStatus::Pending,
            ApproverStatus::Approved,
            ApproverStatus::Refused,
        ] {
            assert_eq!(ApproverStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ApproverStatus::parse("escalated"), None);
    }
}
