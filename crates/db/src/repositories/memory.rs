use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use countersign_core::audit::AuditEvent;
use countersign_core::domain::category::{sort_categories, Category, CategoryId};
use countersign_core::domain::identity::{Employee, InMemoryDirectory, User};
use countersign_core::domain::payment_method::{active_sorted, PaymentMethod};
use countersign_core::domain::request::{ApprovalRequest, RequestId};
use countersign_core::sequence::SequenceFormat;

use super::{
    AuditRepository, CategoryRepository, DirectoryRepository, PaymentMethodRepository,
    RepositoryError, RequestFilter, RequestRepository, SequenceRepository,
};

#[derive(Default)]
pub struct InMemoryCategoryRepository {
    categories: RwLock<HashMap<String, Category>>,
    requests: Option<Arc<InMemoryRequestRepository>>,
}

impl InMemoryCategoryRepository {
    /// Deletion consults `requests` so categories in use are kept.
    pub fn with_requests(requests: Arc<InMemoryRequestRepository>) -> Self {
        Self { categories: RwLock::default(), requests: Some(requests) }
    }
}

#[async_trait::async_trait]
impl CategoryRepository for InMemoryCategoryRepository {
    async fn find_by_id(&self, id: &CategoryId) -> Result<Option<Category>, RepositoryError> {
        let categories = self.categories.read().await;
        Ok(categories.get(&id.0).cloned())
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<Category>, RepositoryError> {
        let categories = self.categories.read().await;
        let mut listed: Vec<Category> = categories
            .values()
            .filter(|category| include_archived || category.active)
            .cloned()
            .collect();
        sort_categories(&mut listed);
        Ok(listed)
    }

    async fn save(&self, category: Category) -> Result<(), RepositoryError> {
        let mut categories = self.categories.write().await;
        categories.insert(category.id.0.clone(), category);
        Ok(())
    }

    async fn delete(&self, id: &CategoryId) -> Result<bool, RepositoryError> {
        if let Some(requests) = &self.requests {
            let filter = RequestFilter {
                category_id: Some(id.clone()),
                include_inactive: true,
                ..RequestFilter::default()
            };
            if !requests.list(&filter).await?.is_empty() {
                return Ok(false);
            }
        }
        let mut categories = self.categories.write().await;
        Ok(categories.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    audit: Arc<InMemoryAuditRepository>,
}

impl InMemoryRequestRepository {
    /// Audit events passed to `save` land in `audit`.
    pub fn with_audit_log(audit: Arc<InMemoryAuditRepository>) -> Self {
        Self { requests: RwLock::default(), audit }
    }
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        let mut listed: Vec<ApprovalRequest> =
            requests.values().filter(|request| filter.matches(request)).cloned().collect();
        listed.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(listed)
    }

    async fn save(
        &self,
        request: &ApprovalRequest,
        audit: &[AuditEvent],
    ) -> Result<u32, RepositoryError> {
        let mut requests = self.requests.write().await;
        let stored_version = match requests.get(&request.id.0) {
            None if request.version == 0 => 1,
            None => {
                return Err(RepositoryError::NotFound {
                    entity: "approval request",
                    id: request.id.0.clone(),
                })
            }
            Some(existing) if existing.version == request.version => request.version + 1,
            Some(_) => {
                return Err(RepositoryError::Conflict {
                    entity: "approval request",
                    id: request.id.0.clone(),
                    expected: request.version,
                })
            }
        };

        let mut stored = request.clone();
        stored.version = stored_version;
        requests.insert(stored.id.0.clone(), stored);
        self.audit.append(audit).await?;
        Ok(stored_version)
    }

    async fn delete(&self, id: &RequestId) -> Result<bool, RepositoryError> {
        let mut requests = self.requests.write().await;
        Ok(requests.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryDirectoryRepository {
    directory: RwLock<InMemoryDirectory>,
}

#[async_trait::async_trait]
impl DirectoryRepository for InMemoryDirectoryRepository {
    async fn save_user(&self, user: User) -> Result<(), RepositoryError> {
        self.directory.write().await.insert_user(user);
        Ok(())
    }

    async fn save_employee(&self, employee: Employee) -> Result<(), RepositoryError> {
        self.directory.write().await.insert_employee(employee);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>, RepositoryError> {
        let directory = self.directory.read().await;
        let mut users: Vec<User> = directory.users().cloned().collect();
        users.sort_by(|left, right| left.name.cmp(&right.name).then_with(|| left.id.cmp(&right.id)));
        Ok(users)
    }

    async fn snapshot(&self) -> Result<InMemoryDirectory, RepositoryError> {
        Ok(self.directory.read().await.clone())
    }
}

#[derive(Default)]
pub struct InMemoryPaymentMethodRepository {
    methods: RwLock<HashMap<String, PaymentMethod>>,
}

#[async_trait::async_trait]
impl PaymentMethodRepository for InMemoryPaymentMethodRepository {
    async fn save(&self, method: PaymentMethod) -> Result<(), RepositoryError> {
        self.methods.write().await.insert(method.id.0.clone(), method);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<PaymentMethod>, RepositoryError> {
        let methods = self.methods.read().await;
        let all: Vec<PaymentMethod> = methods.values().cloned().collect();
        Ok(active_sorted(&all).into_iter().cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemorySequenceRepository {
    sequences: RwLock<HashMap<String, (SequenceFormat, u64)>>,
}

#[async_trait::async_trait]
impl SequenceRepository for InMemorySequenceRepository {
    async fn configure(&self, code: &str, format: &SequenceFormat) -> Result<(), RepositoryError> {
        let mut sequences = self.sequences.write().await;
        let entry = sequences.entry(code.to_owned()).or_insert_with(|| (format.clone(), 1));
        entry.0 = format.clone();
        Ok(())
    }

    async fn next_reference(
        &self,
        code: &str,
        fallback: &SequenceFormat,
    ) -> Result<String, RepositoryError> {
        let mut sequences = self.sequences.write().await;
        let (format, next) = sequences.entry(code.to_owned()).or_insert_with(|| (fallback.clone(), 1));
        let reference = format.format(*next);
        *next += 1;
        Ok(reference)
    }
}

#[derive(Default)]
pub struct InMemoryAuditRepository {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditRepository {
    pub async fn all(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn append(&self, events: &[AuditEvent]) -> Result<(), RepositoryError> {
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn list_for_request(&self, id: &RequestId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|event| event.request_id.as_ref() == Some(id)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use countersign_core::audit::{AuditCategory, AuditContext, AuditOutcome};
    use countersign_core::domain::category::{Category, CategoryId};
    use countersign_core::domain::identity::UserId;
    use countersign_core::domain::request::{ApprovalRequest, RequestId};
    use countersign_core::sequence::SequenceFormat;

    use crate::repositories::{
        AuditRepository, CategoryRepository, InMemoryAuditRepository, InMemoryCategoryRepository,
        InMemoryRequestRepository, InMemorySequenceRepository, RepositoryError, RequestRepository,
        SequenceRepository,
    };

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest::new(
            RequestId(id.to_string()),
            format!("APR/{id}"),
            CategoryId("c-1".to_string()),
            UserId("u-owner".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn in_memory_request_repo_enforces_versions() {
        let repo = InMemoryRequestRepository::default();
        let mut stored = request("r-1");
        assert_eq!(repo.save(&stored, &[]).await.expect("insert"), 1);

        stored.version = 1;
        assert_eq!(repo.save(&stored, &[]).await.expect("update"), 2);
        let error = repo.save(&stored, &[]).await.expect_err("stale");
        assert!(matches!(error, RepositoryError::Conflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn in_memory_request_repo_writes_audit_to_shared_log() {
        let audit = Arc::new(InMemoryAuditRepository::default());
        let repo = InMemoryRequestRepository::with_audit_log(audit.clone());
        let stored = request("r-1");
        let context = AuditContext::new(Some(stored.id.clone()), "corr-1", "u-owner");

        repo.save(
            &stored,
            &[context.event("workflow.request.created", AuditCategory::Workflow, AuditOutcome::Success)],
        )
        .await
        .expect("save");

        assert_eq!(audit.list_for_request(&stored.id).await.expect("audit").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_category_delete_keeps_categories_in_use() {
        let requests = Arc::new(InMemoryRequestRepository::default());
        let categories = InMemoryCategoryRepository::with_requests(requests.clone());
        categories.save(Category::new("c-1", "Purchases")).await.expect("save");
        categories.save(Category::new("c-2", "Travel")).await.expect("save");
        requests.save(&request("r-1"), &[]).await.expect("save request");

        assert!(!categories.delete(&CategoryId("c-1".to_string())).await.expect("delete used"));
        assert!(categories.delete(&CategoryId("c-2".to_string())).await.expect("delete unused"));
        assert_eq!(categories.list(true).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sequence_counts_per_code() {
        let repo = InMemorySequenceRepository::default();
        let fallback = SequenceFormat::default();
        assert_eq!(repo.next_reference("a", &fallback).await.expect("a1"), "APR/00001");
        assert_eq!(repo.next_reference("a", &fallback).await.expect("a2"), "APR/00002");
        assert_eq!(repo.next_reference("b", &fallback).await.expect("b1"), "APR/00001");
    }
}
