//! Transactional boundary around the approval workflow.
//!
//! Each operation runs under a per-request lock: load, apply the workflow to a staged
//! copy, persist request, lines and audit in one transaction, then deliver the
//! notifications collected on the way. Nothing is delivered for work that did not commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use countersign_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, InMemoryAuditSink,
};
use countersign_core::config::AppConfig;
use countersign_core::domain::approver::ApproverLineId;
use countersign_core::domain::category::{Category, CategoryId, CategoryStats};
use countersign_core::domain::identity::{Actor, InMemoryDirectory, UserId};
use countersign_core::domain::request::{ApprovalRequest, RequestDraft, RequestId, RequestState};
use countersign_core::errors::{ApplicationError, WorkflowError};
use countersign_core::host::{
    ensure_host_confirmable, host_approval_status, host_request_draft, pick_category,
    HostApprovalStatus, HostDocument, ResourceRef,
};
use countersign_core::notify::{MailTemplates, Notifier, OutboxNotifier};
use countersign_core::sequence::{ReferenceSequence, SequenceError, SequenceFormat};
use countersign_core::workflow::{ApprovalWorkflow, WorkflowSettings};

pub use crate::repositories::RequestFilter;
use crate::repositories::{
    AuditRepository, CategoryRepository, DirectoryRepository, InMemoryAuditRepository,
    InMemoryCategoryRepository, InMemoryDirectoryRepository, InMemoryPaymentMethodRepository,
    InMemoryRequestRepository, InMemorySequenceRepository, PaymentMethodRepository,
    RequestRepository, SequenceRepository, SqlAuditRepository, SqlCategoryRepository,
    SqlDirectoryRepository, SqlPaymentMethodRepository, SqlRequestRepository,
    SqlSequenceRepository,
};
use crate::DbPool;

type StagedWorkflow = ApprovalWorkflow<OutboxNotifier, InMemoryAuditSink>;

#[derive(Clone)]
pub struct ServiceRepositories {
    pub categories: Arc<dyn CategoryRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub directory: Arc<dyn DirectoryRepository>,
    pub payment_methods: Arc<dyn PaymentMethodRepository>,
    pub sequences: Arc<dyn SequenceRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl ServiceRepositories {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            categories: Arc::new(SqlCategoryRepository::new(pool.clone())),
            requests: Arc::new(SqlRequestRepository::new(pool.clone())),
            directory: Arc::new(SqlDirectoryRepository::new(pool.clone())),
            payment_methods: Arc::new(SqlPaymentMethodRepository::new(pool.clone())),
            sequences: Arc::new(SqlSequenceRepository::new(pool.clone())),
            audit: Arc::new(SqlAuditRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let audit = Arc::new(InMemoryAuditRepository::default());
        let requests = Arc::new(InMemoryRequestRepository::with_audit_log(audit.clone()));
        Self {
            categories: Arc::new(InMemoryCategoryRepository::with_requests(requests.clone())),
            requests,
            directory: Arc::new(InMemoryDirectoryRepository::default()),
            payment_methods: Arc::new(InMemoryPaymentMethodRepository::default()),
            sequences: Arc::new(InMemorySequenceRepository::default()),
            audit,
        }
    }
}

/// A reference reserved in storage ahead of request creation.
struct ReservedReference(String);

impl ReferenceSequence for ReservedReference {
    fn next_reference(&self, _code: &str) -> Result<String, SequenceError> {
        Ok(self.0.clone())
    }
}

pub struct ApprovalService {
    repositories: ServiceRepositories,
    notifier: Arc<dyn Notifier>,
    templates: MailTemplates,
    settings: WorkflowSettings,
    sequence_format: SequenceFormat,
    locks: Mutex<LockMap>,
}

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive hold on one request; the map entry is pruned by the last holder to drop.
struct RequestLease<'a> {
    locks: &'a Mutex<LockMap>,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RequestLease<'_> {
    fn drop(&mut self) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        drop(self.guard.take());
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl ApprovalService {
    pub fn new(
        repositories: ServiceRepositories,
        notifier: Arc<dyn Notifier>,
        settings: WorkflowSettings,
        sequence_format: SequenceFormat,
    ) -> Result<Self, ApplicationError> {
        let templates = MailTemplates::embedded()
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        Ok(Self {
            repositories,
            notifier,
            templates,
            settings,
            sequence_format,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(
        pool: DbPool,
        config: &AppConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ApplicationError> {
        Self::new(
            ServiceRepositories::sql(pool),
            notifier,
            WorkflowSettings::from_config(config),
            config.sequence.format(),
        )
    }

    pub fn repositories(&self) -> &ServiceRepositories {
        &self.repositories
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub async fn category(&self, id: &CategoryId) -> Result<Category, ApplicationError> {
        self.repositories
            .categories
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("category `{}`", id.0)))
    }

    /// Categories with their request counters, in display order.
    pub async fn list_categories(
        &self,
        include_archived: bool,
    ) -> Result<Vec<(Category, CategoryStats)>, ApplicationError> {
        let categories = self.repositories.categories.list(include_archived).await?;
        let mut listed = Vec::with_capacity(categories.len());
        for category in categories {
            let filter = RequestFilter {
                category_id: Some(category.id.clone()),
                include_inactive: true,
                ..RequestFilter::default()
            };
            let requests = self.repositories.requests.list(&filter).await?;
            let stats = category.stats(&requests);
            listed.push((category, stats));
        }
        Ok(listed)
    }

    /// Administrative path; template approvers are written together with the category.
    pub async fn save_category(
        &self,
        category: Category,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<(), ApplicationError> {
        if !actor.is_admin {
            return Err(WorkflowError::Authorization(format!(
                "user `{}` cannot manage approval categories",
                actor.user_id.0
            ))
            .into());
        }
        category.validate()?;

        let event = AuditContext::new(None, correlation_id, actor.user_id.0.clone())
            .event("category.saved", AuditCategory::Configuration, AuditOutcome::Success)
            .with_metadata("category_id", category.id.0.clone())
            .with_metadata("approval_type", category.approval_type.as_str())
            .with_metadata("approvers", category.template_approvers().len().to_string());
        self.repositories.categories.save(category).await?;
        self.repositories.audit.append(&[event]).await?;
        Ok(())
    }

    pub async fn delete_category(
        &self,
        id: &CategoryId,
        actor: &Actor,
    ) -> Result<(), ApplicationError> {
        if !actor.is_admin {
            return Err(WorkflowError::Authorization(format!(
                "user `{}` cannot manage approval categories",
                actor.user_id.0
            ))
            .into());
        }
        self.category(id).await?;
        if !self.repositories.categories.delete(id).await? {
            return Err(WorkflowError::Validation(format!(
                "category `{}` still has approval requests; archive it instead",
                id.0
            ))
            .into());
        }
        Ok(())
    }

    pub async fn create_request(
        &self,
        mut draft: RequestDraft,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        if !actor.is_admin && actor.user_id != draft.owner_id {
            return Err(WorkflowError::Authorization(format!(
                "user `{}` cannot create requests on behalf of `{}`",
                actor.user_id.0, draft.owner_id.0
            ))
            .into());
        }
        let category = self.category(&draft.category_id).await?;
        let directory = self.repositories.directory.snapshot().await?;

        let name = match draft.name.take().filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => {
                self.repositories
                    .sequences
                    .next_reference(&self.settings.sequence_code, &self.sequence_format)
                    .await?
            }
        };
        draft.name = Some(name.clone());

        let (workflow, outbox, sink) = self.staged_workflow();
        let audit = AuditContext::new(None, correlation_id, actor.user_id.0.clone());
        let mut request = match workflow.create_request(
            draft,
            &category,
            &directory,
            &ReservedReference(name),
            &audit,
        ) {
            Ok(request) => request,
            Err(error) => return Err(self.rejected(&sink, error).await),
        };

        request.version = self.repositories.requests.save(&request, &sink.drain()).await?;
        self.deliver(&outbox, &audit.for_request(&request.id)).await;
        info!(
            event_name = "service.request.created",
            correlation_id,
            request_id = %request.id.0,
            name = %request.name,
            "approval request stored"
        );
        Ok(request)
    }

    /// Opens a request for a host document, picking the category by name hint.
    pub async fn create_for_host(
        &self,
        document: &HostDocument,
        category_hint: &str,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let categories = self.repositories.categories.list(false).await?;
        let category = pick_category(&categories, category_hint).ok_or_else(|| {
            ApplicationError::Workflow(WorkflowError::Configuration(
                "no active approval category is available".to_owned(),
            ))
        })?;
        let draft = host_request_draft(document, category, actor.user_id.clone());
        self.create_request(draft, actor, correlation_id).await
    }

    /// Loads a request the actor may see.
    pub async fn request(
        &self,
        id: &RequestId,
        actor: &Actor,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let request = self.load(id).await?;
        if !request.has_access(actor) {
            return Err(WorkflowError::Authorization(format!(
                "user `{}` cannot read request `{}`",
                actor.user_id.0, request.name
            ))
            .into());
        }
        Ok(request)
    }

    pub async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        Ok(self.repositories.requests.list(filter).await?)
    }

    /// Pending requests listing `user` among their approvers.
    pub async fn to_review(&self, user: &UserId) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        let filter = RequestFilter {
            approver_id: Some(user.clone()),
            state: Some(RequestState::Pending),
            ..RequestFilter::default()
        };
        Ok(self.repositories.requests.list(&filter).await?)
    }

    pub async fn audit_trail(&self, id: &RequestId) -> Result<Vec<AuditEvent>, ApplicationError> {
        Ok(self.repositories.audit.list_for_request(id).await?)
    }

    pub async fn change_category(
        &self,
        id: &RequestId,
        category_id: &CategoryId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let target = self.category(category_id).await?;
        self.run(
            id,
            actor,
            correlation_id,
            "change_category",
            move |workflow, request, _, directory, audit| {
                ensure_owner_or_admin(request, actor, "change the category of")?;
                workflow.change_category(request, &target, directory, audit)
            },
        )
        .await
    }

    pub async fn change_owner(
        &self,
        id: &RequestId,
        owner: UserId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "change_owner",
            move |workflow, request, category, directory, audit| {
                ensure_owner_or_admin(request, actor, "reassign")?;
                workflow.change_owner(request, owner, category, directory, audit)
            },
        )
        .await
    }

    pub async fn commit_approvers(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "commit_approvers",
            |workflow, request, category, directory, audit| {
                ensure_owner_or_admin(request, actor, "resolve approvers of")?;
                workflow.commit_approvers(request, category, directory, audit)
            },
        )
        .await
    }

    pub async fn submit(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "submit",
            |workflow, request, category, directory, audit| {
                workflow.submit(request, category, directory, actor, audit)
            },
        )
        .await
    }

    pub async fn approve(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "approve",
            |workflow, request, category, directory, audit| {
                workflow.approve(request, category, directory, actor, audit)
            },
        )
        .await
    }

    pub async fn approve_line(
        &self,
        id: &RequestId,
        line_id: &ApproverLineId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "approve",
            |workflow, request, category, directory, audit| {
                workflow.approve_line(request, line_id, category, directory, actor, audit)
            },
        )
        .await
    }

    pub async fn refuse(
        &self,
        id: &RequestId,
        actor: &Actor,
        comment: Option<String>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "refuse",
            move |workflow, request, category, directory, audit| {
                workflow.refuse(request, category, directory, actor, comment, audit)
            },
        )
        .await
    }

    pub async fn refuse_line(
        &self,
        id: &RequestId,
        line_id: &ApproverLineId,
        actor: &Actor,
        comment: Option<String>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "refuse",
            move |workflow, request, category, directory, audit| {
                workflow.refuse_line(request, line_id, category, directory, actor, comment, audit)
            },
        )
        .await
    }

    pub async fn withdraw(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "withdraw",
            |workflow, request, category, directory, audit| {
                workflow.withdraw(request, category, directory, actor, audit)
            },
        )
        .await
    }

    pub async fn cancel(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.run(
            id,
            actor,
            correlation_id,
            "cancel",
            |workflow, request, category, directory, audit| {
                workflow.cancel(request, category, directory, actor, audit)
            },
        )
        .await
    }

    /// Drafts and cancelled requests can be removed together with their lines.
    pub async fn delete_request(&self, id: &RequestId, actor: &Actor) -> Result<(), ApplicationError> {
        let _lease = self.lease(id).await;
        async {
            let request = self.load(id).await?;
            ensure_owner_or_admin(&request, actor, "delete")?;
            if !matches!(request.state, RequestState::Draft | RequestState::Cancel) {
                return Err(ApplicationError::from(WorkflowError::State {
                    state: request.state,
                    operation: "delete",
                }));
            }
            self.repositories.requests.delete(id).await?;
            Ok(())
        }
        .await
    }

    pub async fn host_status(
        &self,
        resource: &ResourceRef,
    ) -> Result<HostApprovalStatus, ApplicationError> {
        let filter = RequestFilter::for_source(resource.clone());
        let requests = self.repositories.requests.list(&filter).await?;
        Ok(host_approval_status(&requests))
    }

    pub async fn ensure_host_confirmable(&self, resource: &ResourceRef) -> Result<(), ApplicationError> {
        let filter = RequestFilter::for_source(resource.clone());
        let requests = self.repositories.requests.list(&filter).await?;
        Ok(ensure_host_confirmable(resource, &requests)?)
    }

    async fn load(&self, id: &RequestId) -> Result<ApprovalRequest, ApplicationError> {
        self.repositories
            .requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval request `{}`", id.0)))
    }

    fn staged_workflow(&self) -> (StagedWorkflow, OutboxNotifier, InMemoryAuditSink) {
        let outbox = OutboxNotifier::default();
        let sink = InMemoryAuditSink::default();
        let workflow = ApprovalWorkflow::new(
            outbox.clone(),
            sink.clone(),
            self.templates.clone(),
            self.settings.clone(),
        );
        (workflow, outbox, sink)
    }

    async fn run<F>(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
        operation: &'static str,
        apply: F,
    ) -> Result<ApprovalRequest, ApplicationError>
    where
        F: FnOnce(
                &StagedWorkflow,
                &mut ApprovalRequest,
                &Category,
                &InMemoryDirectory,
                &AuditContext,
            ) -> Result<(), WorkflowError>
            + Send,
    {
        let _lease = self.lease(id).await;
        self.run_locked(id, actor, correlation_id, operation, apply).await
    }

    async fn run_locked<F>(
        &self,
        id: &RequestId,
        actor: &Actor,
        correlation_id: &str,
        operation: &'static str,
        apply: F,
    ) -> Result<ApprovalRequest, ApplicationError>
    where
        F: FnOnce(
                &StagedWorkflow,
                &mut ApprovalRequest,
                &Category,
                &InMemoryDirectory,
                &AuditContext,
            ) -> Result<(), WorkflowError>
            + Send,
    {
        let stored = self.load(id).await?;
        let category = self.category(&stored.category_id).await?;
        let directory = self.repositories.directory.snapshot().await?;
        let audit =
            AuditContext::new(Some(stored.id.clone()), correlation_id, actor.user_id.0.clone());

        let (workflow, outbox, sink) = self.staged_workflow();
        let mut staged = stored.clone();
        if let Err(error) = apply(&workflow, &mut staged, &category, &directory, &audit) {
            return Err(self.rejected(&sink, error).await);
        }

        staged.version = self.repositories.requests.save(&staged, &sink.drain()).await?;
        info!(
            event_name = "service.operation.committed",
            correlation_id,
            request_id = %staged.id.0,
            operation,
            state = staged.state.as_str(),
            version = staged.version,
            "approval operation committed"
        );

        self.deliver(&outbox, &audit).await;
        Ok(staged)
    }

    /// Keeps the audit trail of a rejected operation; the request itself is untouched.
    async fn rejected(&self, sink: &InMemoryAuditSink, error: WorkflowError) -> ApplicationError {
        let events = sink.drain();
        if let Err(persist_error) = self.repositories.audit.append(&events).await {
            warn!(
                event_name = "service.audit.persist_failed",
                error = %persist_error,
                "could not store audit events of a rejected operation"
            );
        }
        ApplicationError::Workflow(error)
    }

    async fn deliver(&self, outbox: &OutboxNotifier, audit: &AuditContext) {
        let failures = outbox.take().dispatch(self.notifier.as_ref());
        if failures.is_empty() {
            return;
        }

        let mut notes = Vec::with_capacity(failures.len());
        for failure in failures {
            warn!(
                event_name = "service.notification.failed",
                correlation_id = %audit.correlation_id,
                error = %failure,
                "notification delivery failed after commit"
            );
            notes.push(
                audit
                    .event("notification.failed", AuditCategory::Notification, AuditOutcome::Failed)
                    .with_metadata("phase", "after_commit")
                    .with_metadata("error", failure.to_string()),
            );
        }
        if let Err(error) = self.repositories.audit.append(&notes).await {
            warn!(
                event_name = "service.audit.persist_failed",
                correlation_id = %audit.correlation_id,
                error = %error,
                "could not store notification failure notes"
            );
        }
    }

    async fn lease(&self, id: &RequestId) -> RequestLease<'_> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(id.0.clone()).or_default().clone()
        };
        RequestLease { locks: &self.locks, key: id.0.clone(), guard: Some(lock.lock_owned().await) }
    }
}

fn ensure_owner_or_admin(
    request: &ApprovalRequest,
    actor: &Actor,
    action: &str,
) -> Result<(), WorkflowError> {
    if actor.is_admin || request.owner_id == actor.user_id {
        Ok(())
    } else {
        Err(WorkflowError::Authorization(format!(
            "only the owner or an administrator can {action} request `{}`",
            request.name
        )))
    }
}
