//! Request lifecycle operations: creation, submission, line decisions, withdraw and cancel.
//!
//! Every operation validates first and mutates second, so a returned error means the request
//! was left untouched. Notification delivery is best effort: failures are logged and written
//! to the audit trail, never returned.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::config::AppConfig;
use crate::domain::approver::{ApproverLineId, ApproverStatus};
use crate::domain::category::Category;
use crate::domain::identity::{Actor, Directory, UserId};
use crate::domain::request::{ApprovalRequest, RequestDraft, RequestId, RequestPayload, RequestState};
use crate::errors::WorkflowError;
use crate::flows::{
    ApprovalFlow, FlowEngine, RequestEvent, TransitionContext, TransitionOutcome, WorkflowAction,
};
use crate::notify::{
    EmailContext, EmailTemplate, MailTemplates, NotificationError, NotificationMessage, Notifier,
    Reminder, TemplateEmail,
};
use crate::resolution::{ApproverResolver, Resolution};
use crate::sequence::{ReferenceSequence, REQUEST_SEQUENCE_CODE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub notifications_enabled: bool,
    pub from_address: Option<String>,
    pub base_url: Option<String>,
    pub sequence_code: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            from_address: None,
            base_url: None,
            sequence_code: REQUEST_SEQUENCE_CODE.to_owned(),
        }
    }
}

impl WorkflowSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            notifications_enabled: config.notifications.enabled,
            from_address: config.notifications.from_address.clone(),
            base_url: config.notifications.base_url.clone(),
            sequence_code: config.sequence.code.clone(),
        }
    }
}

enum Decision {
    Approve,
    Refuse(Option<String>),
}

impl Decision {
    fn operation(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Refuse(_) => "refuse",
        }
    }
}

pub struct ApprovalWorkflow<N, S> {
    engine: FlowEngine<ApprovalFlow>,
    notifier: N,
    sink: S,
    templates: MailTemplates,
    settings: WorkflowSettings,
}

impl<N, S> ApprovalWorkflow<N, S>
where
    N: Notifier,
    S: AuditSink,
{
    pub fn new(notifier: N, sink: S, templates: MailTemplates, settings: WorkflowSettings) -> Self {
        Self { engine: FlowEngine::default(), notifier, sink, templates, settings }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn audit_sink(&self) -> &S {
        &self.sink
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Builds a draft request with its committed approvers. Explicit names skip the sequence.
    pub fn create_request<D, Q>(
        &self,
        draft: RequestDraft,
        category: &Category,
        directory: &D,
        sequence: &Q,
        audit: &AuditContext,
    ) -> Result<ApprovalRequest, WorkflowError>
    where
        D: Directory + ?Sized,
        Q: ReferenceSequence + ?Sized,
    {
        if draft.category_id != category.id {
            return Err(self.reject(
                audit,
                "create",
                WorkflowError::Validation(format!(
                    "draft references category `{}` but category `{}` was supplied",
                    draft.category_id.0, category.id.0
                )),
            ));
        }
        if !category.active {
            return Err(self.reject(
                audit,
                "create",
                WorkflowError::Validation(format!("category `{}` is archived", category.name)),
            ));
        }
        if let Err(error) = draft.payload.check_period() {
            return Err(self.reject(audit, "create", error));
        }
        let resolution = ApproverResolver::new(directory)
            .commit(category, &draft.owner_id)
            .map_err(|error| self.reject(audit, "create", error.into()))?;

        let name = match draft.name.filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => sequence.next_reference(&self.settings.sequence_code).map_err(|error| {
                self.reject(audit, "create", WorkflowError::Configuration(error.to_string()))
            })?,
        };

        let now = Utc::now();
        let mut request =
            ApprovalRequest::new(RequestId::generate(), name, category.id.clone(), draft.owner_id, now);
        request.state = self.engine.initial_state();
        request.company_id = draft.company_id.or_else(|| category.company_id.clone());
        let date = draft.payload.date.or(request.payload.date);
        request.payload = RequestPayload { date, ..draft.payload };
        request.source = draft.source;
        request.description = draft.description;

        let audit = audit.for_request(&request.id);
        self.record_skipped_slots(&request, category, &resolution, &audit);
        request.approvers = resolution.into_lines(category, &request.id);

        self.sink.emit(
            audit
                .event("workflow.request_created", AuditCategory::Workflow, AuditOutcome::Success)
                .with_metadata("name", request.name.clone())
                .with_metadata("category", category.name.clone())
                .with_metadata("approvers", request.approvers.len().to_string()),
        );
        info!(
            event_name = "workflow.request.created",
            correlation_id = %audit.correlation_id,
            request_id = %request.id.0,
            name = %request.name,
            "approval request created"
        );
        Ok(request)
    }

    pub fn change_category<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        self.ensure_draft(request, "change the category of", &audit)?;
        if !category.active {
            return Err(self.reject(
                &audit,
                "change_category",
                WorkflowError::Validation(format!("category `{}` is archived", category.name)),
            ));
        }

        request.category_id = category.id.clone();
        self.preview_approvers(request, category, directory, &audit);
        request.updated_at = Utc::now();
        self.sink.emit(
            audit
                .event("workflow.category_changed", AuditCategory::Workflow, AuditOutcome::Success)
                .with_metadata("category", category.name.clone()),
        );
        Ok(())
    }

    pub fn change_owner<D>(
        &self,
        request: &mut ApprovalRequest,
        owner: UserId,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        self.ensure_draft(request, "change the owner of", &audit)?;

        request.owner_id = owner;
        self.preview_approvers(request, category, directory, &audit);
        request.updated_at = Utc::now();
        self.sink.emit(
            audit
                .event("workflow.owner_changed", AuditCategory::Workflow, AuditOutcome::Success)
                .with_metadata("owner", request.owner_id.0.clone()),
        );
        Ok(())
    }

    /// Strict resolution; replaces every bound line of a draft request.
    pub fn commit_approvers<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        self.ensure_draft(request, "resolve approvers of", &audit)?;
        self.resolve_committed(request, category, directory, &audit)?;
        request.updated_at = Utc::now();
        self.sink.emit(
            audit
                .event(
                    "resolution.approvers_committed",
                    AuditCategory::Resolution,
                    AuditOutcome::Success,
                )
                .with_metadata("approvers", request.approvers.len().to_string()),
        );
        Ok(())
    }

    pub fn submit<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        actor: &Actor,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        self.ensure_draft(request, RequestEvent::Submit.operation(), &audit)?;
        if !request.has_access(actor) {
            return Err(self.reject(
                &audit,
                "submit",
                WorkflowError::Authorization(format!(
                    "user `{}` cannot submit request `{}`",
                    actor.user_id.0, request.name
                )),
            ));
        }

        let mut staged = request.clone();
        self.resolve_committed(&mut staged, category, directory, &audit)?;
        if let Err(error) = staged.payload.check_period() {
            return Err(self.reject(&audit, "submit", error));
        }

        let context = TransitionContext {
            approver_count: staged.approvers.len(),
            missing_required_fields: staged.payload.missing_fields(&category.required),
        };
        let outcome = self
            .engine
            .apply_with_audit(&staged.state, &RequestEvent::Submit, &context, &self.sink, &audit)
            .map_err(WorkflowError::from)?;

        staged.state = outcome.to;
        staged.updated_at = Utc::now();
        self.run_actions(&outcome, &mut staged, category, directory, &audit, "Request submitted for approval.");
        *request = staged;

        info!(
            event_name = "workflow.request.submitted",
            correlation_id = %audit.correlation_id,
            request_id = %request.id.0,
            approvers = request.approvers.len(),
            "approval request submitted"
        );
        Ok(())
    }

    /// Approves the first line the actor may currently decide.
    pub fn approve<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        actor: &Actor,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let line_id = self.actor_line(request, category, actor, &Decision::Approve, audit)?;
        self.decide(request, &line_id, category, directory, actor, Decision::Approve, audit)
    }

    pub fn approve_line<D>(
        &self,
        request: &mut ApprovalRequest,
        line_id: &ApproverLineId,
        category: &Category,
        directory: &D,
        actor: &Actor,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        self.decide(request, line_id, category, directory, actor, Decision::Approve, audit)
    }

    pub fn refuse<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        actor: &Actor,
        comment: Option<String>,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let decision = Decision::Refuse(comment);
        let line_id = self.actor_line(request, category, actor, &decision, audit)?;
        self.decide(request, &line_id, category, directory, actor, decision, audit)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn refuse_line<D>(
        &self,
        request: &mut ApprovalRequest,
        line_id: &ApproverLineId,
        category: &Category,
        directory: &D,
        actor: &Actor,
        comment: Option<String>,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        self.decide(request, line_id, category, directory, actor, Decision::Refuse(comment), audit)
    }

    /// Threshold comparison; safe to evaluate any number of times.
    pub fn check_auto_approval<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) -> Result<bool, WorkflowError>
    where
        D: Directory + ?Sized,
    {
        if request.state != RequestState::Pending {
            return Ok(false);
        }
        let approved = request.approved_count();
        if approved < category.approval_minimum as usize {
            return Ok(false);
        }

        let audit = audit.for_request(&request.id);
        let outcome = self
            .engine
            .apply_with_audit(
                &request.state,
                &RequestEvent::ThresholdReached,
                &TransitionContext {
                    approver_count: request.approvers.len(),
                    missing_required_fields: Vec::new(),
                },
                &self.sink,
                &audit,
            )
            .map_err(WorkflowError::from)?;

        request.state = outcome.to;
        request.updated_at = Utc::now();
        self.run_actions(&outcome, request, category, directory, &audit, "Request automatically approved.");
        info!(
            event_name = "workflow.request.approved",
            correlation_id = %audit.correlation_id,
            request_id = %request.id.0,
            approved,
            minimum = category.approval_minimum,
            "approval threshold reached"
        );
        Ok(true)
    }

    pub fn withdraw<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        actor: &Actor,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        if request.state != RequestState::Pending {
            return Err(self.reject(
                &audit,
                "withdraw",
                WorkflowError::State {
                    state: request.state,
                    operation: RequestEvent::Withdraw.operation(),
                },
            ));
        }
        if request.owner_id != actor.user_id {
            return Err(self.reject(
                &audit,
                "withdraw",
                WorkflowError::Authorization(
                    "only the request owner can withdraw the request".to_owned(),
                ),
            ));
        }

        let outcome = self
            .engine
            .apply_with_audit(
                &request.state,
                &RequestEvent::Withdraw,
                &TransitionContext::default(),
                &self.sink,
                &audit,
            )
            .map_err(WorkflowError::from)?;
        request.state = outcome.to;
        request.updated_at = Utc::now();
        self.run_actions(&outcome, request, category, directory, &audit, "Request withdrawn.");
        info!(
            event_name = "workflow.request.withdrawn",
            correlation_id = %audit.correlation_id,
            request_id = %request.id.0,
            "approval request withdrawn"
        );
        Ok(())
    }

    pub fn cancel<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        actor: &Actor,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        if !actor.is_admin && request.owner_id != actor.user_id {
            return Err(self.reject(
                &audit,
                "cancel",
                WorkflowError::Authorization(
                    "only the request owner or an administrator can cancel the request".to_owned(),
                ),
            ));
        }

        let outcome = self
            .engine
            .apply_with_audit(
                &request.state,
                &RequestEvent::Cancel,
                &TransitionContext {
                    approver_count: request.approvers.len(),
                    missing_required_fields: Vec::new(),
                },
                &self.sink,
                &audit,
            )
            .map_err(WorkflowError::from)?;
        request.state = outcome.to;
        request.updated_at = Utc::now();
        self.run_actions(&outcome, request, category, directory, &audit, "Request cancelled.");
        info!(
            event_name = "workflow.request.cancelled",
            correlation_id = %audit.correlation_id,
            request_id = %request.id.0,
            "approval request cancelled"
        );
        Ok(())
    }

    fn actor_line(
        &self,
        request: &ApprovalRequest,
        category: &Category,
        actor: &Actor,
        decision: &Decision,
        audit: &AuditContext,
    ) -> Result<ApproverLineId, WorkflowError> {
        let audit = audit.for_request(&request.id);
        if request.state != RequestState::Pending {
            return Err(self.reject(
                &audit,
                decision.operation(),
                WorkflowError::State { state: request.state, operation: decision.operation() },
            ));
        }
        request
            .eligible_line(&actor.user_id, category.approval_sequence)
            .map(|line| line.id.clone())
            .ok_or_else(|| {
                self.reject(
                    &audit,
                    decision.operation(),
                    WorkflowError::Authorization(format!(
                        "you cannot {} this request",
                        decision.operation()
                    )),
                )
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn decide<D>(
        &self,
        request: &mut ApprovalRequest,
        line_id: &ApproverLineId,
        category: &Category,
        directory: &D,
        actor: &Actor,
        decision: Decision,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let audit = audit.for_request(&request.id);
        let operation = decision.operation();
        let Some(line) = request.approver(line_id) else {
            return Err(self.reject(
                &audit,
                operation,
                WorkflowError::Validation(format!(
                    "approver line `{}` does not belong to request `{}`",
                    line_id.0, request.name
                )),
            ));
        };
        if line.is_template() {
            return Err(self.reject(
                &audit,
                operation,
                WorkflowError::Validation(format!("cannot {operation} a category-level approver")),
            ));
        }
        if request.state != RequestState::Pending {
            return Err(self.reject(
                &audit,
                operation,
                WorkflowError::State { state: request.state, operation },
            ));
        }
        if !line.can_approve(request, category.approval_sequence, &actor.user_id) {
            return Err(self.reject(
                &audit,
                operation,
                WorkflowError::Authorization(format!("you cannot {operation} this request")),
            ));
        }
        let sequence = line.sequence;
        let now = Utc::now();

        match decision {
            Decision::Approve => {
                if let Some(line) = request.approver_mut(line_id) {
                    line.status = ApproverStatus::Approved;
                    line.decided_at.get_or_insert(now);
                }
                request.updated_at = now;
                self.sink.emit(
                    audit
                        .event("workflow.line_approved", AuditCategory::Workflow, AuditOutcome::Success)
                        .with_metadata("user", actor.user_id.0.clone())
                        .with_metadata("sequence", sequence.to_string()),
                );
                info!(
                    event_name = "workflow.line.approved",
                    correlation_id = %audit.correlation_id,
                    request_id = %request.id.0,
                    user_id = %actor.user_id.0,
                    "approver line approved"
                );
                self.check_auto_approval(request, category, directory, &audit)?;
            }
            Decision::Refuse(comment) => {
                let outcome = self
                    .engine
                    .apply_with_audit(
                        &request.state,
                        &RequestEvent::Veto,
                        &TransitionContext::default(),
                        &self.sink,
                        &audit,
                    )
                    .map_err(WorkflowError::from)?;
                if let Some(line) = request.approver_mut(line_id) {
                    line.status = ApproverStatus::Refused;
                    line.decided_at = Some(now);
                    line.comment = comment.clone();
                }
                request.state = outcome.to;
                request.reason = comment.clone();
                request.updated_at = now;

                let mut note =
                    format!("Request refused by {}.", directory.display_name(&actor.user_id));
                if let Some(comment) = comment.as_deref().filter(|text| !text.trim().is_empty()) {
                    note.push('\n');
                    note.push_str(comment);
                }
                self.run_actions(&outcome, request, category, directory, &audit, &note);
                info!(
                    event_name = "workflow.request.refused",
                    correlation_id = %audit.correlation_id,
                    request_id = %request.id.0,
                    user_id = %actor.user_id.0,
                    "approval request refused"
                );
            }
        }
        Ok(())
    }

    fn ensure_draft(
        &self,
        request: &ApprovalRequest,
        operation: &'static str,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError> {
        if request.state == RequestState::Draft {
            return Ok(());
        }
        Err(self.reject(audit, operation, WorkflowError::State { state: request.state, operation }))
    }

    fn preview_approvers<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) where
        D: Directory + ?Sized,
    {
        let resolution = ApproverResolver::new(directory).preview(category, &request.owner_id);
        for note in &resolution.notes {
            debug!(
                event_name = "resolution.preview.partial",
                correlation_id = %audit.correlation_id,
                request_id = %request.id.0,
                note = %note,
                "approver preview is incomplete"
            );
        }
        request.approvers = resolution.into_lines(category, &request.id);
    }

    fn resolve_committed<D>(
        &self,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        D: Directory + ?Sized,
    {
        let resolution: Resolution = ApproverResolver::new(directory)
            .commit(category, &request.owner_id)
            .map_err(|error| self.reject(audit, "resolve_approvers", error.into()))?;
        self.record_skipped_slots(request, category, &resolution, audit);
        request.approvers = resolution.into_lines(category, &request.id);
        Ok(())
    }

    fn record_skipped_slots(
        &self,
        request: &ApprovalRequest,
        category: &Category,
        resolution: &Resolution,
        audit: &AuditContext,
    ) {
        for note in &resolution.notes {
            warn!(
                event_name = "resolution.manager_skipped",
                correlation_id = %audit.correlation_id,
                request_id = %request.id.0,
                category = %category.name,
                note = %note,
                "approver slot omitted during resolution"
            );
            self.sink.emit(
                audit
                    .event("resolution.manager_skipped", AuditCategory::Resolution, AuditOutcome::Success)
                    .with_metadata("note", note.clone()),
            );
        }
    }

    fn reject(&self, audit: &AuditContext, operation: &str, error: WorkflowError) -> WorkflowError {
        self.sink.emit(
            audit
                .event("workflow.operation_rejected", AuditCategory::Workflow, AuditOutcome::Rejected)
                .with_metadata("operation", operation.to_owned())
                .with_metadata("error_class", error.class())
                .with_metadata("error", error.to_string()),
        );
        info!(
            event_name = "workflow.operation.rejected",
            correlation_id = %audit.correlation_id,
            operation,
            error_class = error.class(),
            error = %error,
            "workflow operation rejected"
        );
        error
    }

    fn run_actions<D>(
        &self,
        outcome: &TransitionOutcome,
        request: &mut ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
        note: &str,
    ) where
        D: Directory + ?Sized,
    {
        for action in &outcome.actions {
            match action {
                WorkflowAction::MarkApproversPending => {
                    request.set_all_statuses(ApproverStatus::Pending);
                }
                WorkflowAction::ResetApprovers => {
                    for line in &mut request.approvers {
                        line.status = ApproverStatus::New;
                        line.decided_at = None;
                        line.comment = None;
                    }
                }
                WorkflowAction::NotifyApprovers => {
                    self.notify_approvers(request, category, directory, audit);
                }
                WorkflowAction::PostNote => {
                    let result = self.notifier.notify(NotificationMessage {
                        request_id: request.id.clone(),
                        recipients: Vec::new(),
                        subject: None,
                        body: note.to_owned(),
                    });
                    self.deliver(audit, "note", result);
                }
                WorkflowAction::SendSubmittedEmail => {
                    let mut recipients: Vec<String> = Vec::new();
                    for line in &request.approvers {
                        if let Some(email) = directory.email(&line.user_id) {
                            if !recipients.contains(&email) {
                                recipients.push(email);
                            }
                        }
                    }
                    self.send_email(request, category, directory, EmailTemplate::Submitted, recipients, audit);
                }
                WorkflowAction::SendApprovedEmail => {
                    let recipients = directory.email(&request.owner_id).into_iter().collect();
                    self.send_email(request, category, directory, EmailTemplate::Approved, recipients, audit);
                }
                WorkflowAction::SendRefusedEmail => {
                    let recipients = directory.email(&request.owner_id).into_iter().collect();
                    self.send_email(request, category, directory, EmailTemplate::Refused, recipients, audit);
                }
            }
        }
    }

    fn notify_approvers<D>(
        &self,
        request: &ApprovalRequest,
        category: &Category,
        directory: &D,
        audit: &AuditContext,
    ) where
        D: Directory + ?Sized,
    {
        let pending: Vec<&UserId> = request
            .approvers
            .iter()
            .filter(|line| line.status == ApproverStatus::Pending)
            .map(|line| &line.user_id)
            .collect();
        if pending.is_empty() {
            return;
        }

        let date = request.payload.date.map(|date| date.format("%Y-%m-%d").to_string());
        let body = format!(
            "A new approval request {} has been submitted and requires your approval.\nCategory: {}\nRequest Owner: {}\nDate: {}\nPlease review and take action on this request.",
            request.name,
            category.name,
            directory.display_name(&request.owner_id),
            date.unwrap_or_default(),
        );
        let result = self.notifier.notify(NotificationMessage {
            request_id: request.id.clone(),
            recipients: pending.iter().map(|user| (*user).clone()).collect(),
            subject: Some(format!("Approval Request: {}", request.name)),
            body,
        });
        self.deliver(audit, "message", result);

        for user in pending {
            let result = self.notifier.schedule_reminder(Reminder {
                request_id: request.id.clone(),
                user_id: user.clone(),
                summary: format!("Approval Request: {}", request.name),
                note: format!("Please review and approve the request: {}", request.name),
            });
            self.deliver(audit, "reminder", result);
        }
    }

    fn send_email<D>(
        &self,
        request: &ApprovalRequest,
        category: &Category,
        directory: &D,
        template: EmailTemplate,
        recipients: Vec<String>,
        audit: &AuditContext,
    ) where
        D: Directory + ?Sized,
    {
        if !self.settings.notifications_enabled {
            debug!(
                event_name = "workflow.email.disabled",
                request_id = %request.id.0,
                template = template.key(),
                "email notifications disabled"
            );
            return;
        }
        if recipients.is_empty() {
            return;
        }

        let context = self.email_context(request, category, directory);
        let result = self.templates.render(template, &context).and_then(|(subject, body)| {
            self.notifier.send_template_email(TemplateEmail {
                template,
                request_id: request.id.clone(),
                to: recipients,
                from: self
                    .settings
                    .from_address
                    .clone()
                    .or_else(|| directory.email(&request.owner_id)),
                subject,
                body,
            })
        });
        self.deliver(audit, template.key(), result);
    }

    fn email_context<D>(
        &self,
        request: &ApprovalRequest,
        category: &Category,
        directory: &D,
    ) -> EmailContext
    where
        D: Directory + ?Sized,
    {
        let amount = request.payload.amount.map(|amount| match &request.payload.currency {
            Some(currency) => format!("{amount} {currency}"),
            None => amount.to_string(),
        });
        EmailContext {
            request_name: request.name.clone(),
            category_name: category.name.clone(),
            owner_name: directory.display_name(&request.owner_id),
            date: request.payload.date.map(|date| date.format("%Y-%m-%d").to_string()),
            amount,
            reason: request.reason.clone(),
            link: self.settings.base_url.as_deref().map(|base| request.request_link(base)),
        }
    }

    fn deliver(&self, audit: &AuditContext, channel: &str, result: Result<(), NotificationError>) {
        let Err(error) = result else {
            return;
        };
        warn!(
            event_name = "workflow.notification.failed",
            correlation_id = %audit.correlation_id,
            channel,
            error = %error,
            "notification delivery failed"
        );
        self.sink.emit(
            audit
                .event("notification.failed", AuditCategory::Notification, AuditOutcome::Failed)
                .with_metadata("channel", channel.to_owned())
                .with_metadata("error", error.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ApprovalWorkflow, WorkflowSettings};
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::approver::ApproverStatus;
    use crate::domain::category::{ApprovalType, Category};
    use crate::domain::identity::{Actor, InMemoryDirectory, UserId};
    use crate::domain::request::{ApprovalRequest, RequestDraft, RequestState};
    use crate::errors::WorkflowError;
    use crate::notify::{EmailTemplate, InMemoryNotifier, MailTemplates};
    use crate::sequence::InMemoryReferenceSequence;

    type TestWorkflow = ApprovalWorkflow<InMemoryNotifier, InMemoryAuditSink>;

    fn workflow_with(notifier: InMemoryNotifier) -> TestWorkflow {
        ApprovalWorkflow::new(
            notifier,
            InMemoryAuditSink::default(),
            MailTemplates::embedded().expect("templates compile"),
            WorkflowSettings {
                base_url: Some("https://erp.example.com".to_owned()),
                ..WorkflowSettings::default()
            },
        )
    }

    fn workflow() -> TestWorkflow {
        workflow_with(InMemoryNotifier::default())
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_owned())
    }

    fn audit() -> AuditContext {
        AuditContext::new(None, "req-test", "test")
    }

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::default()
            .with_user("u-owner", "Olivia Owner", Some("olivia@example.com"))
            .with_user("u1", "Ursula One", Some("u1@example.com"))
            .with_user("u2", "Umar Two", Some("u2@example.com"))
            .with_user("u3", "Uma Three", None)
            .with_user("u-boss", "Bea Boss", Some("boss@example.com"))
            .with_employee("e-owner", Some("u-owner"), Some("e-boss"))
            .with_employee("e-boss", Some("u-boss"), None)
    }

    fn three_step_category(sequential: bool) -> Category {
        let mut category = Category::new("c-1", "Purchases");
        category.approval_minimum = 2;
        category.approval_sequence = sequential;
        category.add_template_approver(user("u1"), 10);
        category.add_template_approver(user("u2"), 20);
        category.add_template_approver(user("u3"), 30);
        category
    }

    fn create(workflow: &TestWorkflow, category: &Category, dir: &InMemoryDirectory) -> ApprovalRequest {
        workflow
            .create_request(
                RequestDraft::new(category.id.clone(), user("u-owner")),
                category,
                dir,
                &InMemoryReferenceSequence::default(),
                &audit(),
            )
            .expect("request created")
    }

    fn submitted(workflow: &TestWorkflow, category: &Category, dir: &InMemoryDirectory) -> ApprovalRequest {
        let mut request = create(workflow, category, dir);
        workflow
            .submit(&mut request, category, dir, &Actor::user("u-owner"), &audit())
            .expect("request submitted");
        request
    }

    fn status_of(request: &ApprovalRequest, id: &str) -> ApproverStatus {
        request
            .approvers
            .iter()
            .find(|line| line.user_id.0 == id)
            .map(|line| line.status)
            .expect("line exists")
    }

    #[test]
    fn create_names_request_from_sequence_and_commits_approvers() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);

        let request = create(&workflow, &category, &dir);
        assert_eq!(request.name, "APR/00001");
        assert_eq!(request.state, RequestState::Draft);
        assert_eq!(request.approvers.len(), 3);
        assert!(request.approvers.iter().all(|line| line.status == ApproverStatus::New));

        let mut draft = RequestDraft::new(category.id.clone(), user("u-owner"));
        draft.name = Some("Laptop refresh".to_owned());
        let named = workflow
            .create_request(draft, &category, &dir, &InMemoryReferenceSequence::default(), &audit())
            .expect("named request");
        assert_eq!(named.name, "Laptop refresh");
    }

    #[test]
    fn threshold_approval_leaves_remaining_lines_pending() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = submitted(&workflow, &category, &dir);

        assert_eq!(request.state, RequestState::Pending);
        assert!(request.approvers.iter().all(|line| line.status == ApproverStatus::Pending));

        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u2"), &audit())
            .expect("u2 approves");
        assert_eq!(request.approved_count(), 1);
        assert_eq!(request.state, RequestState::Pending);

        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect("u1 approves");
        assert_eq!(request.state, RequestState::Approved);
        assert_eq!(status_of(&request, "u3"), ApproverStatus::Pending);

        let approved_emails: Vec<_> = workflow
            .notifier()
            .emails()
            .into_iter()
            .filter(|email| email.template == EmailTemplate::Approved)
            .collect();
        assert_eq!(approved_emails.len(), 1);
        assert_eq!(approved_emails[0].to, vec!["olivia@example.com".to_owned()]);
        assert!(approved_emails[0].body.contains("https://erp.example.com/requests/"));
    }

    #[test]
    fn auto_approval_check_is_idempotent() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = submitted(&workflow, &category, &dir);

        for approver in ["u1", "u2"] {
            workflow
                .approve(&mut request, &category, &dir, &Actor::user(approver), &audit())
                .expect("approve");
        }
        let snapshot = request.clone();

        let changed = workflow
            .check_auto_approval(&mut request, &category, &dir, &audit())
            .expect("check");
        assert!(!changed);
        assert_eq!(request, snapshot);
    }

    #[test]
    fn sequential_categories_gate_higher_sequences() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(true);
        let mut request = submitted(&workflow, &category, &dir);

        let error = workflow
            .approve(&mut request, &category, &dir, &Actor::user("u2"), &audit())
            .expect_err("u2 must wait for u1");
        assert!(matches!(error, WorkflowError::Authorization(_)));
        assert_eq!(status_of(&request, "u2"), ApproverStatus::Pending);

        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect("u1 approves");
        assert!(request.eligible_line(&user("u2"), true).is_some());
        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u2"), &audit())
            .expect("u2 approves after u1");
        assert_eq!(request.state, RequestState::Approved);
    }

    #[test]
    fn manager_category_without_employee_record_is_not_created() {
        let workflow = workflow();
        let dir = InMemoryDirectory::default().with_user("u-owner", "Olivia Owner", None);
        let mut category = Category::new("c-2", "Leave");
        category.approval_type = ApprovalType::Manager;
        let sequence = InMemoryReferenceSequence::default();

        let error = workflow
            .create_request(
                RequestDraft::new(category.id.clone(), user("u-owner")),
                &category,
                &dir,
                &sequence,
                &audit(),
            )
            .expect_err("no manager");
        assert!(matches!(error, WorkflowError::Configuration(ref message) if message.contains("u-owner")));
        assert!(workflow
            .audit_sink()
            .event_types()
            .contains(&"workflow.operation_rejected".to_owned()));

        let category = three_step_category(false);
        let request = workflow
            .create_request(
                RequestDraft::new(category.id.clone(), user("u-owner")),
                &category,
                &dir,
                &sequence,
                &audit(),
            )
            .expect("created");
        assert_eq!(request.name, "APR/00001", "rejected creates do not consume a reference");
    }

    #[test]
    fn draft_without_approvers_cannot_be_cancelled() {
        let workflow = workflow();
        let dir = directory();
        let mut category = Category::new("c-2", "Leave");
        category.approval_type = ApprovalType::Manager;

        let mut request = create(&workflow, &category, &dir);
        workflow
            .change_owner(&mut request, user("u-boss"), &category, &dir, &audit())
            .expect("owner changed");
        assert!(request.approvers.is_empty());

        let error = workflow
            .cancel(&mut request, &category, &dir, &Actor::user("u-boss"), &audit())
            .expect_err("no approver lines");
        assert!(matches!(error, WorkflowError::Configuration(_)));
        assert_eq!(request.state, RequestState::Draft);
    }

    #[test]
    fn missing_fields_block_submit_without_side_effects() {
        let workflow = workflow();
        let dir = directory();
        let mut category = three_step_category(false);
        category.required.amount = true;
        category.required.reference = true;

        let mut request = create(&workflow, &category, &dir);
        let before = request.clone();
        let error = workflow
            .submit(&mut request, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect_err("missing fields");

        assert!(matches!(error, WorkflowError::Validation(ref message) if message.contains("amount")));
        assert_eq!(request, before);
        assert!(workflow.notifier().messages().is_empty());

        request.payload.amount = Some(Decimal::new(42_000, 2));
        request.payload.reference = Some("PO-7".to_owned());
        workflow
            .submit(&mut request, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect("complete request submits");
        assert_eq!(request.state, RequestState::Pending);
    }

    #[test]
    fn submit_notifies_each_pending_approver() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let request = submitted(&workflow, &category, &dir);

        let messages = workflow.notifier().messages();
        let addressed = messages.iter().find(|message| !message.recipients.is_empty()).expect("message");
        assert_eq!(addressed.recipients.len(), 3);
        assert!(addressed.body.contains(&request.name));
        assert_eq!(workflow.notifier().reminders().len(), 3);

        let emails = workflow.notifier().emails();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].template, EmailTemplate::Submitted);
        assert_eq!(emails[0].to, vec!["u1@example.com".to_owned(), "u2@example.com".to_owned()]);
    }

    #[test]
    fn single_refusal_vetoes_the_request() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = submitted(&workflow, &category, &dir);

        workflow
            .refuse(&mut request, &category, &dir, &Actor::user("u3"), Some("Over budget".to_owned()), &audit())
            .expect("u3 refuses");

        assert_eq!(request.state, RequestState::Refused);
        assert_eq!(request.reason.as_deref(), Some("Over budget"));
        assert_eq!(status_of(&request, "u3"), ApproverStatus::Refused);
        assert_eq!(status_of(&request, "u1"), ApproverStatus::Pending);
        assert!(workflow
            .notifier()
            .messages()
            .iter()
            .any(|message| message.body.starts_with("Request refused by Uma Three.")));
        assert!(workflow.notifier().emails().iter().any(|email| email.template == EmailTemplate::Refused));

        let error = workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect_err("refused is terminal");
        assert!(matches!(error, WorkflowError::State { state: RequestState::Refused, .. }));
    }

    #[test]
    fn withdraw_resets_lines_and_is_owner_only() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = submitted(&workflow, &category, &dir);
        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect("u1 approves");

        let error = workflow
            .withdraw(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect_err("approver cannot withdraw");
        assert!(matches!(error, WorkflowError::Authorization(_)));

        workflow
            .withdraw(&mut request, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect("owner withdraws");
        assert_eq!(request.state, RequestState::Draft);
        assert!(request.approvers.iter().all(|line| line.status == ApproverStatus::New));
        assert!(request.approvers.iter().all(|line| line.decided_at.is_none()));

        let error = workflow
            .withdraw(&mut request, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect_err("draft cannot be withdrawn");
        assert!(matches!(error, WorkflowError::State { state: RequestState::Draft, operation: "withdraw" }));
    }

    #[test]
    fn cancel_is_rejected_for_decided_requests() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);

        let mut draft = create(&workflow, &category, &dir);
        workflow
            .cancel(&mut draft, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect("draft cancels");
        assert_eq!(draft.state, RequestState::Cancel);

        let mut pending = submitted(&workflow, &category, &dir);
        workflow
            .cancel(&mut pending, &category, &dir, &Actor::admin("u-root"), &audit())
            .expect("pending cancels");
        assert_eq!(pending.state, RequestState::Cancel);

        let mut refused = submitted(&workflow, &category, &dir);
        workflow
            .refuse(&mut refused, &category, &dir, &Actor::user("u1"), None, &audit())
            .expect("refused");
        let error = workflow
            .cancel(&mut refused, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect_err("refused cannot be cancelled");
        assert_eq!(error, WorkflowError::State { state: RequestState::Refused, operation: "cancel" });
    }

    #[test]
    fn email_failures_are_audited_not_raised() {
        let workflow = workflow_with(InMemoryNotifier::failing_emails());
        let dir = directory();
        let category = three_step_category(false);

        let request = submitted(&workflow, &category, &dir);
        assert_eq!(request.state, RequestState::Pending);
        assert!(workflow
            .audit_sink()
            .event_types()
            .contains(&"notification.failed".to_owned()));
    }

    #[test]
    fn both_without_manager_submits_with_an_audit_note() {
        let workflow = workflow();
        let dir = directory().with_user("u-loner", "Lone Ranger", None).with_employee(
            "e-loner",
            Some("u-loner"),
            None,
        );
        let mut category = Category::new("c-3", "Travel");
        category.approval_type = ApprovalType::Both;
        category.add_template_approver(user("u1"), 10);

        let mut request = workflow
            .create_request(
                RequestDraft::new(category.id.clone(), user("u-loner")),
                &category,
                &dir,
                &InMemoryReferenceSequence::default(),
                &audit(),
            )
            .expect("created");
        workflow
            .submit(&mut request, &category, &dir, &Actor::user("u-loner"), &audit())
            .expect("templates are enough");

        assert_eq!(request.approvers.len(), 1);
        assert_eq!(request.approvers[0].sequence, 20);
        assert!(workflow
            .audit_sink()
            .event_types()
            .contains(&"resolution.manager_skipped".to_owned()));
    }

    #[test]
    fn approving_a_draft_is_a_state_error() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = create(&workflow, &category, &dir);

        let error = workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect_err("draft");
        assert_eq!(error, WorkflowError::State { state: RequestState::Draft, operation: "approve" });

        let line_id = request.approvers[0].id.clone();
        let error = workflow
            .approve_line(&mut request, &line_id, &category, &dir, &Actor::user("u1"), &audit())
            .expect_err("draft");
        assert!(matches!(error, WorkflowError::State { .. }));
    }

    #[test]
    fn line_decisions_require_the_assigned_user() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut request = submitted(&workflow, &category, &dir);
        let u1_line = request
            .approvers
            .iter()
            .find(|line| line.user_id.0 == "u1")
            .map(|line| line.id.clone())
            .expect("u1 line");

        let error = workflow
            .refuse_line(&mut request, &u1_line, &category, &dir, &Actor::user("u2"), None, &audit())
            .expect_err("not u2's line");
        assert!(matches!(error, WorkflowError::Authorization(_)));

        workflow
            .approve_line(&mut request, &u1_line, &category, &dir, &Actor::user("u1"), &audit())
            .expect("u1 approves own line");
        let decided = request.approver(&u1_line).expect("line");
        assert_eq!(decided.status, ApproverStatus::Approved);
        assert!(decided.decided_at.is_some());
    }

    #[test]
    fn draft_edits_rerun_the_preview() {
        let workflow = workflow();
        let dir = directory();
        let category = three_step_category(false);
        let mut manager_category = Category::new("c-2", "Leave");
        manager_category.approval_type = ApprovalType::Manager;

        let mut request = create(&workflow, &category, &dir);
        workflow
            .change_category(&mut request, &manager_category, &dir, &audit())
            .expect("category changed");
        assert_eq!(request.approvers.len(), 1);
        assert_eq!(request.approvers[0].user_id, user("u-boss"));

        workflow
            .change_owner(&mut request, user("u-boss"), &manager_category, &dir, &audit())
            .expect("owner changed");
        assert!(request.approvers.is_empty(), "the boss has no manager");

        let mut pending = submitted(&workflow, &category, &dir);
        let error = workflow
            .change_owner(&mut pending, user("u1"), &category, &dir, &audit())
            .expect_err("pending requests are frozen");
        assert!(matches!(error, WorkflowError::State { state: RequestState::Pending, .. }));
    }

    #[test]
    fn requester_approval_slot_comes_first() {
        let workflow = workflow();
        let dir = directory();
        let mut category = three_step_category(true);
        category.require_my_approval = true;

        let mut request = submitted(&workflow, &category, &dir);
        assert_eq!(request.approvers[0].user_id, user("u-owner"));
        assert_eq!(request.approvers[0].sequence, 0);

        let error = workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect_err("owner decides first");
        assert!(matches!(error, WorkflowError::Authorization(_)));
        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u-owner"), &audit())
            .expect("owner approves");
        workflow
            .approve(&mut request, &category, &dir, &Actor::user("u1"), &audit())
            .expect("u1 approves next");
        assert_eq!(request.state, RequestState::Approved);
    }
}
