use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use countersign_core::domain::approver::ApproverStatus;
use countersign_core::domain::category::CategoryId;
use countersign_core::domain::identity::{Actor, UserId};
use countersign_core::domain::payment_method::PaymentMethodId;
use countersign_core::domain::request::{RequestDraft, RequestState};
use countersign_core::errors::{ApplicationError, WorkflowError};
use countersign_core::host::{HostApprovalStatus, HostDocument, ResourceRef};
use countersign_core::notify::{EmailTemplate, InMemoryNotifier};
use countersign_core::sequence::SequenceFormat;
use countersign_core::workflow::WorkflowSettings;
use countersign_db::repositories::{PaymentMethodRepository, RequestRepository};
use countersign_db::{
    connect_with_settings, migrations, ApprovalService, DemoSeedDataset, ServiceRepositories,
};

struct Harness {
    service: Arc<ApprovalService>,
    notifier: InMemoryNotifier,
}

async fn harness() -> Harness {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    DemoSeedDataset::load(&pool, &SequenceFormat::default()).await.expect("seed");

    let notifier = InMemoryNotifier::default();
    let settings = WorkflowSettings {
        base_url: Some("https://erp.example.com".to_string()),
        ..WorkflowSettings::default()
    };
    let service = ApprovalService::new(
        ServiceRepositories::sql(pool),
        Arc::new(notifier.clone()),
        settings,
        SequenceFormat::default(),
    )
    .expect("service");
    Harness { service: Arc::new(service), notifier }
}

fn purchase_draft(owner: &str) -> RequestDraft {
    let mut draft = RequestDraft::new(CategoryId("cat-purchase".to_string()), UserId(owner.to_string()));
    draft.payload.date = NaiveDate::from_ymd_opt(2026, 3, 2);
    draft.payload.quantity = Some(Decimal::new(3, 0));
    draft.payload.amount = Some(Decimal::new(4_500_00, 2));
    draft.payload.partner_id = Some("partner-acme".to_string());
    draft.payload.product_id = Some("prod-laptop".to_string());
    draft
}

fn trip_draft(owner: &str) -> RequestDraft {
    let mut draft = RequestDraft::new(CategoryId("cat-travel".to_string()), UserId(owner.to_string()));
    draft.payload.date_start = NaiveDate::from_ymd_opt(2026, 4, 6);
    draft.payload.date_end = NaiveDate::from_ymd_opt(2026, 4, 9);
    draft.payload.amount = Some(Decimal::new(1_200, 0));
    draft.payload.location = Some("Lyon".to_string());
    draft
}

#[tokio::test]
async fn sequential_purchase_requires_both_approvers_in_order() {
    let h = harness().await;
    let alice = Actor::user("u-alice");

    let request = h.service.create_request(purchase_draft("u-alice"), &alice, "corr-create").await.expect("create");
    assert_eq!(request.name, "APR/00001");
    let submitted = h.service.submit(&request.id, &alice, "corr-submit").await.expect("submit");
    assert_eq!(submitted.state, RequestState::Pending);
    assert!(submitted.approvers.iter().all(|line| line.status == ApproverStatus::Pending));

    let early = h
        .service
        .approve(&request.id, &Actor::user("u-erin"), "corr-early")
        .await
        .expect_err("erin waits for carol");
    assert!(matches!(early, ApplicationError::Workflow(WorkflowError::Authorization(_))));

    let halfway = h.service.approve(&request.id, &Actor::user("u-carol"), "corr-carol").await.expect("carol");
    assert_eq!(halfway.state, RequestState::Pending);
    let done = h.service.approve(&request.id, &Actor::user("u-erin"), "corr-erin").await.expect("erin");
    assert_eq!(done.state, RequestState::Approved);
    assert!(done.approvers.iter().all(|line| line.decided_at.is_some()));

    let emails = h.notifier.emails();
    assert_eq!(emails.first().map(|email| email.template), Some(EmailTemplate::Submitted));
    assert_eq!(emails.last().map(|email| email.template), Some(EmailTemplate::Approved));
    assert_eq!(emails.last().map(|email| email.to.clone()), Some(vec!["alice@example.com".to_string()]));

    let trail: Vec<String> = h
        .service
        .audit_trail(&request.id)
        .await
        .expect("audit")
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert!(trail.contains(&"workflow.operation_rejected".to_string()));
    assert!(trail.contains(&"workflow.transition_applied".to_string()));
}

#[tokio::test]
async fn missing_fields_keep_the_stored_draft_untouched() {
    let h = harness().await;
    let alice = Actor::user("u-alice");
    let mut draft = purchase_draft("u-alice");
    draft.payload.amount = None;

    let request = h.service.create_request(draft, &alice, "corr-create").await.expect("create");
    let error = h.service.submit(&request.id, &alice, "corr-submit").await.expect_err("amount missing");
    assert!(
        matches!(&error, ApplicationError::Workflow(WorkflowError::Validation(message)) if message.contains("amount"))
    );

    let stored = h.service.request(&request.id, &alice).await.expect("load");
    assert_eq!(stored.state, RequestState::Draft);
    assert_eq!(stored.version, request.version);
    assert!(stored.approvers.iter().all(|line| line.status == ApproverStatus::New));
    assert!(h.notifier.reminders().is_empty());
}

#[tokio::test]
async fn manager_refusal_vetoes_time_off() {
    let h = harness().await;
    let bob = Actor::user("u-bob");
    let mut draft = RequestDraft::new(CategoryId("cat-leave".to_string()), UserId("u-bob".to_string()));
    draft.payload.date_start = NaiveDate::from_ymd_opt(2026, 7, 1);
    draft.payload.date_end = NaiveDate::from_ymd_opt(2026, 7, 14);

    let request = h.service.create_request(draft, &bob, "corr-create").await.expect("create");
    let approvers: Vec<&str> = request.approvers.iter().map(|line| line.user_id.0.as_str()).collect();
    assert_eq!(approvers, vec!["u-carol"]);

    h.service.submit(&request.id, &bob, "corr-submit").await.expect("submit");
    let refused = h
        .service
        .refuse(&request.id, &Actor::user("u-carol"), Some("Release week".to_string()), "corr-refuse")
        .await
        .expect("refuse");

    assert_eq!(refused.state, RequestState::Refused);
    assert_eq!(refused.reason.as_deref(), Some("Release week"));
    let refusal = h.notifier.emails().into_iter().find(|email| email.template == EmailTemplate::Refused);
    assert!(refusal.is_some_and(|email| email.body.contains("Release week")));
}

#[tokio::test]
async fn both_routing_puts_the_manager_ahead_of_templates() {
    let h = harness().await;
    let alice = Actor::user("u-alice");

    let request = h.service.create_request(trip_draft("u-alice"), &alice, "corr-create").await.expect("create");
    let slots: Vec<(&str, i32)> =
        request.approvers.iter().map(|line| (line.user_id.0.as_str(), line.sequence)).collect();
    assert_eq!(slots, vec![("u-carol", 5), ("u-erin", 20)]);
}

#[tokio::test]
async fn concurrent_approvals_are_serialized() {
    let h = harness().await;
    let alice = Actor::user("u-alice");
    let request = h.service.create_request(trip_draft("u-alice"), &alice, "corr-create").await.expect("create");
    h.service.submit(&request.id, &alice, "corr-submit").await.expect("submit");

    let mut handles = Vec::new();
    for approver in ["u-carol", "u-erin"] {
        let service = h.service.clone();
        let id = request.id.clone();
        handles.push(tokio::spawn(async move {
            service.approve(&id, &Actor::user(approver), &format!("corr-{approver}")).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("approve");
    }

    let stored = h.service.request(&request.id, &alice).await.expect("load");
    assert_eq!(stored.state, RequestState::Approved);
    assert_eq!(stored.approved_count(), 2);
    assert_eq!(stored.version, 4);
}

#[tokio::test]
async fn withdraw_returns_to_draft_and_allows_resubmission() {
    let h = harness().await;
    let alice = Actor::user("u-alice");
    let request = h.service.create_request(purchase_draft("u-alice"), &alice, "corr-create").await.expect("create");
    h.service.submit(&request.id, &alice, "corr-submit").await.expect("submit");
    h.service.approve(&request.id, &Actor::user("u-carol"), "corr-carol").await.expect("carol");

    let stranger = h
        .service
        .withdraw(&request.id, &Actor::user("u-bob"), "corr-bob")
        .await
        .expect_err("only the owner withdraws");
    assert!(matches!(stranger, ApplicationError::Workflow(WorkflowError::Authorization(_))));

    let withdrawn = h.service.withdraw(&request.id, &alice, "corr-withdraw").await.expect("withdraw");
    assert_eq!(withdrawn.state, RequestState::Draft);
    assert!(withdrawn.approvers.iter().all(|line| line.status == ApproverStatus::New && line.decided_at.is_none()));

    let resubmitted = h.service.submit(&request.id, &alice, "corr-again").await.expect("resubmit");
    assert_eq!(resubmitted.state, RequestState::Pending);
}

#[tokio::test]
async fn expenses_append_the_employee_manager() {
    let h = harness().await;
    let bob = Actor::user("u-bob");
    let methods = h.service.repositories().payment_methods.list_active().await.expect("methods");
    assert_eq!(methods.len(), 2);

    let mut draft = RequestDraft::new(CategoryId("cat-expense".to_string()), UserId("u-bob".to_string()));
    draft.payload.amount = Some(Decimal::new(89_90, 2));
    draft.payload.reference = Some("INV-2026-114".to_string());
    draft.payload.payment_method_id = Some(PaymentMethodId("pm-card".to_string()));

    let request = h.service.create_request(draft, &bob, "corr-create").await.expect("create");
    let submitted = h.service.submit(&request.id, &bob, "corr-submit").await.expect("submit");
    let slots: Vec<(&str, i32)> =
        submitted.approvers.iter().map(|line| (line.user_id.0.as_str(), line.sequence)).collect();
    assert_eq!(slots, vec![("u-erin", 10), ("u-carol", 20)]);

    let approved = h.service.approve(&request.id, &Actor::user("u-erin"), "corr-erin").await.expect("erin");
    assert_eq!(approved.state, RequestState::Approved);
}

#[tokio::test]
async fn host_documents_are_gated_until_approved() {
    let h = harness().await;
    let bob = Actor::user("u-bob");
    let resource = ResourceRef::new("purchase.order", 1042);
    let document = HostDocument {
        resource: resource.clone(),
        display_name: "PO1042".to_string(),
        amount: Some(Decimal::new(2_400, 0)),
        currency: Some("EUR".to_string()),
        partner_id: Some("partner-acme".to_string()),
    };

    h.service.ensure_host_confirmable(&resource).await.expect("no request yet");
    let request = h.service.create_for_host(&document, "Purchase", &bob, "corr-host").await.expect("create");
    assert_eq!(request.name, "Approval for PO1042");
    assert_eq!(request.category_id.0, "cat-purchase");

    let mut stored = h.service.request(&request.id, &bob).await.expect("load");
    stored.payload.quantity = Some(Decimal::ONE);
    stored.payload.product_id = Some("prod-laptop".to_string());
    let version = h.service.repositories().requests.save(&stored, &[]).await.expect("fill fields");
    assert_eq!(version, 2);

    h.service.submit(&request.id, &bob, "corr-submit").await.expect("submit");
    assert_eq!(h.service.host_status(&resource).await.expect("status"), HostApprovalStatus::ToApprove);
    assert!(h.service.ensure_host_confirmable(&resource).await.is_err());

    h.service.approve(&request.id, &Actor::user("u-carol"), "corr-carol").await.expect("carol");
    h.service.approve(&request.id, &Actor::user("u-erin"), "corr-erin").await.expect("erin");
    assert_eq!(h.service.host_status(&resource).await.expect("status"), HostApprovalStatus::Approved);
    h.service.ensure_host_confirmable(&resource).await.expect("approved");
}

#[tokio::test]
async fn to_review_lists_pending_work_per_approver() {
    let h = harness().await;
    let alice = Actor::user("u-alice");
    let request = h.service.create_request(purchase_draft("u-alice"), &alice, "corr-create").await.expect("create");
    assert!(h.service.to_review(&UserId("u-carol".to_string())).await.expect("review").is_empty());

    h.service.submit(&request.id, &alice, "corr-submit").await.expect("submit");
    assert_eq!(h.service.to_review(&UserId("u-carol".to_string())).await.expect("review").len(), 1);
    assert!(h.service.to_review(&UserId("u-dan".to_string())).await.expect("review").is_empty());
}
