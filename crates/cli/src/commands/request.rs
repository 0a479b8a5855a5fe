use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use clap::{Args, Subcommand};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use countersign_core::config::LoadOptions;
use countersign_core::domain::approver::ApproverLineId;
use countersign_core::domain::category::CategoryId;
use countersign_core::domain::identity::UserId;
use countersign_core::domain::payment_method::PaymentMethodId;
use countersign_core::domain::request::{
    ApprovalRequest, RequestDraft, RequestId, RequestPayload, RequestState,
};
use countersign_core::host::{HostDocument, ResourceRef};
use countersign_db::{ApprovalService, RequestFilter};

use crate::commands::{
    application_failure, correlation_id, execute, to_data, ActorArgs, CommandResult, Failure,
    Reply,
};

#[derive(Debug, Subcommand)]
pub enum RequestCommand {
    #[command(about = "Open a draft request; approvers are previewed from the category")]
    Create {
        #[arg(long, value_name = "CATEGORY_ID")]
        category: String,
        #[arg(long, value_name = "USER_ID", help = "Owner of the request (defaults to --as)")]
        owner: Option<String>,
        #[arg(long, help = "Reference to use instead of the next sequence number")]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_name = "MODEL,ID", value_parser = parse_source)]
        source: Option<ResourceRef>,
        #[arg(long, help = "Submit right after creation")]
        submit: bool,
        #[command(flatten)]
        payload: PayloadArgs,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Open a request on behalf of a host document")]
    FromHost {
        #[arg(long, value_name = "MODEL,ID", value_parser = parse_source)]
        source: ResourceRef,
        #[arg(long)]
        display_name: String,
        #[arg(long)]
        amount: Option<Decimal>,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        partner: Option<String>,
        #[arg(long, default_value = "Purchase", help = "Substring of the category name to use")]
        category_hint: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "List requests matching the given filters")]
    List {
        #[arg(long, value_name = "USER_ID")]
        owner: Option<String>,
        #[arg(long, value_name = "USER_ID")]
        approver: Option<String>,
        #[arg(long, value_name = "CATEGORY_ID")]
        category: Option<String>,
        #[arg(long, value_parser = parse_state)]
        state: Option<RequestState>,
        #[arg(long, value_name = "MODEL,ID", value_parser = parse_source)]
        source: Option<ResourceRef>,
        #[arg(long, help = "Include inactive requests")]
        all: bool,
    },
    #[command(about = "Pending requests waiting on a user's decision")]
    ToReview {
        #[arg(long, value_name = "USER_ID")]
        user: String,
    },
    #[command(about = "Show a request with its approver lines")]
    Show {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Show the audit trail of a request")]
    Audit { id: String },
    #[command(about = "Move a draft to another category and preview its approvers again")]
    Recategorize {
        id: String,
        #[arg(long, value_name = "CATEGORY_ID")]
        category: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Hand a draft over to another owner")]
    Reassign {
        id: String,
        #[arg(long, value_name = "USER_ID")]
        owner: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Resolve the definitive approver list of a draft")]
    Resolve {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Submit a draft for approval")]
    Submit {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Approve a pending request")]
    Approve {
        id: String,
        #[arg(long, value_name = "LINE_ID", help = "Decide one approver line explicitly")]
        line: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Refuse a pending request")]
    Refuse {
        id: String,
        #[arg(long, value_name = "LINE_ID", help = "Decide one approver line explicitly")]
        line: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Pull a pending request back to draft")]
    Withdraw {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Cancel a draft or pending request")]
    Cancel {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Delete a draft or cancelled request")]
    Delete {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Approval status of a host document")]
    HostStatus {
        #[arg(long, value_name = "MODEL,ID", value_parser = parse_source)]
        source: ResourceRef,
    },
    #[command(about = "Fail unless the host document may advance")]
    HostCheck {
        #[arg(long, value_name = "MODEL,ID", value_parser = parse_source)]
        source: ResourceRef,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct PayloadArgs {
    #[arg(long, help = "Request date (YYYY-MM-DD); defaults to today")]
    pub date: Option<NaiveDate>,
    #[arg(long)]
    pub date_start: Option<NaiveDate>,
    #[arg(long)]
    pub date_end: Option<NaiveDate>,
    #[arg(long)]
    pub quantity: Option<Decimal>,
    #[arg(long)]
    pub amount: Option<Decimal>,
    #[arg(long)]
    pub currency: Option<String>,
    #[arg(long)]
    pub reference: Option<String>,
    #[arg(long)]
    pub partner: Option<String>,
    #[arg(long)]
    pub location: Option<String>,
    #[arg(long)]
    pub product: Option<String>,
    #[arg(long, value_name = "PAYMENT_METHOD_ID")]
    pub payment_method: Option<String>,
}

impl PayloadArgs {
    /// Overlays the given values on `payload`, keeping its defaults for the rest.
    fn apply(self, payload: &mut RequestPayload) {
        if self.date.is_some() {
            payload.date = self.date;
        }
        payload.date_start = self.date_start;
        payload.date_end = self.date_end;
        payload.quantity = self.quantity;
        payload.amount = self.amount;
        payload.currency = self.currency;
        payload.reference = self.reference;
        payload.partner_id = self.partner;
        payload.location = self.location;
        payload.product_id = self.product;
        payload.payment_method_id = self.payment_method.map(PaymentMethodId);
    }
}

pub fn run(options: &LoadOptions, command: RequestCommand) -> CommandResult {
    match command {
        RequestCommand::Create {
            category,
            owner,
            name,
            description,
            source,
            submit,
            payload,
            actor,
        } => execute("request create", options, |service| async move {
            let owner = owner.unwrap_or_else(|| actor.user.clone());
            let mut draft = RequestDraft::new(CategoryId(category), UserId(owner));
            draft.name = name;
            draft.description = description;
            draft.source = source;
            payload.apply(&mut draft.payload);

            let actor = actor.actor();
            let correlation_id = correlation_id("create");
            let mut request = service
                .create_request(draft, &actor, &correlation_id)
                .await
                .map_err(application_failure)?;
            if submit {
                request = service
                    .submit(&request.id, &actor, &correlation_id)
                    .await
                    .map_err(application_failure)?;
            }
            request_reply(&request)
        }),
        RequestCommand::FromHost {
            source,
            display_name,
            amount,
            currency,
            partner,
            category_hint,
            actor,
        } => execute("request from-host", options, |service| async move {
            let document =
                HostDocument { resource: source, display_name, amount, currency, partner_id: partner };
            let request = service
                .create_for_host(&document, &category_hint, &actor.actor(), &correlation_id("host"))
                .await
                .map_err(application_failure)?;
            request_reply(&request)
        }),
        RequestCommand::List { owner, approver, category, state, source, all } => {
            let filter = RequestFilter {
                owner_id: owner.map(UserId),
                approver_id: approver.map(UserId),
                category_id: category.map(CategoryId),
                state,
                source,
                include_inactive: all,
            };
            execute("request list", options, |service| async move {
                let requests = service.list_requests(&filter).await.map_err(application_failure)?;
                summaries_reply(&requests)
            })
        }
        RequestCommand::ToReview { user } => {
            execute("request to-review", options, |service| async move {
                let requests =
                    service.to_review(&UserId(user)).await.map_err(application_failure)?;
                summaries_reply(&requests)
            })
        }
        RequestCommand::Show { id, actor } => execute("request show", options, |service| async move {
            let request =
                service.request(&RequestId(id), &actor.actor()).await.map_err(application_failure)?;
            request_reply(&request)
        }),
        RequestCommand::Audit { id } => execute("request audit", options, |service| async move {
            let events = service.audit_trail(&RequestId(id)).await.map_err(application_failure)?;
            Ok(Reply::new(format!("{} audit events", events.len()), to_data(&events)?))
        }),
        RequestCommand::Recategorize { id, category, actor } => {
            execute("request recategorize", options, |service| async move {
                let request = service
                    .change_category(
                        &RequestId(id),
                        &CategoryId(category),
                        &actor.actor(),
                        &correlation_id("recategorize"),
                    )
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Reassign { id, owner, actor } => {
            execute("request reassign", options, |service| async move {
                let request = service
                    .change_owner(
                        &RequestId(id),
                        UserId(owner),
                        &actor.actor(),
                        &correlation_id("reassign"),
                    )
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Resolve { id, actor } => {
            execute("request resolve", options, |service| async move {
                let request = service
                    .commit_approvers(&RequestId(id), &actor.actor(), &correlation_id("resolve"))
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Submit { id, actor } => {
            execute("request submit", options, |service| async move {
                let request = service
                    .submit(&RequestId(id), &actor.actor(), &correlation_id("submit"))
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Approve { id, line, actor } => {
            execute("request approve", options, |service| async move {
                decide(&service, RequestId(id), line, &actor, Decision::Approve).await
            })
        }
        RequestCommand::Refuse { id, line, reason, actor } => {
            execute("request refuse", options, |service| async move {
                decide(&service, RequestId(id), line, &actor, Decision::Refuse(reason)).await
            })
        }
        RequestCommand::Withdraw { id, actor } => {
            execute("request withdraw", options, |service| async move {
                let request = service
                    .withdraw(&RequestId(id), &actor.actor(), &correlation_id("withdraw"))
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Cancel { id, actor } => {
            execute("request cancel", options, |service| async move {
                let request = service
                    .cancel(&RequestId(id), &actor.actor(), &correlation_id("cancel"))
                    .await
                    .map_err(application_failure)?;
                request_reply(&request)
            })
        }
        RequestCommand::Delete { id, actor } => {
            execute("request delete", options, |service| async move {
                let id = RequestId(id);
                service.delete_request(&id, &actor.actor()).await.map_err(application_failure)?;
                Ok(Reply::new(format!("request `{}` deleted", id.0), json!({ "id": id.0 })))
            })
        }
        RequestCommand::HostStatus { source } => {
            execute("request host-status", options, |service| async move {
                let status = service.host_status(&source).await.map_err(application_failure)?;
                Ok(Reply::new(
                    format!("{source}: {}", status.as_str()),
                    json!({ "source": source.to_string(), "approval_status": status }),
                ))
            })
        }
        RequestCommand::HostCheck { source } => {
            execute("request host-check", options, |service| async move {
                service.ensure_host_confirmable(&source).await.map_err(application_failure)?;
                Ok(Reply::new(
                    format!("{source} may proceed"),
                    json!({ "source": source.to_string() }),
                ))
            })
        }
    }
}

enum Decision {
    Approve,
    Refuse(Option<String>),
}

async fn decide(
    service: &ApprovalService,
    id: RequestId,
    line: Option<String>,
    actor: &ActorArgs,
    decision: Decision,
) -> Result<Reply, Failure> {
    let actor = actor.actor();
    let correlation_id = correlation_id("decide");
    let line = line.map(ApproverLineId);
    let outcome = match (decision, line) {
        (Decision::Approve, None) => service.approve(&id, &actor, &correlation_id).await,
        (Decision::Approve, Some(line)) => {
            service.approve_line(&id, &line, &actor, &correlation_id).await
        }
        (Decision::Refuse(reason), None) => {
            service.refuse(&id, &actor, reason, &correlation_id).await
        }
        (Decision::Refuse(reason), Some(line)) => {
            service.refuse_line(&id, &line, &actor, reason, &correlation_id).await
        }
    };
    request_reply(&outcome.map_err(application_failure)?)
}

fn request_reply(request: &ApprovalRequest) -> Result<Reply, Failure> {
    let mut data = to_data(request)?;
    if let Value::Object(fields) = &mut data {
        fields.insert("request_status".to_string(), json!(request.state.request_status()));
        fields.insert("approved_count".to_string(), json!(request.approved_count()));
    }
    Ok(Reply::new(
        format!("request `{}` is {}", request.name, request.state.request_status()),
        data,
    ))
}

fn summaries_reply(requests: &[ApprovalRequest]) -> Result<Reply, Failure> {
    let rows = requests
        .iter()
        .map(|request| {
            json!({
                "id": request.id.0,
                "name": request.name,
                "category_id": request.category_id.0,
                "owner_id": request.owner_id.0,
                "state": request.state,
                "approved_count": request.approved_count(),
                "approvers": request.approvers.len(),
            })
        })
        .collect::<Vec<_>>();
    Ok(Reply::new(format!("{} approval requests", rows.len()), json!(rows)))
}

fn parse_source(value: &str) -> anyhow::Result<ResourceRef> {
    let (model, id) = value.split_once(',').context("expected `model,id`")?;
    let model = model.trim();
    if model.is_empty() {
        bail!("resource model must not be empty");
    }
    let id = id.trim().parse::<i64>().with_context(|| format!("`{id}` is not a record id"))?;
    Ok(ResourceRef::new(model, id))
}

fn parse_state(value: &str) -> anyhow::Result<RequestState> {
    RequestState::parse(value).ok_or_else(|| {
        anyhow!("unknown state `{value}` (expected draft|pending|approved|refused|cancel)")
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use countersign_core::domain::request::{RequestPayload, RequestState};
    use rust_decimal::Decimal;

    use super::{parse_source, parse_state, PayloadArgs};

    #[test]
    fn parse_source_reads_model_and_id() {
        let source = parse_source("purchase.order, 42").expect("source");
        assert_eq!(source.model, "purchase.order");
        assert_eq!(source.id, 42);

        assert!(parse_source("purchase.order").is_err());
        assert!(parse_source(",42").is_err());
        assert!(parse_source("purchase.order,abc").is_err());
    }

    #[test]
    fn parse_state_accepts_known_states_only() {
        assert_eq!(parse_state("Pending").expect("state"), RequestState::Pending);
        assert!(parse_state("archived").is_err());
    }

    #[test]
    fn payload_args_keep_default_date_when_not_given() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).expect("date");
        let mut payload = RequestPayload { date: Some(today), ..RequestPayload::default() };
        PayloadArgs {
            amount: Some(Decimal::new(12_500, 2)),
            payment_method: Some("pm-wire".to_string()),
            ..PayloadArgs::default()
        }
        .apply(&mut payload);

        assert_eq!(payload.date, Some(today));
        assert_eq!(payload.amount, Some(Decimal::new(12_500, 2)));
        assert_eq!(payload.payment_method_id.map(|id| id.0).as_deref(), Some("pm-wire"));
    }
}
