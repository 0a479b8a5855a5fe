use clap::Subcommand;
use serde_json::json;

use countersign_core::config::LoadOptions;
use countersign_core::domain::category::CategoryId;
use countersign_core::domain::identity::UserId;

use crate::commands::{
    application_failure, correlation_id, execute, to_data, ActorArgs, CommandResult, Reply,
    EXIT_NOT_FOUND,
};

#[derive(Debug, Subcommand)]
pub enum CategoryCommand {
    #[command(about = "List categories with their request counters")]
    List {
        #[arg(long, help = "Include archived categories")]
        all: bool,
    },
    #[command(about = "Show one category with its template approvers")]
    Show { id: String },
    #[command(about = "Add a template approver to a category")]
    AddApprover {
        id: String,
        #[arg(long, value_name = "USER_ID")]
        user: String,
        #[arg(long, default_value_t = 10)]
        sequence: i32,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Remove a template approver from a category")]
    RemoveApprover {
        id: String,
        #[arg(long, value_name = "USER_ID")]
        user: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Hide a category from new requests")]
    Archive {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Delete a category that has no requests")]
    Delete {
        id: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

pub fn run(options: &LoadOptions, command: CategoryCommand) -> CommandResult {
    match command {
        CategoryCommand::List { all } => execute("category list", options, |service| async move {
            let listed = service.list_categories(all).await.map_err(application_failure)?;
            let rows = listed
                .iter()
                .map(|(category, stats)| {
                    json!({
                        "id": category.id.0,
                        "name": category.name,
                        "approval_type": category.approval_type.as_str(),
                        "approval_minimum": category.approval_minimum,
                        "active": category.active,
                        "request_count": stats.request_count,
                        "to_validate_count": stats.to_validate_count,
                    })
                })
                .collect::<Vec<_>>();
            Ok(Reply::new(format!("{} approval categories", rows.len()), json!(rows)))
        }),
        CategoryCommand::Show { id } => execute("category show", options, |service| async move {
            let category =
                service.category(&CategoryId(id)).await.map_err(application_failure)?;
            Ok(Reply::new(format!("category `{}`", category.name), to_data(&category)?))
        }),
        CategoryCommand::AddApprover { id, user, sequence, actor } => {
            execute("category add-approver", options, |service| async move {
                let mut category =
                    service.category(&CategoryId(id)).await.map_err(application_failure)?;
                category.add_template_approver(UserId(user.clone()), sequence);
                service
                    .save_category(category.clone(), &actor.actor(), &correlation_id("category"))
                    .await
                    .map_err(application_failure)?;
                Ok(Reply::new(
                    format!("`{user}` approves `{}` at sequence {sequence}", category.name),
                    to_data(&category)?,
                ))
            })
        }
        CategoryCommand::RemoveApprover { id, user, actor } => {
            execute("category remove-approver", options, |service| async move {
                let mut category =
                    service.category(&CategoryId(id)).await.map_err(application_failure)?;
                if !category.remove_template_approver(&UserId(user.clone())) {
                    return Err((
                        "not_found",
                        format!("`{user}` is not an approver of `{}`", category.name),
                        EXIT_NOT_FOUND,
                    ));
                }
                service
                    .save_category(category.clone(), &actor.actor(), &correlation_id("category"))
                    .await
                    .map_err(application_failure)?;
                Ok(Reply::new(
                    format!("`{user}` removed from `{}`", category.name),
                    to_data(&category)?,
                ))
            })
        }
        CategoryCommand::Archive { id, actor } => {
            execute("category archive", options, |service| async move {
                let mut category =
                    service.category(&CategoryId(id)).await.map_err(application_failure)?;
                category.active = false;
                service
                    .save_category(category.clone(), &actor.actor(), &correlation_id("category"))
                    .await
                    .map_err(application_failure)?;
                Ok(Reply::new(format!("category `{}` archived", category.name), to_data(&category)?))
            })
        }
        CategoryCommand::Delete { id, actor } => {
            execute("category delete", options, |service| async move {
                let id = CategoryId(id);
                service.delete_category(&id, &actor.actor()).await.map_err(application_failure)?;
                Ok(Reply::new(format!("category `{}` deleted", id.0), json!({ "id": id.0 })))
            })
        }
    }
}
