pub mod category;
pub mod config;
pub mod doctor;
pub mod migrate;
pub mod request;
pub mod seed;

use std::future::Future;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

use countersign_core::config::{AppConfig, LoadOptions};
use countersign_core::domain::identity::Actor;
use countersign_core::errors::ApplicationError;
use countersign_core::notify::TracingNotifier;
use countersign_db::{connect_with_config, migrations, ApprovalService, DbPool};

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_DATABASE: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_REJECTED: u8 = 6;
pub const EXIT_NOT_FOUND: u8 = 7;

/// `(error_class, message, exit_code)` carried out of an async command body.
pub(crate) type Failure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub(crate) fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads configuration and builds the single-threaded runtime every command runs on.
pub(crate) fn prepare(
    command: &str,
    options: &LoadOptions,
) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = AppConfig::load(options.clone()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })?;

    let runtime =
        tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            )
        })?;

    Ok((config, runtime))
}

/// Connects and brings the schema up to date.
pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
    Ok(pool)
}

pub(crate) fn open_service(pool: &DbPool, config: &AppConfig) -> Result<ApprovalService, Failure> {
    ApprovalService::from_config(pool.clone(), config, Arc::new(TracingNotifier))
        .map_err(application_failure)
}

/// Message and optional payload of a successful service command.
pub(crate) struct Reply {
    pub message: String,
    pub data: Option<Value>,
}

impl Reply {
    pub fn new(message: impl Into<String>, data: Value) -> Self {
        Self { message: message.into(), data: Some(data) }
    }
}

/// Runs `body` against a migrated database and renders its outcome as a `CommandResult`.
pub(crate) fn execute<F, Fut>(command: &str, options: &LoadOptions, body: F) -> CommandResult
where
    F: FnOnce(ApprovalService) -> Fut,
    Fut: Future<Output = Result<Reply, Failure>>,
{
    let (config, runtime) = match prepare(command, options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let service = open_service(&pool, &config)?;
        let outcome = body(service).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok(reply) => CommandResult::success_with_data(command, reply.message, reply.data),
        Err(failure) => CommandResult::from_failure(command, failure),
    }
}

#[derive(Debug, Clone, Args)]
pub struct ActorArgs {
    #[arg(long = "as", value_name = "USER_ID", help = "User performing the operation")]
    pub user: String,
    #[arg(long, help = "Act with administrator rights")]
    pub admin: bool,
}

impl ActorArgs {
    pub fn actor(&self) -> Actor {
        if self.admin {
            Actor::admin(self.user.clone())
        } else {
            Actor::user(self.user.clone())
        }
    }
}

pub(crate) fn application_failure(error: ApplicationError) -> Failure {
    match error {
        ApplicationError::Workflow(error) => (error.class(), error.to_string(), EXIT_REJECTED),
        ApplicationError::Conflict(message) => ("conflict", message, EXIT_REJECTED),
        ApplicationError::NotFound(message) => ("not_found", message, EXIT_NOT_FOUND),
        ApplicationError::Persistence(message) => ("persistence", message, EXIT_DATABASE),
        ApplicationError::Configuration(message) => {
            ("config_validation", message, EXIT_CONFIG)
        }
    }
}

pub(crate) fn to_data<T: Serialize>(value: &T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|error| ("serialization", error.to_string(), EXIT_RUNTIME))
}

pub(crate) fn correlation_id(command: &str) -> String {
    format!("cli-{command}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use countersign_core::errors::{ApplicationError, WorkflowError};
    use serde_json::Value;

    use super::{application_failure, CommandResult, EXIT_NOT_FOUND, EXIT_REJECTED};

    #[test]
    fn failure_payload_carries_error_class_without_data() {
        let result = CommandResult::failure("request approve", "state", "nope", 6);
        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "state");
        assert!(payload.get("data").is_none());
    }

    #[test]
    fn success_payload_embeds_data() {
        let result = CommandResult::success_with_data(
            "request show",
            "loaded",
            Some(serde_json::json!({ "state": "pending" })),
        );
        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["data"]["state"], "pending");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn application_errors_map_to_documented_exit_codes() {
        let rejected = application_failure(ApplicationError::Workflow(WorkflowError::Validation(
            "missing date".to_string(),
        )));
        assert_eq!((rejected.0, rejected.2), ("validation", EXIT_REJECTED));

        let missing = application_failure(ApplicationError::NotFound("request `x`".to_string()));
        assert_eq!((missing.0, missing.2), ("not_found", EXIT_NOT_FOUND));
    }
}
