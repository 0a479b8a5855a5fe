use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;

use countersign_core::domain::approver::{ApproverLine, ApproverLineId, ApproverStatus};
use countersign_core::domain::category::{Category, CategoryId};
use countersign_core::domain::identity::{Employee, InMemoryDirectory, User, UserId};
use countersign_core::domain::payment_method::PaymentMethod;
use countersign_core::domain::request::{ApprovalRequest, RequestId, RequestState};
use countersign_core::errors::ApplicationError;
use countersign_core::host::ResourceRef;
use countersign_core::sequence::SequenceFormat;
use countersign_core::AuditEvent;

pub mod audit;
pub mod category;
pub mod directory;
pub mod memory;
pub mod payment_method;
pub mod request;
pub mod sequence;

pub use audit::SqlAuditRepository;
pub use category::SqlCategoryRepository;
pub use directory::SqlDirectoryRepository;
pub use memory::{
    InMemoryAuditRepository, InMemoryCategoryRepository, InMemoryDirectoryRepository,
    InMemoryPaymentMethodRepository, InMemoryRequestRepository, InMemorySequenceRepository,
};
pub use payment_method::SqlPaymentMethodRepository;
pub use request::SqlRequestRepository;
pub use sequence::SqlSequenceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} `{id}` was modified concurrently (expected version {expected})")]
    Conflict { entity: &'static str, id: String, expected: u32 },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict { .. } => Self::Conflict(value.to_string()),
            RepositoryError::NotFound { .. } => Self::NotFound(value.to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Selection criteria for request listings; unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub owner_id: Option<UserId>,
    pub approver_id: Option<UserId>,
    pub category_id: Option<CategoryId>,
    pub state: Option<RequestState>,
    pub source: Option<ResourceRef>,
    pub include_inactive: bool,
}

impl RequestFilter {
    pub fn for_source(source: ResourceRef) -> Self {
        Self { source: Some(source), include_inactive: true, ..Self::default() }
    }

    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        (self.include_inactive || request.active)
            && self.owner_id.as_ref().map_or(true, |owner| &request.owner_id == owner)
            && self.approver_id.as_ref().map_or(true, |user| request.is_approver(user))
            && self.category_id.as_ref().map_or(true, |category| &request.category_id == category)
            && self.state.map_or(true, |state| request.state == state)
            && self.source.as_ref().map_or(true, |source| request.source.as_ref() == Some(source))
    }
}

#[async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn find_by_id(&self, id: &CategoryId) -> Result<Option<Category>, RepositoryError>;
    /// Categories in `(sequence, name)` order; archived ones only when asked.
    async fn list(&self, include_archived: bool) -> Result<Vec<Category>, RepositoryError>;
    /// Upserts the category and replaces its template approvers in one transaction.
    async fn save(&self, category: Category) -> Result<(), RepositoryError>;
    /// Removes the category with its template approvers. Categories with requests are kept.
    async fn delete(&self, id: &CategoryId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, RepositoryError>;
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError>;
    /// Writes the request, its approver lines and `audit` atomically.
    ///
    /// `request.version` is the version the caller loaded (0 for a new request); the
    /// stored version is returned. A stale version fails with `Conflict`.
    async fn save(
        &self,
        request: &ApprovalRequest,
        audit: &[AuditEvent],
    ) -> Result<u32, RepositoryError>;
    async fn delete(&self, id: &RequestId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn save_user(&self, user: User) -> Result<(), RepositoryError>;
    async fn save_employee(&self, employee: Employee) -> Result<(), RepositoryError>;
    async fn list_users(&self) -> Result<Vec<User>, RepositoryError>;
    /// Point-in-time copy used for approver resolution within one operation.
    async fn snapshot(&self) -> Result<InMemoryDirectory, RepositoryError>;
}

#[async_trait]
pub trait PaymentMethodRepository: Send + Sync {
    async fn save(&self, method: PaymentMethod) -> Result<(), RepositoryError>;
    async fn list_active(&self) -> Result<Vec<PaymentMethod>, RepositoryError>;
}

#[async_trait]
pub trait SequenceRepository: Send + Sync {
    /// Creates or reformats `code`, keeping its counter.
    async fn configure(&self, code: &str, format: &SequenceFormat) -> Result<(), RepositoryError>;
    /// Reserves the next reference; unknown codes are created with `fallback`.
    async fn next_reference(
        &self,
        code: &str,
        fallback: &SequenceFormat,
    ) -> Result<String, RepositoryError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, events: &[AuditEvent]) -> Result<(), RepositoryError>;
    async fn list_for_request(&self, id: &RequestId) -> Result<Vec<AuditEvent>, RepositoryError>;
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp `{value}`: {e}")))
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_optional_date(value: Option<String>) -> Result<Option<NaiveDate>, RepositoryError> {
    value
        .as_deref()
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|e| RepositoryError::Decode(format!("invalid date `{raw}`: {e}")))
        })
        .transpose()
}

pub(crate) fn parse_optional_decimal(value: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    value
        .as_deref()
        .map(|raw| {
            Decimal::from_str(raw)
                .map_err(|e| RepositoryError::Decode(format!("invalid decimal `{raw}`: {e}")))
        })
        .transpose()
}

pub(crate) const LINE_COLUMNS: &str =
    "id, category_id, request_id, user_id, sequence, position, status, decided_at, comment";

pub(crate) fn row_to_line(row: &SqliteRow) -> Result<ApproverLine, RepositoryError> {
    let status: String = column(row, "status")?;
    let position: i64 = column(row, "position")?;
    Ok(ApproverLine {
        id: ApproverLineId(column(row, "id")?),
        category_id: CategoryId(column(row, "category_id")?),
        request_id: column::<Option<String>>(row, "request_id")?.map(RequestId),
        user_id: UserId(column(row, "user_id")?),
        sequence: column(row, "sequence")?,
        position: u32::try_from(position)
            .map_err(|_| RepositoryError::Decode(format!("invalid line position {position}")))?,
        status: ApproverStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown approver status `{status}`")))?,
        decided_at: parse_optional_timestamp(column(row, "decided_at")?)?,
        comment: column(row, "comment")?,
    })
}

pub(crate) async fn insert_line(
    tx: &mut Transaction<'_, Sqlite>,
    line: &ApproverLine,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_approver
             (id, category_id, request_id, user_id, sequence, position, status, decided_at, comment)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&line.id.0)
    .bind(&line.category_id.0)
    .bind(line.request_id.as_ref().map(|id| id.0.as_str()))
    .bind(&line.user_id.0)
    .bind(line.sequence)
    .bind(i64::from(line.position))
    .bind(line.status.as_str())
    .bind(line.decided_at.map(|dt| dt.to_rfc3339()))
    .bind(&line.comment)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use countersign_core::domain::identity::{Employee, EmployeeId, User, UserId};

    use super::{DirectoryRepository, SqlDirectoryRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    pub async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    /// Users `u-owner`, `u-manager`, `u-a`, `u-b`, `u-c`; the owner reports to the manager.
    pub async fn seed_people(pool: &DbPool) {
        let directory = SqlDirectoryRepository::new(pool.clone());
        for (id, name) in [
            ("u-owner", "Olivia Owner"),
            ("u-manager", "Mark Manager"),
            ("u-a", "Ann Approver"),
            ("u-b", "Bob Approver"),
            ("u-c", "Cleo Approver"),
        ] {
            directory
                .save_user(User {
                    id: UserId(id.to_string()),
                    name: name.to_string(),
                    email: Some(format!("{id}@example.com")),
                })
                .await
                .expect("save user");
        }
        directory
            .save_employee(Employee {
                id: EmployeeId("e-manager".to_string()),
                user_id: Some(UserId("u-manager".to_string())),
                manager_id: None,
            })
            .await
            .expect("save manager");
        directory
            .save_employee(Employee {
                id: EmployeeId("e-owner".to_string()),
                user_id: Some(UserId("u-owner".to_string())),
                manager_id: Some(EmployeeId("e-manager".to_string())),
            })
            .await
            .expect("save owner employee");
    }
}
