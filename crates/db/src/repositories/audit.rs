use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Sqlite, Transaction};

use countersign_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use countersign_core::domain::request::RequestId;

use super::{column, parse_timestamp, AuditRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) async fn insert_events(
    tx: &mut Transaction<'_, Sqlite>,
    events: &[AuditEvent],
) -> Result<(), RepositoryError> {
    for event in events {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        sqlx::query(
            "INSERT INTO audit_event (id, request_id, correlation_id, event_type, category, actor,
                                      outcome, metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(metadata)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn row_to_event(row: &SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category: String = column(row, "category")?;
    let outcome: String = column(row, "outcome")?;
    let metadata_json: String = column(row, "metadata_json")?;
    let occurred_at: String = column(row, "occurred_at")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|e| RepositoryError::Decode(format!("invalid audit metadata: {e}")))?;

    Ok(AuditEvent {
        event_id: column(row, "id")?,
        request_id: column::<Option<String>>(row, "request_id")?.map(RequestId),
        correlation_id: column(row, "correlation_id")?,
        event_type: column(row, "event_type")?,
        category: AuditCategory::parse(&category)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown audit category `{category}`")))?,
        actor: column(row, "actor")?,
        outcome: AuditOutcome::parse(&outcome)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown audit outcome `{outcome}`")))?,
        metadata,
        occurred_at: parse_timestamp(&occurred_at)?,
    })
}

#[async_trait::async_trait]
impl AuditRepository for SqlAuditRepository {
    async fn append(&self, events: &[AuditEvent]) -> Result<(), RepositoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_events(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_request(&self, id: &RequestId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(
            "SELECT id, request_id, correlation_id, event_type, category, actor, outcome,
                    metadata_json, occurred_at
             FROM audit_event WHERE request_id = ?
             ORDER BY occurred_at, rowid",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }
}
