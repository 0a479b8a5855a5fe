use sqlx::sqlite::SqliteRow;

use countersign_core::audit::AuditEvent;
use countersign_core::domain::approver::sort_lines;
use countersign_core::domain::category::CategoryId;
use countersign_core::domain::identity::UserId;
use countersign_core::domain::payment_method::PaymentMethodId;
use countersign_core::domain::request::{ApprovalRequest, RequestId, RequestPayload, RequestState};
use countersign_core::host::ResourceRef;

use super::audit::insert_events;
use super::{
    column, insert_line, parse_optional_date, parse_optional_decimal, parse_timestamp, row_to_line,
    RepositoryError, RequestFilter, RequestRepository, LINE_COLUMNS,
};
use crate::DbPool;

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_lines(&self, request: &mut ApprovalRequest) -> Result<(), RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT {LINE_COLUMNS} FROM approval_approver WHERE request_id = ?
             ORDER BY sequence, position"
        ))
        .bind(&request.id.0)
        .fetch_all(&self.pool)
        .await?;
        request.approvers = rows.iter().map(row_to_line).collect::<Result<Vec<_>, _>>()?;
        sort_lines(&mut request.approvers);
        Ok(())
    }
}

const REQUEST_COLUMNS: &str = "id, name, category_id, owner_id, company_id, state, reason,
    description, active, request_date, date_start, date_end, quantity, amount, currency,
    reference, partner_id, location, product_id, payment_method_id, res_model, res_id,
    version, created_at, updated_at";

fn row_to_request(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let state: String = column(row, "state")?;
    let version: i64 = column(row, "version")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;
    let res_model: Option<String> = column(row, "res_model")?;
    let res_id: Option<i64> = column(row, "res_id")?;

    Ok(ApprovalRequest {
        id: RequestId(column(row, "id")?),
        name: column(row, "name")?,
        category_id: CategoryId(column(row, "category_id")?),
        owner_id: UserId(column(row, "owner_id")?),
        company_id: column(row, "company_id")?,
        payload: RequestPayload {
            date: parse_optional_date(column(row, "request_date")?)?,
            date_start: parse_optional_date(column(row, "date_start")?)?,
            date_end: parse_optional_date(column(row, "date_end")?)?,
            quantity: parse_optional_decimal(column(row, "quantity")?)?,
            amount: parse_optional_decimal(column(row, "amount")?)?,
            currency: column(row, "currency")?,
            reference: column(row, "reference")?,
            partner_id: column(row, "partner_id")?,
            location: column(row, "location")?,
            product_id: column(row, "product_id")?,
            payment_method_id: column::<Option<String>>(row, "payment_method_id")?
                .map(PaymentMethodId),
        },
        source: match (res_model, res_id) {
            (Some(model), Some(id)) => Some(ResourceRef::new(model, id)),
            _ => None,
        },
        state: RequestState::parse(&state)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown request state `{state}`")))?,
        reason: column(row, "reason")?,
        description: column(row, "description")?,
        active: column(row, "active")?,
        approvers: Vec::new(),
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("invalid version {version}")))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => {
                let mut request = row_to_request(r)?;
                self.load_lines(&mut request).await?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let owner = filter.owner_id.as_ref().map(|id| id.0.as_str());
        let approver = filter.approver_id.as_ref().map(|id| id.0.as_str());
        let category = filter.category_id.as_ref().map(|id| id.0.as_str());
        let state = filter.state.map(|state| state.as_str());
        let res_model = filter.source.as_ref().map(|source| source.model.as_str());
        let res_id = filter.source.as_ref().map(|source| source.id);

        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request r
             WHERE (? OR r.active = 1)
               AND (? IS NULL OR r.owner_id = ?)
               AND (? IS NULL OR EXISTS (
                       SELECT 1 FROM approval_approver a
                       WHERE a.request_id = r.id AND a.user_id = ?))
               AND (? IS NULL OR r.category_id = ?)
               AND (? IS NULL OR r.state = ?)
               AND (? IS NULL OR (r.res_model = ? AND r.res_id = ?))
             ORDER BY r.created_at DESC, r.id"
        ))
        .bind(filter.include_inactive)
        .bind(owner)
        .bind(owner)
        .bind(approver)
        .bind(approver)
        .bind(category)
        .bind(category)
        .bind(state)
        .bind(state)
        .bind(res_model)
        .bind(res_model)
        .bind(res_id)
        .fetch_all(&self.pool)
        .await?;

        let mut requests = rows.iter().map(row_to_request).collect::<Result<Vec<_>, _>>()?;
        for request in &mut requests {
            self.load_lines(request).await?;
        }
        Ok(requests)
    }

    async fn save(
        &self,
        request: &ApprovalRequest,
        audit: &[AuditEvent],
    ) -> Result<u32, RepositoryError> {
        let payload = &request.payload;
        let date = |value: Option<chrono::NaiveDate>| value.map(|d| d.format("%Y-%m-%d").to_string());
        let res_model = request.source.as_ref().map(|source| source.model.as_str());
        let res_id = request.source.as_ref().map(|source| source.id);

        let mut tx = self.pool.begin().await?;

        let stored_version = if request.version == 0 {
            sqlx::query(
                "INSERT INTO approval_request (id, name, category_id, owner_id, company_id, state,
                     reason, description, active, request_date, date_start, date_end, quantity,
                     amount, currency, reference, partner_id, location, product_id,
                     payment_method_id, res_model, res_id, version, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
            )
            .bind(&request.id.0)
            .bind(&request.name)
            .bind(&request.category_id.0)
            .bind(&request.owner_id.0)
            .bind(&request.company_id)
            .bind(request.state.as_str())
            .bind(&request.reason)
            .bind(&request.description)
            .bind(request.active)
            .bind(date(payload.date))
            .bind(date(payload.date_start))
            .bind(date(payload.date_end))
            .bind(payload.quantity.map(|value| value.to_string()))
            .bind(payload.amount.map(|value| value.to_string()))
            .bind(&payload.currency)
            .bind(&payload.reference)
            .bind(&payload.partner_id)
            .bind(&payload.location)
            .bind(&payload.product_id)
            .bind(payload.payment_method_id.as_ref().map(|id| id.0.as_str()))
            .bind(res_model)
            .bind(res_id)
            .bind(request.created_at.to_rfc3339())
            .bind(request.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            1
        } else {
            let updated = sqlx::query(
                "UPDATE approval_request SET
                     name = ?, category_id = ?, owner_id = ?, company_id = ?, state = ?, reason = ?,
                     description = ?, active = ?, request_date = ?, date_start = ?, date_end = ?,
                     quantity = ?, amount = ?, currency = ?, reference = ?, partner_id = ?,
                     location = ?, product_id = ?, payment_method_id = ?, res_model = ?,
                     res_id = ?, updated_at = ?, version = version + 1
                 WHERE id = ? AND version = ?",
            )
            .bind(&request.name)
            .bind(&request.category_id.0)
            .bind(&request.owner_id.0)
            .bind(&request.company_id)
            .bind(request.state.as_str())
            .bind(&request.reason)
            .bind(&request.description)
            .bind(request.active)
            .bind(date(payload.date))
            .bind(date(payload.date_start))
            .bind(date(payload.date_end))
            .bind(payload.quantity.map(|value| value.to_string()))
            .bind(payload.amount.map(|value| value.to_string()))
            .bind(&payload.currency)
            .bind(&payload.reference)
            .bind(&payload.partner_id)
            .bind(&payload.location)
            .bind(&payload.product_id)
            .bind(payload.payment_method_id.as_ref().map(|id| id.0.as_str()))
            .bind(res_model)
            .bind(res_id)
            .bind(request.updated_at.to_rfc3339())
            .bind(&request.id.0)
            .bind(i64::from(request.version))
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                let exists: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM approval_request WHERE id = ?")
                        .bind(&request.id.0)
                        .fetch_one(&mut *tx)
                        .await?;
                return Err(if exists == 0 {
                    RepositoryError::NotFound { entity: "approval request", id: request.id.0.clone() }
                } else {
                    RepositoryError::Conflict {
                        entity: "approval request",
                        id: request.id.0.clone(),
                        expected: request.version,
                    }
                });
            }
            request.version + 1
        };

        sqlx::query("DELETE FROM approval_approver WHERE request_id = ?")
            .bind(&request.id.0)
            .execute(&mut *tx)
            .await?;
        for line in &request.approvers {
            if line.request_id.as_ref() != Some(&request.id) {
                return Err(RepositoryError::Decode(format!(
                    "approver line `{}` is not bound to request `{}`",
                    line.id.0, request.id.0
                )));
            }
            insert_line(&mut tx, line).await?;
        }
        insert_events(&mut tx, audit).await?;

        tx.commit().await?;
        Ok(stored_version)
    }

    async fn delete(&self, id: &RequestId) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM approval_approver WHERE request_id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM approval_request WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use countersign_core::audit::{AuditCategory, AuditContext, AuditOutcome};
    use countersign_core::domain::approver::{ApproverLine, ApproverStatus};
    use countersign_core::domain::category::{Category, CategoryId};
    use countersign_core::domain::identity::UserId;
    use countersign_core::domain::request::{ApprovalRequest, RequestId, RequestState};
    use countersign_core::host::ResourceRef;

    use super::SqlRequestRepository;
    use crate::repositories::test_support::{migrated_pool, seed_people};
    use crate::repositories::{
        AuditRepository, CategoryRepository, RepositoryError, RequestFilter, RequestRepository,
        SqlAuditRepository, SqlCategoryRepository,
    };
    use crate::DbPool;

    async fn setup() -> DbPool {
        let pool = migrated_pool().await;
        seed_people(&pool).await;
        SqlCategoryRepository::new(pool.clone())
            .save(Category::new("c-1", "Purchases"))
            .await
            .expect("save category");
        pool
    }

    fn request(id: &str) -> ApprovalRequest {
        let mut request = ApprovalRequest::new(
            RequestId(id.to_string()),
            format!("APR/{id}"),
            CategoryId("c-1".to_string()),
            UserId("u-owner".to_string()),
            Utc::now(),
        );
        request.payload.amount = Some(Decimal::new(125_050, 2));
        request.payload.date_start = NaiveDate::from_ymd_opt(2026, 5, 1);
        request.payload.date_end = NaiveDate::from_ymd_opt(2026, 5, 3);
        for (position, user) in ["u-a", "u-b"].into_iter().enumerate() {
            request.approvers.push(ApproverLine::bound(
                CategoryId("c-1".to_string()),
                request.id.clone(),
                UserId(user.to_string()),
                10,
                position as u32,
            ));
        }
        request
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let repo = SqlRequestRepository::new(setup().await);
        let mut original = request("r-1");
        original.source = Some(ResourceRef::new("purchase.order", 42));

        let version = repo.save(&original, &[]).await.expect("save");
        assert_eq!(version, 1);

        let loaded = repo.find_by_id(&original.id).await.expect("find").expect("request exists");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.payload.amount, Some(Decimal::new(125_050, 2)));
        assert_eq!(loaded.payload.date_end, NaiveDate::from_ymd_opt(2026, 5, 3));
        assert_eq!(loaded.source, Some(ResourceRef::new("purchase.order", 42)));
        assert_eq!(loaded.approvers.len(), 2);
        assert_eq!(loaded.approvers[0].user_id.0, "u-a");
    }

    #[tokio::test]
    async fn stale_version_is_rejected_as_conflict() {
        let repo = SqlRequestRepository::new(setup().await);
        repo.save(&request("r-1"), &[]).await.expect("insert");

        let mut first = repo.find_by_id(&RequestId("r-1".to_string())).await.expect("find").expect("exists");
        let mut second = first.clone();

        first.state = RequestState::Pending;
        assert_eq!(repo.save(&first, &[]).await.expect("first writer"), 2);

        second.state = RequestState::Cancel;
        let error = repo.save(&second, &[]).await.expect_err("second writer must lose");
        assert!(matches!(error, RepositoryError::Conflict { expected: 1, .. }));

        let stored = repo.find_by_id(&first.id).await.expect("find").expect("exists");
        assert_eq!(stored.state, RequestState::Pending);
    }

    #[tokio::test]
    async fn updating_a_missing_request_is_not_found() {
        let repo = SqlRequestRepository::new(setup().await);
        let mut ghost = request("r-ghost");
        ghost.version = 3;
        let error = repo.save(&ghost, &[]).await.expect_err("missing row");
        assert!(matches!(error, RepositoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn lines_and_audit_are_written_with_the_request() {
        let pool = setup().await;
        let repo = SqlRequestRepository::new(pool.clone());
        let mut stored = request("r-1");
        repo.save(&stored, &[]).await.expect("insert");

        stored.version = 1;
        stored.approvers.truncate(1);
        stored.approvers[0].status = ApproverStatus::Approved;
        let context = AuditContext::new(Some(stored.id.clone()), "corr-1", "u-a");
        repo.save(
            &stored,
            &[context.event("workflow.request.approved", AuditCategory::Workflow, AuditOutcome::Success)],
        )
        .await
        .expect("update");

        let loaded = repo.find_by_id(&stored.id).await.expect("find").expect("exists");
        assert_eq!(loaded.approvers.len(), 1);
        assert_eq!(loaded.approvers[0].status, ApproverStatus::Approved);
        let events = SqlAuditRepository::new(pool).list_for_request(&stored.id).await.expect("audit");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_partial_lines() {
        let pool = setup().await;
        let repo = SqlRequestRepository::new(pool.clone());
        let mut broken = request("r-1");
        broken.approvers[1].user_id = UserId("u-unknown".to_string());

        assert!(repo.save(&broken, &[]).await.is_err());
        let lines: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM approval_approver")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(lines, 0);
        assert!(repo.find_by_id(&broken.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn list_filters_by_state_approver_and_source() {
        let repo = SqlRequestRepository::new(setup().await);
        let mut pending = request("r-1");
        pending.state = RequestState::Pending;
        pending.source = Some(ResourceRef::new("purchase.order", 7));
        repo.save(&pending, &[]).await.expect("save pending");
        let mut lonely = request("r-2");
        lonely.approvers.clear();
        repo.save(&lonely, &[]).await.expect("save draft");

        let by_state = repo
            .list(&RequestFilter { state: Some(RequestState::Pending), ..RequestFilter::default() })
            .await
            .expect("list");
        assert_eq!(by_state.len(), 1);

        let by_approver = repo
            .list(&RequestFilter { approver_id: Some(UserId("u-b".to_string())), ..RequestFilter::default() })
            .await
            .expect("list");
        assert_eq!(by_approver.iter().map(|r| r.id.0.as_str()).collect::<Vec<_>>(), vec!["r-1"]);

        let by_source =
            repo.list(&RequestFilter::for_source(ResourceRef::new("purchase.order", 7))).await.expect("list");
        assert_eq!(by_source.len(), 1);
        assert_eq!(repo.list(&RequestFilter::default()).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn delete_cascades_to_lines() {
        let pool = setup().await;
        let repo = SqlRequestRepository::new(pool.clone());
        repo.save(&request("r-1"), &[]).await.expect("save");

        assert!(repo.delete(&RequestId("r-1".to_string())).await.expect("delete"));
        let lines: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM approval_approver WHERE request_id = 'r-1'")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(lines, 0);
    }
}
