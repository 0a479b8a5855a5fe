use chrono::Utc;
use sqlx::sqlite::SqliteRow;

use countersign_core::domain::category::{
    sort_categories, ApprovalType, Category, CategoryId, RequiredFields,
};

use super::{column, insert_line, row_to_line, CategoryRepository, RepositoryError, LINE_COLUMNS};
use crate::DbPool;

pub struct SqlCategoryRepository {
    pool: DbPool,
}

impl SqlCategoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_templates(&self, category: &mut Category) -> Result<(), RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT {LINE_COLUMNS} FROM approval_approver
             WHERE category_id = ? AND request_id IS NULL
             ORDER BY sequence, position"
        ))
        .bind(&category.id.0)
        .fetch_all(&self.pool)
        .await?;
        category.approvers = rows.iter().map(row_to_line).collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

const CATEGORY_COLUMNS: &str = "id, name, sequence, active, company_id, description,
    has_date, has_period, has_quantity, has_amount, has_reference, has_payment_method,
    has_location, has_partner, has_product, approval_type, approval_minimum,
    approval_sequence, require_my_approval, require_employee_manager";

fn row_to_category(row: &SqliteRow) -> Result<Category, RepositoryError> {
    let approval_type: String = column(row, "approval_type")?;
    let approval_minimum: i64 = column(row, "approval_minimum")?;

    Ok(Category {
        id: CategoryId(column(row, "id")?),
        name: column(row, "name")?,
        sequence: column(row, "sequence")?,
        active: column(row, "active")?,
        company_id: column(row, "company_id")?,
        description: column(row, "description")?,
        required: RequiredFields {
            date: column(row, "has_date")?,
            period: column(row, "has_period")?,
            quantity: column(row, "has_quantity")?,
            amount: column(row, "has_amount")?,
            reference: column(row, "has_reference")?,
            payment_method: column(row, "has_payment_method")?,
            location: column(row, "has_location")?,
            partner: column(row, "has_partner")?,
            product: column(row, "has_product")?,
        },
        approval_type: ApprovalType::parse(&approval_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown approval type `{approval_type}`"))
        })?,
        approval_minimum: u32::try_from(approval_minimum).map_err(|_| {
            RepositoryError::Decode(format!("invalid approval minimum {approval_minimum}"))
        })?,
        approval_sequence: column(row, "approval_sequence")?,
        require_my_approval: column(row, "require_my_approval")?,
        require_employee_manager: column(row, "require_employee_manager")?,
        approvers: Vec::new(),
    })
}

#[async_trait::async_trait]
impl CategoryRepository for SqlCategoryRepository {
    async fn find_by_id(&self, id: &CategoryId) -> Result<Option<Category>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CATEGORY_COLUMNS} FROM approval_category WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => {
                let mut category = row_to_category(r)?;
                self.load_templates(&mut category).await?;
                Ok(Some(category))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, include_archived: bool) -> Result<Vec<Category>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM approval_category
             WHERE active = 1 OR ?
             ORDER BY sequence, name"
        ))
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await?;

        let mut categories = rows.iter().map(row_to_category).collect::<Result<Vec<_>, _>>()?;
        for category in &mut categories {
            self.load_templates(category).await?;
        }
        sort_categories(&mut categories);
        Ok(categories)
    }

    async fn save(&self, category: Category) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approval_category (id, name, sequence, active, company_id, description,
                 has_date, has_period, has_quantity, has_amount, has_reference, has_payment_method,
                 has_location, has_partner, has_product, approval_type, approval_minimum,
                 approval_sequence, require_my_approval, require_employee_manager,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 sequence = excluded.sequence,
                 active = excluded.active,
                 company_id = excluded.company_id,
                 description = excluded.description,
                 has_date = excluded.has_date,
                 has_period = excluded.has_period,
                 has_quantity = excluded.has_quantity,
                 has_amount = excluded.has_amount,
                 has_reference = excluded.has_reference,
                 has_payment_method = excluded.has_payment_method,
                 has_location = excluded.has_location,
                 has_partner = excluded.has_partner,
                 has_product = excluded.has_product,
                 approval_type = excluded.approval_type,
                 approval_minimum = excluded.approval_minimum,
                 approval_sequence = excluded.approval_sequence,
                 require_my_approval = excluded.require_my_approval,
                 require_employee_manager = excluded.require_employee_manager,
                 updated_at = excluded.updated_at",
        )
        .bind(&category.id.0)
        .bind(&category.name)
        .bind(category.sequence)
        .bind(category.active)
        .bind(&category.company_id)
        .bind(&category.description)
        .bind(category.required.date)
        .bind(category.required.period)
        .bind(category.required.quantity)
        .bind(category.required.amount)
        .bind(category.required.reference)
        .bind(category.required.payment_method)
        .bind(category.required.location)
        .bind(category.required.partner)
        .bind(category.required.product)
        .bind(category.approval_type.as_str())
        .bind(i64::from(category.approval_minimum))
        .bind(category.approval_sequence)
        .bind(category.require_my_approval)
        .bind(category.require_employee_manager)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approval_approver WHERE category_id = ? AND request_id IS NULL")
            .bind(&category.id.0)
            .execute(&mut *tx)
            .await?;
        for line in category.approvers.iter().filter(|line| line.is_template()) {
            insert_line(&mut tx, line).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &CategoryId) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let in_use: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM approval_request WHERE category_id = ?")
                .bind(&id.0)
                .fetch_one(&mut *tx)
                .await?;
        if in_use > 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM approval_approver WHERE category_id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM approval_category WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}
