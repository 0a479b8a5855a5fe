use sqlx::sqlite::SqliteRow;

use countersign_core::domain::payment_method::{PaymentMethod, PaymentMethodId};

use super::{column, PaymentMethodRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPaymentMethodRepository {
    pool: DbPool,
}

impl SqlPaymentMethodRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_method(row: &SqliteRow) -> Result<PaymentMethod, RepositoryError> {
    Ok(PaymentMethod {
        id: PaymentMethodId(column(row, "id")?),
        name: column(row, "name")?,
        active: column(row, "active")?,
    })
}

#[async_trait::async_trait]
impl PaymentMethodRepository for SqlPaymentMethodRepository {
    async fn save(&self, method: PaymentMethod) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO payment_method (id, name, active) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
        )
        .bind(&method.id.0)
        .bind(&method.name)
        .bind(method.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<PaymentMethod>, RepositoryError> {
        let rows: Vec<SqliteRow> =
            sqlx::query("SELECT id, name, active FROM payment_method WHERE active = 1 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_method).collect()
    }
}
