use sqlx::Row;

use countersign_core::sequence::SequenceFormat;

use super::{RepositoryError, SequenceRepository};
use crate::DbPool;

pub struct SqlSequenceRepository {
    pool: DbPool,
}

impl SqlSequenceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SequenceRepository for SqlSequenceRepository {
    async fn configure(&self, code: &str, format: &SequenceFormat) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO reference_sequence (code, prefix, padding, next_number) VALUES (?, ?, ?, 1)
             ON CONFLICT(code) DO UPDATE SET prefix = excluded.prefix, padding = excluded.padding",
        )
        .bind(code)
        .bind(&format.prefix)
        .bind(format.padding as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_reference(
        &self,
        code: &str,
        fallback: &SequenceFormat,
    ) -> Result<String, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO reference_sequence (code, prefix, padding, next_number) VALUES (?, ?, ?, 1)
             ON CONFLICT(code) DO NOTHING",
        )
        .bind(code)
        .bind(&fallback.prefix)
        .bind(fallback.padding as i64)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT prefix, padding, next_number FROM reference_sequence WHERE code = ?")
            .bind(code)
            .fetch_one(&mut *tx)
            .await?;
        let prefix: String = row.try_get("prefix").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let padding: i64 = row.try_get("padding").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let number: i64 =
            row.try_get("next_number").map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let reserved = sqlx::query(
            "UPDATE reference_sequence SET next_number = next_number + 1
             WHERE code = ? AND next_number = ?",
        )
        .bind(code)
        .bind(number)
        .execute(&mut *tx)
        .await?;
        if reserved.rows_affected() == 0 {
            return Err(RepositoryError::Conflict {
                entity: "reference sequence",
                id: code.to_owned(),
                expected: u32::try_from(number).unwrap_or(u32::MAX),
            });
        }

        tx.commit().await?;

        let format = SequenceFormat {
            prefix,
            padding: usize::try_from(padding)
                .map_err(|_| RepositoryError::Decode(format!("invalid padding {padding}")))?,
        };
        let number = u64::try_from(number)
            .map_err(|_| RepositoryError::Decode(format!("invalid sequence number {number}")))?;
        Ok(format.format(number))
    }
}

#[cfg(test)]
mod tests {
    use countersign_core::sequence::SequenceFormat;

    use super::SqlSequenceRepository;
    use crate::repositories::test_support::migrated_pool;
    use crate::repositories::SequenceRepository;

    #[tokio::test]
    async fn unknown_codes_start_at_one_with_the_fallback_format() {
        let repo = SqlSequenceRepository::new(migrated_pool().await);
        let fallback = SequenceFormat::default();

        assert_eq!(repo.next_reference("approval.request", &fallback).await.expect("first"), "APR/00001");
        assert_eq!(repo.next_reference("approval.request", &fallback).await.expect("second"), "APR/00002");
    }

    #[tokio::test]
    async fn configure_changes_format_but_keeps_the_counter() {
        let repo = SqlSequenceRepository::new(migrated_pool().await);
        let fallback = SequenceFormat::default();
        repo.next_reference("approval.request", &fallback).await.expect("first");

        repo.configure("approval.request", &SequenceFormat { prefix: "REQ-".to_string(), padding: 3 })
            .await
            .expect("configure");
        assert_eq!(repo.next_reference("approval.request", &fallback).await.expect("second"), "REQ-002");
    }
}
