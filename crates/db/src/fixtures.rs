use sqlx::Executor;

use countersign_core::sequence::{SequenceFormat, REQUEST_SEQUENCE_CODE};

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SequenceRepository, SqlSequenceRepository};

const SEED_USER_IDS: &[&str] = &["u-admin", "u-alice", "u-bob", "u-carol", "u-dan", "u-erin"];

/// Expected `(employee, manager)` pairs; the root of the chart has no manager.
const SEED_REPORTING_LINES: &[(&str, Option<&str>)] = &[
    ("e-dan", None),
    ("e-carol", Some("e-dan")),
    ("e-erin", Some("e-dan")),
    ("e-alice", Some("e-carol")),
    ("e-bob", Some("e-carol")),
];

const SEED_CATEGORIES: &[SeedCategoryContract] = &[
    SeedCategoryContract {
        id: "cat-purchase",
        name: "Purchases",
        approval_type: "user",
        approval_minimum: 2,
        template_approvers: &["u-carol", "u-erin"],
    },
    SeedCategoryContract {
        id: "cat-leave",
        name: "Time Off",
        approval_type: "manager",
        approval_minimum: 1,
        template_approvers: &[],
    },
    SeedCategoryContract {
        id: "cat-travel",
        name: "Business Trip",
        approval_type: "both",
        approval_minimum: 2,
        template_approvers: &["u-erin"],
    },
    SeedCategoryContract {
        id: "cat-expense",
        name: "Expenses",
        approval_type: "user",
        approval_minimum: 1,
        template_approvers: &["u-erin"],
    },
];

struct SeedCategoryContract {
    id: &'static str,
    name: &'static str,
    approval_type: &'static str,
    approval_minimum: i64,
    template_approvers: &'static [&'static str],
}

/// Demo directory and categories covering each approval type.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Loads the dataset and registers the request sequence with `format`.
    pub async fn load(pool: &DbPool, format: &SequenceFormat) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        SqlSequenceRepository::new(pool.clone()).configure(REQUEST_SEQUENCE_CODE, format).await?;

        Ok(SeedResult {
            users: SEED_USER_IDS.len(),
            categories: SEED_CATEGORIES.iter().map(|category| category.name).collect(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let user_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM res_user WHERE id IN ({})",
            quoted_list(SEED_USER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("users", user_count == SEED_USER_IDS.len() as i64));

        let mut chart_ok = true;
        for &(employee, manager) in SEED_REPORTING_LINES {
            let matches: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM employee WHERE id = ?1 AND manager_id IS ?2)",
            )
            .bind(employee)
            .bind(manager)
            .fetch_one(pool)
            .await?;
            chart_ok &= matches == 1;
        }
        checks.push(("reporting-lines", chart_ok));

        for category in SEED_CATEGORIES {
            let exists: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM approval_category
                     WHERE id = ?1 AND approval_type = ?2 AND approval_minimum = ?3)",
            )
            .bind(category.id)
            .bind(category.approval_type)
            .bind(category.approval_minimum)
            .fetch_one(pool)
            .await?;
            checks.push((category.id, exists == 1));

            let approvers: Vec<String> = sqlx::query_scalar(
                "SELECT user_id FROM approval_approver
                 WHERE category_id = ?1 AND request_id IS NULL
                 ORDER BY sequence, position",
            )
            .bind(category.id)
            .fetch_all(pool)
            .await?;
            checks.push((category.name, approvers == category.template_approvers));
        }

        let sequence_registered: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM reference_sequence WHERE code = ?1)",
        )
        .bind(REQUEST_SEQUENCE_CODE)
        .fetch_one(pool)
        .await?;
        checks.push(("request-sequence", sequence_registered == 1));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

fn quoted_list(ids: &[&str]) -> String {
    ids.iter().map(|id| format!("'{}'", id.replace('\'', "''"))).collect::<Vec<_>>().join(", ")
}

#[derive(Debug)]
pub struct SeedResult {
    pub users: usize,
    pub categories: Vec<&'static str>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
