use sqlx::sqlite::SqliteRow;

use countersign_core::domain::identity::{Employee, EmployeeId, InMemoryDirectory, User, UserId};

use super::{column, DirectoryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User, RepositoryError> {
    Ok(User {
        id: UserId(column(row, "id")?),
        name: column(row, "name")?,
        email: column(row, "email")?,
    })
}

fn row_to_employee(row: &SqliteRow) -> Result<Employee, RepositoryError> {
    Ok(Employee {
        id: EmployeeId(column(row, "id")?),
        user_id: column::<Option<String>>(row, "user_id")?.map(UserId),
        manager_id: column::<Option<String>>(row, "manager_id")?.map(EmployeeId),
    })
}

#[async_trait::async_trait]
impl DirectoryRepository for SqlDirectoryRepository {
    async fn save_user(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO res_user (id, name, email) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
        )
        .bind(&user.id.0)
        .bind(&user.name)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_employee(&self, employee: Employee) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO employee (id, user_id, manager_id) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 user_id = excluded.user_id,
                 manager_id = excluded.manager_id",
        )
        .bind(&employee.id.0)
        .bind(employee.user_id.as_ref().map(|id| id.0.as_str()))
        .bind(employee.manager_id.as_ref().map(|id| id.0.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query("SELECT id, name, email FROM res_user ORDER BY name, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn snapshot(&self) -> Result<InMemoryDirectory, RepositoryError> {
        let mut directory = InMemoryDirectory::default();
        for user in self.list_users().await? {
            directory.insert_user(user);
        }

        let rows: Vec<SqliteRow> = sqlx::query("SELECT id, user_id, manager_id FROM employee")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            directory.insert_employee(row_to_employee(row)?);
        }
        Ok(directory)
    }
}
