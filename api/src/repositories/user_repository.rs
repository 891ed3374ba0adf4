use anyhow::{Context, Result};
use async_trait::async_trait;
use domain::User;
use sqlx::{PgPool, Row};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>>;
}

#[derive(Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
    table: String,
}

impl PostgresUserRepository {
    /// `table` must already be validated as a plain identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn list_users(&self) -> Result<Vec<User>> {
        let sql = format!("SELECT email, username FROM {} ORDER BY email ASC", self.table);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read user directory {}", self.table))?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(User {
                email: row.try_get("email").context("invalid email column")?,
                username: row.try_get("username").context("invalid username column")?,
            });
        }
        Ok(users)
    }
}
