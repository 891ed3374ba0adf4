use anyhow::{Context, Result};
use async_trait::async_trait;
use domain::HoldingRecord;
use sqlx::{PgPool, Row};

#[async_trait]
pub trait HoldingRepository: Send + Sync {
    /// Every holding owned by `owner`, in insertion order.
    async fn holdings_for_owner(&self, owner: &str) -> Result<Vec<HoldingRecord>>;
}

#[derive(Clone)]
pub struct PostgresHoldingRepository {
    pool: PgPool,
    table: String,
}

impl PostgresHoldingRepository {
    /// `table` must already be validated as a plain identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl HoldingRepository for PostgresHoldingRepository {
    async fn holdings_for_owner(&self, owner: &str) -> Result<Vec<HoldingRecord>> {
        let sql = format!(
            r#"
            SELECT owner, portfolio, stock,
                   unit_price::DOUBLE PRECISION AS unit_price,
                   amount::DOUBLE PRECISION AS amount
            FROM {}
            WHERE owner = $1
            ORDER BY id ASC
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read holdings for {owner}"))?;

        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            holdings.push(HoldingRecord {
                owner: row.try_get("owner").context("invalid owner column")?,
                portfolio: row.try_get("portfolio").context("invalid portfolio column")?,
                stock: row.try_get("stock").context("invalid stock column")?,
                unit_price: row.try_get("unit_price").context("invalid unit_price column")?,
                amount: row.try_get("amount").context("invalid amount column")?,
            });
        }
        Ok(holdings)
    }
}
