use std::sync::Arc;

use anyhow::{Context, Result};
use retrieval::RagQueryService;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    config::AppConfig,
    repositories::{PostgresHoldingRepository, PostgresUserRepository},
    services::{
        AtlasVectorIndex, LeaderboardService, OpenAiCompletion, OpenAiEmbedder, PortfolioValuer,
        RetryPriceOracle, YahooPriceOracle,
    },
    state::AppState,
};

pub async fn build_state(config: &AppConfig) -> Result<AppState> {
    let pool = PgPoolOptions::new()
        .max_connections(config.leaderboard.max_concurrency as u32 + 2)
        .connect(&config.database.url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    if config.database.run_migrations {
        sqlx::migrate!("../migrations").run(&pool).await?;
        info!("database migrations applied");
    }

    let user_repo = Arc::new(PostgresUserRepository::new(
        pool.clone(),
        config.database.users_table.clone(),
    ));
    let holding_repo = Arc::new(PostgresHoldingRepository::new(
        pool,
        config.database.holdings_table.clone(),
    ));

    let yahoo = Arc::new(YahooPriceOracle::new(
        config.market_data.api_base.clone(),
        config.market_data.cache_ttl,
        config.market_data.request_timeout,
    )?);
    let oracle = Arc::new(RetryPriceOracle::new(
        yahoo,
        config.leaderboard.retries,
        config.leaderboard.retry_backoff,
        config.market_data.request_timeout,
    ));

    let valuer = Arc::new(PortfolioValuer::new(
        holding_repo,
        oracle,
        config.leaderboard.retries,
        config.leaderboard.retry_backoff,
    ));
    let leaderboard = Arc::new(LeaderboardService::new(
        user_repo,
        valuer,
        config.leaderboard.max_concurrency,
        config.leaderboard.user_timeout,
    ));

    let query = Arc::new(RagQueryService::new(
        Arc::new(OpenAiEmbedder::new(&config.openai)?),
        Arc::new(AtlasVectorIndex::new(config.vector_search.clone())?),
        Arc::new(OpenAiCompletion::new(&config.openai)?),
        config.vector_search.top_k,
    ));

    Ok(AppState {
        config: config.clone(),
        leaderboard,
        query,
    })
}
