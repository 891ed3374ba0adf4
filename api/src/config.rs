use std::{env, time::Duration};

use anyhow::{Context, Result};

/// Atlas caps `numCandidates` at 10000 and candidates are `10 * top_k`.
pub const MAX_TOP_K: usize = 1000;

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub users_table: String,
    pub holdings_table: String,
    pub run_migrations: bool,
}

#[derive(Clone, Debug)]
pub struct MarketDataConfig {
    pub api_base: String,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct LeaderboardConfig {
    pub max_concurrency: usize,
    pub user_timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub api_base: String,
    pub embedding_model: String,
    pub completion_model: String,
}

#[derive(Clone, Debug)]
pub struct VectorSearchConfig {
    pub data_api_url: String,
    pub api_key: String,
    pub data_source: String,
    pub database: String,
    pub collection: String,
    pub index_name: String,
    pub ticker_field: String,
    pub text_field: String,
    pub embedding_field: String,
    pub top_k: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub market_data: MarketDataConfig,
    pub leaderboard: LeaderboardConfig,
    pub openai: OpenAiConfig,
    pub vector_search: VectorSearchConfig,
    pub frontend_origins: Vec<String>,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let users_table = env::var("USERS_TABLE").unwrap_or_else(|_| "users".to_string());
        let holdings_table = required("STOCK_DATA_TABLE")?;
        validate_identifier("USERS_TABLE", &users_table)?;
        validate_identifier("STOCK_DATA_TABLE", &holdings_table)?;

        let ticker_field =
            env::var("VECTOR_TICKER_FIELD").unwrap_or_else(|_| "ticker".to_string());
        let text_field = env::var("VECTOR_TEXT_FIELD").unwrap_or_else(|_| "text".to_string());
        let embedding_field =
            env::var("VECTOR_EMBEDDING_FIELD").unwrap_or_else(|_| "embedding".to_string());

        let market_data = MarketDataConfig {
            api_base: env::var("MARKET_DATA_API_BASE")
                .unwrap_or_else(|_| "https://query1.finance.yahoo.com".to_string()),
            cache_ttl: parse_duration_seconds("PRICE_CACHE_TTL_SECS", 60),
            request_timeout: parse_duration_seconds("PRICE_REQUEST_TIMEOUT_SECS", 5),
        };
        let leaderboard = LeaderboardConfig {
            max_concurrency: parse_usize("LEADERBOARD_MAX_CONCURRENCY", 8),
            user_timeout: parse_duration_seconds("LEADERBOARD_USER_TIMEOUT_SECS", 20),
            retries: parse_usize("LEADERBOARD_RETRIES", 2) as u32,
            retry_backoff: parse_duration_millis("RETRY_BACKOFF_MS", 500),
        };
        check_price_budget(&market_data, &leaderboard)?;

        Ok(Self {
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                users_table,
                holdings_table,
                run_migrations: parse_bool("RUN_MIGRATIONS", false),
            },
            market_data,
            leaderboard,
            openai: OpenAiConfig {
                api_key: required("OPENAI_API_KEY")?,
                api_base: env::var("OPENAI_API_BASE")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-ada-002".to_string()),
                completion_model: env::var("COMPLETION_MODEL")
                    .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            },
            vector_search: VectorSearchConfig {
                data_api_url: required("ATLAS_DATA_API_URL")?,
                api_key: required("ATLAS_API_KEY")?,
                data_source: env::var("ATLAS_DATA_SOURCE")
                    .unwrap_or_else(|_| "Cluster0".to_string()),
                database: required("ATLAS_DATABASE")?,
                collection: required("ATLAS_COLLECTION")?,
                index_name: required("ATLAS_VECTOR_SEARCH_INDEX_NAME")?,
                ticker_field,
                text_field,
                embedding_field,
                top_k: at_most("RETRIEVAL_TOP_K", parse_usize("RETRIEVAL_TOP_K", 4), MAX_TOP_K)?,
            },
            frontend_origins: parse_origins(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()
                .context("PORT must be a valid u16")?,
        })
    }
}

fn required(key: &str) -> Result<String> {
    let value = env::var(key).with_context(|| format!("{key} must be set"))?;
    if value.trim().is_empty() {
        anyhow::bail!("{key} must not be empty");
    }
    Ok(value.trim().to_string())
}

/// Table names end up inside SQL text, so only plain identifiers pass.
pub(crate) fn validate_identifier(key: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && value.len() <= 63;
    if !valid {
        anyhow::bail!("{key} must be a plain SQL identifier, got {value:?}");
    }
    Ok(())
}

/// Worst case for one symbol: every attempt runs to the request timeout,
/// plus the linear backoff between attempts. It has to finish before the
/// per-user timeout or one hung symbol drops the user's other portfolios.
fn worst_case_price_lookup(market: &MarketDataConfig, leaderboard: &LeaderboardConfig) -> Duration {
    let attempts = leaderboard.retries.max(1);
    let backoff_steps: u32 = (1..attempts).sum();
    market.request_timeout * attempts + leaderboard.retry_backoff * backoff_steps
}

fn check_price_budget(market: &MarketDataConfig, leaderboard: &LeaderboardConfig) -> Result<()> {
    let worst = worst_case_price_lookup(market, leaderboard);
    if worst >= leaderboard.user_timeout {
        anyhow::bail!(
            "price lookups can take {}ms (PRICE_REQUEST_TIMEOUT_SECS x LEADERBOARD_RETRIES + backoff), \
             which is not below LEADERBOARD_USER_TIMEOUT_SECS ({}ms)",
            worst.as_millis(),
            leaderboard.user_timeout.as_millis()
        );
    }
    Ok(())
}

fn at_most(key: &str, value: usize, max: usize) -> Result<usize> {
    if value > max {
        anyhow::bail!("{key} must be at most {max}, got {value}");
    }
    Ok(value)
}

fn parse_origins() -> Vec<String> {
    if let Ok(list) = env::var("FRONTEND_ORIGINS") {
        split_origins(&list)
    } else {
        vec!["http://localhost:3000".to_string()]
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_duration_seconds(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

fn parse_duration_millis(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default))
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}
