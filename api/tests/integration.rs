use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use api::{
    app::build_router,
    config::{
        AppConfig, DatabaseConfig, LeaderboardConfig, MarketDataConfig, OpenAiConfig,
        VectorSearchConfig,
    },
    repositories::{HoldingRepository, UserRepository},
    services::{LeaderboardService, PortfolioValuer, PriceOracle, RetryPriceOracle, StaticPriceOracle},
    state::AppState,
};
use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::{HeaderValue, Request, StatusCode},
    Router,
};
use domain::{
    AnswerStatus, HoldingRecord, Leaderboard, QueryResponse, User, UserPortfolioReport,
};
use retrieval::{
    CompletionModel, CompletionRequest, Embedder, Passage, RagQueryService, SearchRequest,
    VectorIndex,
};
use tower::ServiceExt;

struct MemoryUsers {
    users: Vec<User>,
    fail: bool,
}

#[async_trait]
impl UserRepository for MemoryUsers {
    async fn list_users(&self) -> Result<Vec<User>> {
        if self.fail {
            anyhow::bail!("directory offline");
        }
        Ok(self.users.clone())
    }
}

struct MemoryHoldings {
    records: Vec<HoldingRecord>,
    slow_owner: Option<String>,
}

#[async_trait]
impl HoldingRepository for MemoryHoldings {
    async fn holdings_for_owner(&self, owner: &str) -> Result<Vec<HoldingRecord>> {
        if self.slow_owner.as_deref() == Some(owner) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect())
    }
}

/// Never answers for `HANG`; every other symbol comes from the static table.
struct StallingOracle {
    prices: StaticPriceOracle,
}

#[async_trait]
impl PriceOracle for StallingOracle {
    async fn latest_close(&self, symbol: &str) -> Result<f64> {
        if symbol == "HANG" {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.prices.latest_close(symbol).await
    }
}

struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.0, 1.0])
    }
}

/// Returns passages only for tickers it knows about.
struct TickerIndex {
    passages: HashMap<String, Vec<Passage>>,
    offline: bool,
}

#[async_trait]
impl VectorIndex for TickerIndex {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>> {
        if self.offline {
            anyhow::bail!("cluster paused");
        }
        Ok(self
            .passages
            .get(&request.filter.ticker)
            .cloned()
            .unwrap_or_default())
    }
}

struct EchoModel;

#[async_trait]
impl CompletionModel for EchoModel {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        Ok("Net sales fell by $12.5 billion.".to_string())
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: "postgres://localhost/test".to_string(),
            users_table: "users".to_string(),
            holdings_table: "stock_data".to_string(),
            run_migrations: false,
        },
        market_data: MarketDataConfig {
            api_base: "http://localhost:9".to_string(),
            cache_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_millis(40),
        },
        leaderboard: LeaderboardConfig {
            max_concurrency: 4,
            user_timeout: Duration::from_millis(200),
            retries: 2,
            retry_backoff: Duration::from_millis(1),
        },
        openai: OpenAiConfig {
            api_key: "sk-test".to_string(),
            api_base: "http://localhost:9".to_string(),
            embedding_model: "text-embedding-ada-002".to_string(),
            completion_model: "gpt-3.5-turbo".to_string(),
        },
        vector_search: VectorSearchConfig {
            data_api_url: "http://localhost:9".to_string(),
            api_key: "key".to_string(),
            data_source: "Cluster0".to_string(),
            database: "filings".to_string(),
            collection: "chunks".to_string(),
            index_name: "vector_index".to_string(),
            ticker_field: "ticker".to_string(),
            text_field: "text".to_string(),
            embedding_field: "embedding".to_string(),
            top_k: 4,
        },
        frontend_origins: vec!["http://localhost:3000".to_string()],
        port: 0,
    }
}

fn user(name: &str) -> User {
    User {
        email: format!("{name}@example.com"),
        username: name.to_string(),
    }
}

fn holding(owner: &str, portfolio: &str, stock: &str, unit_price: f64, amount: f64) -> HoldingRecord {
    HoldingRecord {
        owner: format!("{owner}@example.com"),
        portfolio: portfolio.to_string(),
        stock: stock.to_string(),
        unit_price,
        amount,
    }
}

struct Fixture {
    users: Vec<User>,
    records: Vec<HoldingRecord>,
    slow_owner: Option<String>,
    directory_offline: bool,
    index_offline: bool,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            users: vec![user("bob"), user("alice")],
            records: vec![
                holding("alice", "tech", "AAPL", 100.0, 10.0),
                holding("bob", "value", "MSFT", 50.0, 10.0),
            ],
            slow_owner: None,
            directory_offline: false,
            index_offline: false,
        }
    }
}

fn build_app(fixture: Fixture) -> Router {
    let config = test_config();
    let oracle = RetryPriceOracle::new(
        Arc::new(StallingOracle {
            prices: StaticPriceOracle::new(HashMap::from([
                ("AAPL".to_string(), 110.0),
                ("MSFT".to_string(), 45.0),
            ])),
        }),
        config.leaderboard.retries,
        config.leaderboard.retry_backoff,
        config.market_data.request_timeout,
    );
    let valuer = Arc::new(PortfolioValuer::new(
        Arc::new(MemoryHoldings {
            records: fixture.records,
            slow_owner: fixture.slow_owner,
        }),
        Arc::new(oracle),
        config.leaderboard.retries,
        config.leaderboard.retry_backoff,
    ));
    let leaderboard = Arc::new(LeaderboardService::new(
        Arc::new(MemoryUsers {
            users: fixture.users,
            fail: fixture.directory_offline,
        }),
        valuer,
        config.leaderboard.max_concurrency,
        config.leaderboard.user_timeout,
    ));

    let passages = HashMap::from([(
        "AAPL".to_string(),
        vec![Passage {
            text: "Americas net sales decreased 4% year over year.".to_string(),
            score: 0.93,
            ticker: Some("AAPL".to_string()),
        }],
    )]);
    let query = Arc::new(RagQueryService::new(
        Arc::new(FixedEmbedder),
        Arc::new(TickerIndex {
            passages,
            offline: fixture.index_offline,
        }),
        Arc::new(EchoModel),
        config.vector_search.top_k,
    ));

    let state = AppState {
        config,
        leaderboard,
        query,
    };
    build_router(
        state,
        vec![HeaderValue::from_static("http://localhost:3000")],
    )
}

async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .expect("router response");
    let status = response.status();
    let body = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    (status, body.to_vec())
}

async fn post_query(router: Router, ticker: &str, question: &str) -> (StatusCode, Vec<u8>) {
    let payload = serde_json::json!({ "ticker": ticker, "question": question });
    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/query")
                .method("POST")
                .header("Content-Type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .expect("router response");
    let status = response.status();
    let body = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    (status, body.to_vec())
}

#[tokio::test]
async fn healthz_is_ok() {
    let (status, body) = get(build_app(Fixture::default()), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn leaderboard_ranks_gain_above_loss() {
    let (status, body) = get(build_app(Fixture::default()), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::OK);
    let board: Leaderboard = serde_json::from_slice(&body).expect("json");

    assert!(board.skipped.is_empty());
    assert_eq!(board.entries.len(), 2);
    assert_eq!(board.entries[0].rank, 1);
    assert_eq!(board.entries[0].username, "alice");
    assert_eq!(board.entries[0].portfolio, "tech");
    assert_eq!(board.entries[0].total_return, "10.00%");
    assert_eq!(board.entries[1].rank, 2);
    assert_eq!(board.entries[1].username, "bob");
    assert_eq!(board.entries[1].total_return, "-10.00%");
}

#[tokio::test]
async fn empty_directory_gives_empty_leaderboard() {
    let fixture = Fixture {
        users: Vec::new(),
        ..Fixture::default()
    };
    let (status, body) = get(build_app(fixture), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::OK);
    let board: Leaderboard = serde_json::from_slice(&body).expect("json");
    assert!(board.entries.is_empty());
    assert!(board.skipped.is_empty());
}

#[tokio::test]
async fn slow_user_is_dropped_without_blocking_others() {
    let fixture = Fixture {
        users: vec![user("alice"), user("slow"), user("bob")],
        records: vec![
            holding("alice", "tech", "AAPL", 100.0, 10.0),
            holding("slow", "tortoise", "AAPL", 100.0, 1.0),
            holding("bob", "value", "MSFT", 50.0, 10.0),
        ],
        slow_owner: Some("slow@example.com".to_string()),
        ..Fixture::default()
    };
    let (status, body) = get(build_app(fixture), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::OK);
    let board: Leaderboard = serde_json::from_slice(&body).expect("json");

    let names: Vec<&str> = board.entries.iter().map(|e| e.username.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);
    assert_eq!(board.skipped.len(), 1);
    assert_eq!(board.skipped[0].username, "slow");
    assert!(board.skipped[0].portfolio.is_none());
    assert!(board.skipped[0].reason.contains("timed out"));
}

#[tokio::test]
async fn stalled_symbol_only_drops_portfolios_holding_it() {
    let fixture = Fixture {
        records: vec![
            holding("alice", "tech", "AAPL", 100.0, 10.0),
            holding("alice", "stuck", "HANG", 10.0, 1.0),
            holding("alice", "stuck", "AAPL", 100.0, 1.0),
            holding("bob", "value", "MSFT", 50.0, 10.0),
        ],
        ..Fixture::default()
    };
    let (status, body) = get(build_app(fixture), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::OK);
    let board: Leaderboard = serde_json::from_slice(&body).expect("json");

    let ranked: Vec<(&str, &str)> = board
        .entries
        .iter()
        .map(|e| (e.username.as_str(), e.portfolio.as_str()))
        .collect();
    assert_eq!(ranked, vec![("alice", "tech"), ("bob", "value")]);
    assert_eq!(board.skipped.len(), 1);
    assert_eq!(board.skipped[0].username, "alice");
    assert_eq!(board.skipped[0].portfolio.as_deref(), Some("stuck"));
}

#[tokio::test]
async fn invalid_portfolios_are_reported_not_ranked() {
    let fixture = Fixture {
        records: vec![
            holding("alice", "tech", "AAPL", 100.0, 10.0),
            holding("alice", "gift", "AAPL", 0.0, 3.0),
            holding("bob", "value", "MSFT", 50.0, 10.0),
            holding("bob", "delisted", "ENRN", 20.0, 10.0),
        ],
        ..Fixture::default()
    };
    let (status, body) = get(build_app(fixture), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::OK);
    let board: Leaderboard = serde_json::from_slice(&body).expect("json");

    assert_eq!(board.entries.len(), 2);
    assert!(board
        .entries
        .iter()
        .all(|e| e.total_return.ends_with('%') && e.return_pct.is_finite()));
    let mut skipped: Vec<&str> = board
        .skipped
        .iter()
        .filter_map(|s| s.portfolio.as_deref())
        .collect();
    skipped.sort();
    assert_eq!(skipped, vec!["delisted", "gift"]);
}

#[tokio::test]
async fn unreadable_directory_is_a_server_error() {
    let fixture = Fixture {
        directory_offline: true,
        ..Fixture::default()
    };
    let (status, _) = get(build_app(fixture), "/api/leaderboard").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn user_returns_lists_each_portfolio() {
    let fixture = Fixture {
        records: vec![
            holding("alice", "tech", "AAPL", 100.0, 10.0),
            holding("alice", "gift", "AAPL", 0.0, 3.0),
        ],
        ..Fixture::default()
    };
    let (status, body) = get(build_app(fixture), "/api/users/alice@example.com/returns").await;
    assert_eq!(status, StatusCode::OK);
    let report: UserPortfolioReport = serde_json::from_slice(&body).expect("json");
    assert_eq!(report.portfolios.len(), 2);
    assert_eq!(report.portfolios[0].portfolio, "tech");
    assert_eq!(report.portfolios[0].total_return.as_deref(), Some("10.00%"));
    assert_eq!(report.portfolios[1].portfolio, "gift");
    assert!(report.portfolios[1].error.is_some());
}

#[tokio::test]
async fn query_answer_escapes_dollars() {
    let (status, body) = post_query(
        build_app(Fixture::default()),
        "aapl",
        "How much did Americas net sales decrease?",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: QueryResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(response.status, AnswerStatus::Found);
    assert_eq!(response.answer, "Net sales fell by \\$12.5 billion.");
    assert_eq!(response.passages, 1);
}

#[tokio::test]
async fn query_without_matches_is_not_found() {
    let (status, body) = post_query(build_app(Fixture::default()), "TSLA", "Any recalls?").await;
    assert_eq!(status, StatusCode::OK);
    let response: QueryResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(response.status, AnswerStatus::NotFound);
    assert_eq!(
        response.answer,
        "No information found for TSLA in the indexed documents."
    );
}

#[tokio::test]
async fn empty_question_is_bad_request() {
    let (status, _) = post_query(build_app(Fixture::default()), "AAPL", "  ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn offline_index_is_service_unavailable() {
    let fixture = Fixture {
        index_offline: true,
        ..Fixture::default()
    };
    let (status, _) = post_query(build_app(fixture), "AAPL", "Revenue?").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
