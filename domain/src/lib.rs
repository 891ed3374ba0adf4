use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub email: String,
    pub username: String,
}

/// One row of the holdings table: a purchase of `amount` units of `stock`
/// at `unit_price`, filed under `portfolio` for `owner`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HoldingRecord {
    pub owner: String,
    pub portfolio: String,
    pub stock: String,
    pub unit_price: f64,
    pub amount: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PortfolioReturn {
    pub portfolio: String,
    pub principal: f64,
    pub current_value: f64,
    pub return_pct: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub username: String,
    pub portfolio: String,
    /// Display form, e.g. `"10.00%"`.
    pub total_return: String,
    pub return_pct: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SkippedPortfolio {
    pub username: String,
    /// `None` when the whole user was dropped (timeout, store failure).
    pub portfolio: Option<String>,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Leaderboard {
    pub entries: Vec<LeaderboardEntry>,
    pub skipped: Vec<SkippedPortfolio>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PortfolioStatus {
    pub portfolio: String,
    pub total_return: Option<String>,
    pub return_pct: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserPortfolioReport {
    pub email: String,
    pub portfolios: Vec<PortfolioStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub ticker: String,
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Found,
    NotFound,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryResponse {
    pub status: AnswerStatus,
    pub answer: String,
    pub passages: usize,
}
