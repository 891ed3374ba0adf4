use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::{
    sync::{Mutex, RwLock},
    time::{sleep, timeout},
};
use tracing::warn;

const MAX_SYMBOL_LEN: usize = 16;

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Most recent daily close. No data is an error, never `0.0`.
    async fn latest_close(&self, symbol: &str) -> Result<f64>;
}

/// Lookup failures that another attempt cannot fix.
#[derive(Debug, thiserror::Error)]
pub enum PriceLookupError {
    #[error("invalid symbol {0:?}")]
    InvalidSymbol(String),
    #[error("unknown or delisted symbol {0}")]
    UnknownSymbol(String),
    #[error("market data error for {symbol}: {description}")]
    Rejected { symbol: String, description: String },
    #[error("no closing price for {0}")]
    NoClose(String),
}

fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PriceLookupError>().is_some()
}

/// Upper-cases a stored symbol and rejects anything that could alter the
/// request path.
pub fn normalize_symbol(raw: &str) -> Result<String, PriceLookupError> {
    let symbol = raw.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if valid {
        Ok(symbol)
    } else {
        Err(PriceLookupError::InvalidSymbol(raw.to_string()))
    }
}

#[derive(Clone)]
pub struct StaticPriceOracle {
    prices: HashMap<String, f64>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(symbol, price)| (symbol.to_uppercase(), price))
                .collect(),
        }
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn latest_close(&self, symbol: &str) -> Result<f64> {
        self.prices
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| PriceLookupError::UnknownSymbol(symbol.to_string()).into())
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

/// Daily closes from the Yahoo Finance chart endpoint, cached in memory for
/// `ttl` so a symbol held by many users is fetched once per window.
#[derive(Clone)]
pub struct YahooPriceOracle {
    client: Client,
    api_base: String,
    cache: Arc<RwLock<HashMap<String, CachedPrice>>>,
    // One lock per symbol; concurrent misses wait for the first fetch.
    in_flight: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    ttl: Duration,
}

#[derive(Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

impl YahooPriceOracle {
    pub fn new(api_base: String, ttl: Duration, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) portfolio-leaderboard/0.1")
            .timeout(request_timeout)
            .build()
            .context("failed to build market data client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        })
    }

    async fn cached_price(&self, symbol: &str) -> Option<f64> {
        let cache = self.cache.read().await;
        cache
            .get(symbol)
            .filter(|entry| entry.fetched_at.elapsed() <= self.ttl)
            .map(|entry| entry.price)
    }

    async fn store_price(&self, symbol: &str, price: f64) {
        let mut cache = self.cache.write().await;
        cache.insert(
            symbol.to_string(),
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
    }

    async fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.in_flight.lock().await;
        locks.entry(symbol.to_string()).or_default().clone()
    }

    async fn fetch_close(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/v8/finance/chart/{}", self.api_base, symbol);
        let resp = self
            .client
            .get(url)
            .query(&[("range", "5d"), ("interval", "1d")])
            .send()
            .await
            .with_context(|| format!("market data request failed for {symbol}"))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PriceLookupError::UnknownSymbol(symbol.to_string()).into());
        }
        if !status.is_success() {
            anyhow::bail!("market data returned status {status} for {symbol}");
        }
        let body: ChartResponse = resp
            .json()
            .await
            .with_context(|| format!("failed to decode market data for {symbol}"))?;

        Ok(last_close(body, symbol)?)
    }
}

#[async_trait]
impl PriceOracle for YahooPriceOracle {
    async fn latest_close(&self, symbol: &str) -> Result<f64> {
        let symbol = normalize_symbol(symbol)?;
        if let Some(price) = self.cached_price(&symbol).await {
            return Ok(price);
        }

        let lock = self.symbol_lock(&symbol).await;
        let _guard = lock.lock().await;
        if let Some(price) = self.cached_price(&symbol).await {
            return Ok(price);
        }

        let price = self.fetch_close(&symbol).await?;
        self.store_price(&symbol, price).await;
        Ok(price)
    }
}

/// Last non-null, positive close in a chart response.
fn last_close(body: ChartResponse, symbol: &str) -> Result<f64, PriceLookupError> {
    if let Some(error) = body.chart.error {
        return Err(PriceLookupError::Rejected {
            symbol: symbol.to_string(),
            description: error.description,
        });
    }

    body.chart
        .result
        .and_then(|results| results.into_iter().next())
        .and_then(|data| data.indicators.quote.into_iter().next())
        .and_then(|quote| {
            quote
                .close
                .into_iter()
                .rev()
                .flatten()
                .find(|price| price.is_finite() && *price > 0.0)
        })
        .ok_or_else(|| PriceLookupError::NoClose(symbol.to_string()))
}

/// Retries the inner oracle with linear backoff (`backoff * attempt`).
/// Each attempt is cut off after `attempt_timeout`; permanent failures are
/// returned straight away.
pub struct RetryPriceOracle<O> {
    inner: Arc<O>,
    max_attempts: u32,
    backoff: Duration,
    attempt_timeout: Duration,
}

impl<O> RetryPriceOracle<O> {
    pub fn new(
        inner: Arc<O>,
        max_attempts: u32,
        backoff: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
            attempt_timeout,
        }
    }
}

#[async_trait]
impl<O> PriceOracle for RetryPriceOracle<O>
where
    O: PriceOracle,
{
    async fn latest_close(&self, symbol: &str) -> Result<f64> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.attempt_timeout, self.inner.latest_close(symbol)).await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "price lookup for {symbol} timed out after {}ms",
                    self.attempt_timeout.as_millis()
                )),
            };
            match result {
                Ok(price) => return Ok(price),
                Err(err) if attempt < self.max_attempts && !is_permanent(&err) => {
                    warn!(error = %err, %symbol, attempt, "price lookup failed, retrying");
                    sleep(self.backoff * attempt).await;
                }
                Err(err) => {
                    metrics::counter!("price_lookup_failures_total").increment(1);
                    return Err(err);
                }
            }
        }
    }
}
