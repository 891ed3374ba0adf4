use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use domain::HoldingRecord;
use futures::future::join_all;
use leaderboard::{
    PortfolioOutcome, UserValuation, ValuationError, group_by_portfolio, value_portfolio,
};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{repositories::HoldingRepository, services::market_data::PriceOracle};

/// Values every portfolio of a single user against live closing prices.
pub struct PortfolioValuer {
    holdings: Arc<dyn HoldingRepository>,
    oracle: Arc<dyn PriceOracle>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl PortfolioValuer {
    pub fn new(
        holdings: Arc<dyn HoldingRepository>,
        oracle: Arc<dyn PriceOracle>,
        max_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            holdings,
            oracle,
            max_attempts: max_attempts.max(1),
            retry_backoff,
        }
    }

    /// Fails only when the holdings store is unreachable; per-portfolio
    /// problems are carried inside the returned outcomes.
    pub async fn value_user(&self, email: &str) -> Result<UserValuation> {
        let records = self.fetch_holdings_with_retry(email).await?;
        if records.is_empty() {
            return Ok(UserValuation::default());
        }

        let groups = group_by_portfolio(records);
        let prices = self.price_symbols(&groups_symbols(&groups)).await;

        let portfolios = groups
            .iter()
            .map(|group| {
                let result = value_portfolio(group, |symbol| {
                    match prices.get(symbol) {
                        Some(Ok(price)) => Ok(*price),
                        Some(Err(reason)) => Err(ValuationError::PriceUnavailable {
                            symbol: symbol.to_string(),
                            reason: reason.clone(),
                        }),
                        None => Err(ValuationError::PriceUnavailable {
                            symbol: symbol.to_string(),
                            reason: "not priced".to_string(),
                        }),
                    }
                });
                if let Err(err) = &result {
                    warn!(%email, portfolio = %group.name, error = %err, "portfolio valuation failed");
                }
                PortfolioOutcome {
                    portfolio: group.name.clone(),
                    result,
                }
            })
            .collect();

        Ok(UserValuation { portfolios })
    }

    async fn fetch_holdings_with_retry(&self, email: &str) -> Result<Vec<HoldingRecord>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.holdings.holdings_for_owner(email).await {
                Ok(records) => return Ok(records),
                Err(err) if attempt < self.max_attempts => {
                    warn!(error = %err, %email, attempt, "holdings fetch failed, retrying");
                    sleep(self.retry_backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One lookup per distinct symbol, issued concurrently.
    async fn price_symbols(&self, symbols: &[String]) -> HashMap<String, Result<f64, String>> {
        let lookups = symbols.iter().map(|symbol| async move {
            let result = self
                .oracle
                .latest_close(symbol)
                .await
                .and_then(|price| {
                    if price.is_finite() && price > 0.0 {
                        Ok(price)
                    } else {
                        Err(anyhow::anyhow!("invalid close {price} for {symbol}"))
                    }
                })
                .map_err(|err| format!("{err:#}"));
            (symbol.clone(), result)
        });
        let prices: HashMap<_, _> = join_all(lookups).await.into_iter().collect();
        debug!(symbols = prices.len(), "symbols priced");
        prices
    }
}

fn groups_symbols(groups: &[leaderboard::PortfolioHoldings]) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in groups.iter().flat_map(|g| g.symbols()) {
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}
