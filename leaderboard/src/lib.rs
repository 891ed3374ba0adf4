use std::collections::HashMap;

use domain::{HoldingRecord, LeaderboardEntry, PortfolioReturn, SkippedPortfolio, User};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValuationError {
    #[error("portfolio {portfolio} has zero principal")]
    ZeroPrincipal { portfolio: String },
    #[error("no price available for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },
}

impl ValuationError {
    /// Short label used for metrics and skip reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ValuationError::ZeroPrincipal { .. } => "zero_principal",
            ValuationError::PriceUnavailable { .. } => "price_unavailable",
        }
    }
}

pub type ValuationResult<T> = Result<T, ValuationError>;

/// Holdings sharing one (owner, portfolio name) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioHoldings {
    pub name: String,
    pub holdings: Vec<HoldingRecord>,
}

impl PortfolioHoldings {
    pub fn principal(&self) -> f64 {
        self.holdings
            .iter()
            .map(|h| h.unit_price * h.amount)
            .sum()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.holdings.iter().map(|h| h.stock.as_str())
    }
}

/// Groups records by portfolio name, keeping the order in which each
/// portfolio first shows up in `records`.
pub fn group_by_portfolio(records: Vec<HoldingRecord>) -> Vec<PortfolioHoldings> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<PortfolioHoldings> = Vec::new();
    for record in records {
        match index.get(&record.portfolio) {
            Some(&position) => groups[position].holdings.push(record),
            None => {
                index.insert(record.portfolio.clone(), groups.len());
                groups.push(PortfolioHoldings {
                    name: record.portfolio.clone(),
                    holdings: vec![record],
                });
            }
        }
    }
    groups
}

/// `None` when the principal is zero or the result is not finite.
pub fn percentage_return(principal: f64, current_value: f64) -> Option<f64> {
    if principal == 0.0 || !principal.is_finite() {
        return None;
    }
    let pct = (current_value - principal) / principal * 100.0;
    pct.is_finite().then_some(pct)
}

/// Values one portfolio. `price_of` returns the latest close for a symbol;
/// its first error fails the whole portfolio.
pub fn value_portfolio<F>(group: &PortfolioHoldings, price_of: F) -> ValuationResult<PortfolioReturn>
where
    F: Fn(&str) -> ValuationResult<f64>,
{
    let principal = group.principal();
    if principal == 0.0 || !principal.is_finite() {
        return Err(ValuationError::ZeroPrincipal {
            portfolio: group.name.clone(),
        });
    }

    let mut current_value = 0.0;
    for holding in &group.holdings {
        current_value += price_of(&holding.stock)? * holding.amount;
    }

    let return_pct =
        percentage_return(principal, current_value).ok_or_else(|| ValuationError::ZeroPrincipal {
            portfolio: group.name.clone(),
        })?;

    Ok(PortfolioReturn {
        portfolio: group.name.clone(),
        principal,
        current_value,
        return_pct,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioOutcome {
    pub portfolio: String,
    pub result: ValuationResult<PortfolioReturn>,
}

/// Every portfolio of one user, in first-appearance order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserValuation {
    pub portfolios: Vec<PortfolioOutcome>,
}

impl UserValuation {
    /// Successfully valued (portfolio, return%) pairs, in order.
    pub fn returns(&self) -> Vec<(&str, f64)> {
        self.portfolios
            .iter()
            .filter_map(|outcome| {
                outcome
                    .result
                    .as_ref()
                    .ok()
                    .map(|r| (outcome.portfolio.as_str(), r.return_pct))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.portfolios.is_empty()
    }
}

/// Result of valuing one user inside the leaderboard fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum UserOutcome {
    Valued(UserValuation),
    Failed(String),
}

pub fn format_return(return_pct: f64) -> String {
    format!("{return_pct:.2}%")
}

/// Numeric value of the two-decimal display string, so ordering agrees with
/// what is shown.
fn displayed_value(total_return: &str, fallback: f64) -> f64 {
    total_return
        .trim_end_matches('%')
        .parse::<f64>()
        .unwrap_or(fallback)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedRow {
    pub username: String,
    pub portfolio: String,
    pub return_pct: f64,
}

/// Sorts rows descending by displayed return (stable, so ties keep input
/// order) and assigns contiguous 1-based ranks.
pub fn rank_rows(rows: Vec<RankedRow>) -> Vec<LeaderboardEntry> {
    let mut formatted: Vec<(f64, RankedRow, String)> = rows
        .into_iter()
        .map(|row| {
            let display = format_return(row.return_pct);
            (displayed_value(&display, row.return_pct), row, display)
        })
        .collect();
    formatted.sort_by(|a, b| b.0.total_cmp(&a.0));

    formatted
        .into_iter()
        .enumerate()
        .map(|(idx, (_, row, total_return))| LeaderboardEntry {
            rank: idx + 1,
            username: row.username,
            portfolio: row.portfolio,
            total_return,
            return_pct: row.return_pct,
        })
        .collect()
}

/// Flattens per-user outcomes (in directory order) into ranked entries plus
/// a report of everything that could not be ranked.
pub fn build_leaderboard(
    outcomes: Vec<(User, UserOutcome)>,
) -> (Vec<LeaderboardEntry>, Vec<SkippedPortfolio>) {
    let mut rows = Vec::new();
    let mut skipped = Vec::new();

    for (user, outcome) in outcomes {
        match outcome {
            UserOutcome::Valued(valuation) => {
                for portfolio in valuation.portfolios {
                    match portfolio.result {
                        Ok(valued) => rows.push(RankedRow {
                            username: user.username.clone(),
                            portfolio: portfolio.portfolio,
                            return_pct: valued.return_pct,
                        }),
                        Err(err) => skipped.push(SkippedPortfolio {
                            username: user.username.clone(),
                            portfolio: Some(portfolio.portfolio),
                            reason: err.to_string(),
                        }),
                    }
                }
            }
            UserOutcome::Failed(reason) => skipped.push(SkippedPortfolio {
                username: user.username.clone(),
                portfolio: None,
                reason,
            }),
        }
    }

    (rank_rows(rows), skipped)
}
