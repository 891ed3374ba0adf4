use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use domain::{Leaderboard, PortfolioStatus, User, UserPortfolioReport};
use leaderboard::{UserOutcome, UserValuation, build_leaderboard, format_return};
use tokio::{sync::Semaphore, time::timeout};
use tracing::{info, warn};

use crate::{repositories::UserRepository, services::valuation::PortfolioValuer};

pub struct LeaderboardService {
    users: Arc<dyn UserRepository>,
    valuer: Arc<PortfolioValuer>,
    max_concurrency: usize,
    user_timeout: Duration,
}

impl LeaderboardService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        valuer: Arc<PortfolioValuer>,
        max_concurrency: usize,
        user_timeout: Duration,
    ) -> Self {
        Self {
            users,
            valuer,
            max_concurrency: max_concurrency.max(1),
            user_timeout,
        }
    }

    /// Values every user concurrently and ranks all of their portfolios.
    /// Only a failure to read the user directory fails the whole board.
    pub async fn build(&self) -> Result<Leaderboard> {
        let users = self.users.list_users().await?;
        info!(
            user_count = users.len(),
            max_concurrency = self.max_concurrency,
            "building leaderboard"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(users.len());
        for user in users {
            let permit = semaphore.clone().acquire_owned().await?;
            let valuer = self.valuer.clone();
            let limit = self.user_timeout;
            let email = user.email.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                match timeout(limit, valuer.value_user(&email)).await {
                    Ok(Ok(valuation)) => UserOutcome::Valued(valuation),
                    Ok(Err(err)) => UserOutcome::Failed(format!("{err:#}")),
                    Err(_) => UserOutcome::Failed(format!(
                        "valuation timed out after {}ms",
                        limit.as_millis()
                    )),
                }
            });
            handles.push((user, handle));
        }

        let mut outcomes: Vec<(User, UserOutcome)> = Vec::with_capacity(handles.len());
        for (user, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    warn!(error = %join_err, email = %user.email, "valuation task join error");
                    UserOutcome::Failed("valuation task aborted".to_string())
                }
            };
            record_skips(&user, &outcome);
            outcomes.push((user, outcome));
        }

        let (entries, skipped) = build_leaderboard(outcomes);
        metrics::counter!("leaderboard_builds_total").increment(1);
        info!(
            entries = entries.len(),
            skipped = skipped.len(),
            "leaderboard built"
        );

        Ok(Leaderboard {
            entries,
            skipped,
            generated_at: Utc::now(),
        })
    }

    pub async fn user_report(&self, email: &str) -> Result<UserPortfolioReport> {
        let valuation = self.valuer.value_user(email).await?;
        Ok(UserPortfolioReport {
            email: email.to_string(),
            portfolios: portfolio_statuses(valuation),
        })
    }
}

fn record_skips(user: &User, outcome: &UserOutcome) {
    match outcome {
        UserOutcome::Valued(valuation) => {
            for portfolio in &valuation.portfolios {
                if let Err(err) = &portfolio.result {
                    metrics::counter!("leaderboard_skipped_total", "reason" => err.kind())
                        .increment(1);
                }
            }
        }
        UserOutcome::Failed(reason) => {
            warn!(email = %user.email, %reason, "user dropped from leaderboard");
            metrics::counter!("leaderboard_skipped_total", "reason" => "user_failed")
                .increment(1);
        }
    }
}

fn portfolio_statuses(valuation: UserValuation) -> Vec<PortfolioStatus> {
    valuation
        .portfolios
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(valued) => PortfolioStatus {
                portfolio: outcome.portfolio,
                total_return: Some(format_return(valued.return_pct)),
                return_pct: Some(valued.return_pct),
                error: None,
            },
            Err(err) => PortfolioStatus {
                portfolio: outcome.portfolio,
                total_return: None,
                return_pct: None,
                error: Some(err.to_string()),
            },
        })
        .collect()
}
