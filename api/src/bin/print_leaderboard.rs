use api::{bootstrap::build_state, config::AppConfig, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;
    let config = AppConfig::from_env()?;
    let state = build_state(&config).await?;

    let board = state.leaderboard.build().await?;
    if board.entries.is_empty() {
        println!("No ranked portfolios yet.");
    } else {
        println!("Here are the top portfolios on the platform!");
        println!("{:>4}  {:<20} {:<24} {:>12}", "Rank", "Username", "Portfolio Name", "Total Return");
        for entry in &board.entries {
            println!(
                "{:>4}  {:<20} {:<24} {:>12}",
                entry.rank, entry.username, entry.portfolio, entry.total_return
            );
        }
    }

    for skipped in &board.skipped {
        tracing::warn!(
            username = %skipped.username,
            portfolio = skipped.portfolio.as_deref().unwrap_or("-"),
            reason = %skipped.reason,
            "not ranked"
        );
    }

    Ok(())
}
