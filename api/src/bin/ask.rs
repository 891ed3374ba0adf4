use api::{bootstrap::build_state, config::AppConfig, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;

    let mut args = std::env::args().skip(1);
    let (Some(ticker), question) = (args.next(), args.collect::<Vec<_>>().join(" ")) else {
        anyhow::bail!("usage: ask TICKER QUESTION...");
    };

    let config = AppConfig::from_env()?;
    let state = build_state(&config).await?;
    let answer = state.query.answer(&ticker, &question).await?;
    println!("{}", answer.message());

    Ok(())
}
