use anyhow::{Context, Result};
use env_logger::Env;
use msgbus::{connect_consumer, signal, LogCallback, Subscriber, SubscriberConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = SubscriberConfig::from_env()?;
    log::info!(
        "msgbus-subscriber starting; broker={} channel={} group={} poll_timeout={:?}",
        config.broker.masked_address(),
        config.channel,
        config.group_id,
        config.poll_timeout
    );

    let consumer = connect_consumer(&config.broker, &config.group_id)
        .await
        .context("connecting consumer")?;

    let token = CancellationToken::new();
    let watcher = signal::cancel_on_shutdown(token.clone());

    let result = Subscriber::new(consumer, &config)
        .run(&LogCallback, token.clone())
        .await;
    token.cancel();
    watcher.await.ok();

    let stats = result.context("subscriber loop failed")?;
    log::info!(
        "msgbus-subscriber finished; received={} skipped_errors={}",
        stats.received,
        stats.skipped_errors
    );
    Ok(())
}
