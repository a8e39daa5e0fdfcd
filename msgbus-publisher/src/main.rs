use anyhow::{Context, Result};
use env_logger::Env;
use msgbus::{connect_producer, payload, signal, Publisher, PublisherConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = PublisherConfig::from_env()?;
    let pacer = config.pacer()?;
    log::info!(
        "msgbus-publisher starting; broker={} channel={} key={} rate={} payload={}",
        config.broker.masked_address(),
        config.channel,
        config.key,
        config.messages_per_second,
        config.payload_path.display()
    );

    // A bad payload file fails before any broker connection is made.
    let source = payload::source_from_file(&config.payload_path, config.payload_mode)
        .with_context(|| format!("loading payload {}", config.payload_path.display()))?;

    let producer = connect_producer(&config.broker)
        .await
        .context("connecting producer")?;

    let token = CancellationToken::new();
    let watcher = signal::cancel_on_shutdown(token.clone());

    let result = Publisher::new(producer, source, &config, pacer)
        .run(token.clone())
        .await;
    token.cancel();
    watcher.await.ok();

    let stats = result.context("publisher loop failed")?;
    log::info!(
        "msgbus-publisher finished; sent={} failed={}",
        stats.sent,
        stats.failed
    );
    Ok(())
}
