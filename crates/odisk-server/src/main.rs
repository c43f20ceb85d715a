use anyhow::Context;
use odisk_server::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Structured JSON logs (request logs are emitted from tracing spans in
    // `http::observability`).
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .init();

    if let Some(path) = &config.source {
        tracing::info!(path = %path.display(), "loaded configuration file");
    }
    config.persist_if_missing();

    let server = odisk_server::start(config.server_config()).await?;
    tracing::info!(
        "odisk-server listening on http://{} (root: {})",
        server.addr(),
        config.root.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutting down");
    server.shutdown().await
}
