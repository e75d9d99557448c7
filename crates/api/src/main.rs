use std::sync::Arc;

use anyhow::Context;

use ordersync_api::app::{self, AppServices};
use ordersync_infra::config::AppConfig;
use ordersync_infra::upstream::shopify::ShopifyClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ordersync_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let client = ShopifyClient::new(&config.upstream).context("building upstream client")?;
    let services = Arc::new(AppServices::from_config(&config, Arc::new(client)).await?);

    let recovered = services.orchestrator.recover();
    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "resumed interrupted import jobs");
    }
    tokio::spawn(services.clone().run_janitor());

    let app = app::build_app(services);
    let listener = tokio::net::TcpListener::bind(config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, shop = %config.upstream.shop_domain, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
