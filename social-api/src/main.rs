//! HTTP surface for scraping clients to stage content items.
use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use social_common::metrics::setup_metrics_recorder;
use social_common::staging::StagingWriter;
use social_common::store::RedisStoreClient;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    // Connecting fails fast: an api that cannot reach the store must not
    // accept staging requests it would drop on the floor.
    let store = Arc::new(
        RedisStoreClient::connect(&config.redis_url)
            .await
            .expect("failed to connect to the keyed store"),
    );
    let writer = Arc::new(StagingWriter::new(store));

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::app(writer, Some(recorder_handle));

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start social-api http server, {}", e),
    }
}
