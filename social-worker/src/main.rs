//! Drain staged social content through sentiment enrichment into the sink.
use std::str::FromStr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::watch;

use health::HealthRegistry;
use social_common::metrics::{serve, setup_metrics_routes};
use social_common::staging::CONSUMER_GROUP;
use social_common::store::{RedisStoreClient, StoreClient};
use social_worker::config::{Config, DrainMode};
use social_worker::coordinator::PipelineCoordinator;
use social_worker::drainer::{QueueDrainer, ScanDrainer, StreamDrainer};
use social_worker::enrich::HttpSentimentClient;
use social_worker::error::WorkerError;
use social_worker::processor::ItemProcessor;
use social_worker::report::ReportAccumulator;
use social_worker::sink::PostgresSink;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let mode = DrainMode::from_str(&config.drain_mode)
        .unwrap_or_else(|_| panic!("invalid drain mode: {}", config.drain_mode));

    let store: Arc<dyn StoreClient> = Arc::new(RedisStoreClient::connect(&config.redis_url).await?);
    let sink = Arc::new(PostgresSink::new(
        &config.database_url,
        config.max_pg_connections,
    )?);
    let classifier = Arc::new(HttpSentimentClient::new(
        &config.classifier_url,
        config.classifier_timeout.0,
    ));

    let reports = ReportAccumulator::new();
    let processor = Arc::new(ItemProcessor::new(classifier, sink, reports.clone()));

    let drainer: Box<dyn QueueDrainer> = match mode {
        DrainMode::Scan => Box::new(ScanDrainer::new(
            store.clone(),
            processor,
            config.scan_page_size,
        )),
        DrainMode::Stream => Box::new(StreamDrainer::new(
            store.clone(),
            processor,
            CONSUMER_GROUP,
            config.consumer_name.as_str(),
            config.stream_batch_size,
            config.stream_block_timeout.0.as_millis() as usize,
        )),
    };

    let liveness = HealthRegistry::new("liveness");
    let drainer_liveness = liveness
        .register("drainer".to_string(), time::Duration::seconds(60))
        .await;

    let router = Router::new().route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for the interrupt signal");
        _ = shutdown_tx.send(true);
    });

    let coordinator = PipelineCoordinator::new(
        drainer,
        reports,
        config.drain_interval.0,
        config.idle_interval.0,
        config.store_retry_interval.0,
        drainer_liveness,
    );

    // Blocks until interrupted; the flushed reports are what the rendering
    // stage consumes.
    let reports = coordinator.run(shutdown_rx).await;
    for report in reports {
        tracing::info!(
            source = %report.source,
            items = report.entries.len(),
            "report data ready for rendering"
        );
    }

    Ok(())
}
