use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use social_common::metrics;
use social_common::staging::StagingWriter;

use super::stage;

pub fn app(writer: Arc<StagingWriter>, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route(
            "/stage",
            routing::post(stage::post).with_state(writer.clone()),
        )
        .route("/staged", routing::get(stage::get).with_state(writer))
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "social staging api"
}
