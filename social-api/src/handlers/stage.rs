use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_derive::Deserialize;
use tracing::{debug, error};

use social_common::item::{ContentItem, Source};
use social_common::staging::{StageError, StageOutcome, StagingWriter};

#[derive(Serialize, Deserialize)]
pub struct StagePostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StagePostResponse {
    fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_owned()),
            error: None,
        }
    }

    fn error(error: &str) -> Self {
        Self {
            status: None,
            error: Some(error.to_owned()),
        }
    }
}

/// Stage a fully-built content item on behalf of a scraping client.
pub async fn post(
    State(writer): State<Arc<StagingWriter>>,
    Json(item): Json<ContentItem>,
) -> Result<Json<StagePostResponse>, (StatusCode, Json<StagePostResponse>)> {
    debug!(content_id = %item.content_id, "received staging request");

    match writer.stage(&item).await {
        Ok(StageOutcome::Staged) => Ok(Json(StagePostResponse::status("staged"))),
        Ok(StageOutcome::Skipped) => Ok(Json(StagePostResponse::status("skipped"))),
        Err(StageError::IncompleteItem(field)) => Err((
            StatusCode::BAD_REQUEST,
            Json(StagePostResponse::error(&format!("item is missing a {}", field))),
        )),
        Err(StageError::SerializeError(e)) => {
            error!("failed to serialize staged item: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StagePostResponse::error("failed to serialize item")),
            ))
        }
        Err(StageError::StoreError(e)) => {
            // The producer must not advance its own bookkeeping on this path.
            error!("store unavailable while staging: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StagePostResponse::error("store unavailable")),
            ))
        }
    }
}

#[derive(Deserialize)]
pub struct StagedQuery {
    pub source: String,
    pub partition_key: String,
    pub content_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct StagedGetResponse {
    pub staged: bool,
}

/// Whether an id was already staged, so producers can skip rebuilding items.
pub async fn get(
    State(writer): State<Arc<StagingWriter>>,
    Query(query): Query<StagedQuery>,
) -> Result<Json<StagedGetResponse>, (StatusCode, Json<StagePostResponse>)> {
    let source = Source::from_str(&query.source).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(StagePostResponse::error(&format!(
                "{} is not a valid source",
                query.source
            ))),
        )
    })?;

    match writer
        .already_staged(source, &query.partition_key, &query.content_id)
        .await
    {
        Ok(staged) => Ok(Json(StagedGetResponse { staged })),
        Err(e) => {
            error!("store unavailable while checking staged id: {}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StagePostResponse::error("store unavailable")),
            ))
        }
    }
}
