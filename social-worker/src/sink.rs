use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use social_common::item::EnrichedItem;

/// Enumeration of errors for operations with the sink store.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("pool creation failed with: {0}")]
    PoolCreationError(sqlx::Error),
    #[error("insert failed with: {0}")]
    InsertError(sqlx::Error),
    #[error("failed to serialize document for the sink: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("sink rejected the write: {0}")]
    WriteError(String),
}

/// The downstream store of record for enriched items.
///
/// One logical write (or one reported failure) per item; errors are the
/// signal drainers use to withhold deletion/acknowledgment, so they must
/// never be swallowed here.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    async fn insert(&self, item: &EnrichedItem) -> Result<(), SinkError>;
}

/// `SinkWriter` inserting enriched items into a PostgreSQL table.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(database_url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(SinkError::PoolCreationError)?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SinkWriter for PostgresSink {
    async fn insert(&self, item: &EnrichedItem) -> Result<(), SinkError> {
        let document = serde_json::to_value(item)?;

        sqlx::query(
            r#"
INSERT INTO social_content
    (content_id, source, partition_key, sentiment, document, inserted_at)
VALUES
    ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(&item.item.content_id)
        .bind(item.item.source.to_string())
        .bind(&item.item.partition_key)
        .bind(item.sentiment.as_str())
        .bind(sqlx::types::Json(document))
        .execute(&self.pool)
        .await
        .map_err(SinkError::InsertError)?;

        Ok(())
    }
}

/// `SinkWriter` collecting items in memory, with failure injection. For tests.
#[derive(Default)]
pub struct MemorySink {
    inserted: Mutex<Vec<EnrichedItem>>,
    failures_left: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Make the next `n` inserts fail before writes start succeeding again.
    pub fn fail_times(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<EnrichedItem> {
        self.inserted.lock().expect("poisoned MemorySink").clone()
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    async fn insert(&self, item: &EnrichedItem) -> Result<(), SinkError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(SinkError::WriteError("injected failure".to_owned()));
        }

        self.inserted
            .lock()
            .expect("poisoned MemorySink")
            .push(item.clone());
        Ok(())
    }
}
