use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::item::{ContentItem, Source};
use crate::store::{StoreClient, StoreError};

/// Logical name of the consumer group draining the source streams.
pub const CONSUMER_GROUP: &str = "sentiment_analysis_group";

/// Key a staged item document lives under: `<source>:json:<content_id>`.
pub fn staging_key(source: Source, content_id: &str) -> String {
    format!("{}:json:{}", source.label(), content_id)
}

/// Glob pattern matching every staged key of a source.
pub fn staging_pattern(source: Source) -> String {
    format!("{}:json:*", source.label())
}

/// Key of the per-partition dedup index set:
/// `processed_<source>_ids:<partition_key>`.
pub fn dedup_key(source: Source, partition_key: &str) -> String {
    format!("{}:{}", source.dedup_prefix(), partition_key)
}

/// Outcome of a staging attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The item was written to the store and recorded in the dedup index.
    Staged,
    /// The item's id was already in the dedup index; nothing was written.
    Skipped,
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("item is missing a {0}")]
    IncompleteItem(&'static str),
    #[error("failed to serialize item: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// Producer-side entry point: builds nothing itself, but decides whether a
/// fully-built item gets written, and keeps the dedup index in step.
pub struct StagingWriter {
    store: Arc<dyn StoreClient>,
}

impl StagingWriter {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Stage an item unless this producer already emitted it.
    ///
    /// The document write lands before the dedup index update: a crash
    /// between the two re-stages the item as a harmless overwrite on the next
    /// run, never a silent loss. On `StoreError` callers must not advance
    /// their own bookkeeping, since the item may not have been recorded.
    pub async fn stage(&self, item: &ContentItem) -> Result<StageOutcome, StageError> {
        if item.content_id.is_empty() {
            return Err(StageError::IncompleteItem("content_id"));
        }
        if item.partition_key.is_empty() {
            return Err(StageError::IncompleteItem("partition_key"));
        }

        let dedup = dedup_key(item.source, &item.partition_key);
        if self.store.set_contains(&dedup, &item.content_id).await? {
            debug!(
                content_id = %item.content_id,
                partition = %item.partition_key,
                "item already staged, skipping"
            );
            metrics::counter!(
                "staging_items_skipped_total",
                &[("source", item.source.label())]
            )
            .increment(1);
            return Ok(StageOutcome::Skipped);
        }

        let key = staging_key(item.source, &item.content_id);
        let document = serde_json::to_string(item)?;
        self.store.put_document(&key, &document).await?;
        self.store.set_add(&dedup, &item.content_id).await?;

        debug!(content_id = %item.content_id, key = %key, "item staged");
        metrics::counter!(
            "staging_items_staged_total",
            &[("source", item.source.label())]
        )
        .increment(1);

        Ok(StageOutcome::Staged)
    }

    /// Whether an id was already staged within a partition.
    pub async fn already_staged(
        &self,
        source: Source,
        partition_key: &str,
        content_id: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .set_contains(&dedup_key(source, partition_key), content_id)
            .await
    }
}

/// Producer-side publisher for the stream/ack protocol: appends an item's
/// fields to its source's append-only stream. Deduplication is the staging
/// writer's concern; the stream carries whatever producers hand it.
pub struct StreamPublisher {
    store: Arc<dyn StoreClient>,
}

impl StreamPublisher {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Append the item, returning the store-assigned entry id.
    pub async fn publish(&self, item: &ContentItem) -> Result<String, StageError> {
        let fields = item.to_stream_fields()?;
        let id = self
            .store
            .stream_append(item.source.stream_name(), &fields)
            .await?;

        debug!(content_id = %item.content_id, entry = %id, "item published to stream");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemMetadata;
    use crate::store::MemoryStoreClient;

    fn item(content_id: &str, partition_key: &str) -> ContentItem {
        ContentItem {
            content_id: content_id.to_owned(),
            partition_key: partition_key.to_owned(),
            source: Source::Reddit,
            text: "some text".to_owned(),
            comments: Vec::new(),
            metadata: ItemMetadata::default(),
        }
    }

    #[test]
    fn key_namespaces() {
        assert_eq!(
            staging_key(Source::Reddit, "reddit_post_x"),
            "reddit:json:reddit_post_x"
        );
        assert_eq!(staging_pattern(Source::YouTube), "youtube:json:*");
        assert_eq!(
            dedup_key(Source::YouTube, "video123"),
            "processed_youtube_ids:video123"
        );
    }

    #[tokio::test]
    async fn staging_is_idempotent_per_partition() {
        let store = Arc::new(MemoryStoreClient::new());
        let writer = StagingWriter::new(store.clone());
        let item = item("reddit_post_x", "formula1");

        assert_eq!(writer.stage(&item).await.unwrap(), StageOutcome::Staged);
        assert_eq!(writer.stage(&item).await.unwrap(), StageOutcome::Skipped);

        // Exactly one staged document, and the id is in the dedup index.
        let keys = store.scan_keys("reddit:json:*", 50).await.unwrap();
        assert_eq!(keys, vec!["reddit:json:reddit_post_x"]);
        assert!(writer
            .already_staged(Source::Reddit, "formula1", "reddit_post_x")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn same_id_in_another_partition_stages_again() {
        let store = Arc::new(MemoryStoreClient::new());
        let writer = StagingWriter::new(store);

        let first = item("reddit_post_x", "formula1");
        let second = item("reddit_post_x", "motorsports");
        assert_eq!(writer.stage(&first).await.unwrap(), StageOutcome::Staged);
        assert_eq!(writer.stage(&second).await.unwrap(), StageOutcome::Staged);
    }

    #[tokio::test]
    async fn incomplete_items_are_rejected() {
        let store = Arc::new(MemoryStoreClient::new());
        let writer = StagingWriter::new(store);

        let missing_id = item("", "formula1");
        assert!(matches!(
            writer.stage(&missing_id).await,
            Err(StageError::IncompleteItem("content_id"))
        ));

        let missing_partition = item("reddit_post_x", "");
        assert!(matches!(
            writer.stage(&missing_partition).await,
            Err(StageError::IncompleteItem("partition_key"))
        ));
    }

    #[tokio::test]
    async fn publish_appends_to_the_source_stream() {
        let store = Arc::new(MemoryStoreClient::new());
        let publisher = StreamPublisher::new(store.clone());
        let item = item("reddit_post_x", "formula1");

        let id = publisher.publish(&item).await.unwrap();

        store
            .create_group(Source::Reddit.stream_name(), CONSUMER_GROUP)
            .await
            .unwrap();
        let entries = store
            .read_group(Source::Reddit.stream_name(), CONSUMER_GROUP, "c1", 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        let decoded = ContentItem::from_stream_fields(&entries[0].fields).unwrap();
        assert_eq!(decoded, item);
    }
}
