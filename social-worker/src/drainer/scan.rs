use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use social_common::item::{ContentItem, Source};
use social_common::staging::staging_pattern;
use social_common::store::{StoreClient, StoreError};

use crate::drainer::{CycleStats, QueueDrainer};
use crate::error::ItemError;
use crate::processor::ItemProcessor;

/// The poll-queue drain protocol: enumerate staged keys per source pattern,
/// read each document, and delete the key only once the sink durably accepted
/// the item. A key's mere existence is the "undelivered" marker, so every
/// failure path leaves the key where it is.
pub struct ScanDrainer {
    store: Arc<dyn StoreClient>,
    processor: Arc<ItemProcessor>,
    page_size: usize,
}

impl ScanDrainer {
    pub fn new(
        store: Arc<dyn StoreClient>,
        processor: Arc<ItemProcessor>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            processor,
            page_size,
        }
    }

    async fn drain_source(
        &self,
        source: Source,
        stats: &mut CycleStats,
    ) -> Result<(), StoreError> {
        let pattern = staging_pattern(source);
        // Accumulate the full key set for this pattern before processing.
        let keys = self.store.scan_keys(&pattern, self.page_size).await?;
        if keys.is_empty() {
            debug!(pattern = %pattern, "no staged keys for pattern");
            return Ok(());
        }

        info!(pattern = %pattern, count = keys.len(), "found staged keys to drain");

        for key in keys {
            let document = match self.store.get_document(&key).await? {
                Some(document) if !document.trim().is_empty() && document != "null" => document,
                _ => {
                    // Stale or empty entry: clean it up, but it is not a
                    // processing success.
                    self.store.delete(&key).await?;
                    stats.cleaned += 1;
                    metrics::counter!(
                        "drainer_keys_cleaned_total",
                        &[("source", source.label())]
                    )
                    .increment(1);
                    warn!(key = %key, "deleted empty staged entry");
                    continue;
                }
            };

            let item = match serde_json::from_str::<ContentItem>(&document) {
                Ok(item) => item,
                Err(e) => {
                    // Left in place for manual inspection; must not block the
                    // other keys in this cycle.
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "decode")]
                    )
                    .increment(1);
                    warn!(key = %key, "leaving malformed staged document in place: {}", e);
                    continue;
                }
            };

            match self.processor.process(item).await {
                Ok(()) => {
                    self.store.delete(&key).await?;
                    stats.record_processed(source);
                    metrics::counter!(
                        "drainer_items_processed_total",
                        &[("source", source.label())]
                    )
                    .increment(1);
                    debug!(key = %key, "staged item sunk and deleted");
                }
                Err(ItemError::EmptyContent) => {
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "empty_content")]
                    )
                    .increment(1);
                    warn!(key = %key, "no valid text in staged item, leaving key in place");
                }
                Err(ItemError::SinkError(e)) => {
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "sink")]
                    )
                    .increment(1);
                    error!(key = %key, "sink write failed, key kept for retry: {}", e);
                }
                Err(ItemError::DecodeError(e)) => {
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "decode")]
                    )
                    .increment(1);
                    warn!(key = %key, "failed to decode staged item, leaving key in place: {}", e);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueueDrainer for ScanDrainer {
    async fn drain_once(&mut self) -> Result<CycleStats, StoreError> {
        let mut stats = CycleStats::default();

        for source in Source::ALL {
            self.drain_source(source, &mut stats).await?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::FixedSentimentClient;
    use crate::report::ReportAccumulator;
    use crate::sink::MemorySink;
    use social_common::item::{ChildItem, ItemMetadata, Sentiment};
    use social_common::staging::{staging_key, StageOutcome, StagingWriter};
    use social_common::store::MemoryStoreClient;

    struct Fixture {
        store: Arc<MemoryStoreClient>,
        sink: Arc<MemorySink>,
        classifier: Arc<FixedSentimentClient>,
        reports: ReportAccumulator,
        drainer: ScanDrainer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStoreClient::new());
        let sink = Arc::new(MemorySink::new());
        let classifier = Arc::new(FixedSentimentClient::new(Sentiment::Positive));
        let reports = ReportAccumulator::new();
        let processor = Arc::new(ItemProcessor::new(
            classifier.clone(),
            sink.clone(),
            reports.clone(),
        ));
        let drainer = ScanDrainer::new(store.clone(), processor, 50);

        Fixture {
            store,
            sink,
            classifier,
            reports,
            drainer,
        }
    }

    fn reddit_item(content_id: &str, text: &str) -> ContentItem {
        ContentItem {
            content_id: content_id.to_owned(),
            partition_key: "formula1".to_owned(),
            source: Source::Reddit,
            text: text.to_owned(),
            comments: Vec::new(),
            metadata: ItemMetadata::default(),
        }
    }

    async fn stage(fixture: &Fixture, item: &ContentItem) {
        let writer = StagingWriter::new(fixture.store.clone());
        assert_eq!(writer.stage(item).await.unwrap(), StageOutcome::Staged);
    }

    #[tokio::test]
    async fn drains_staged_items_to_the_sink_and_deletes_keys() {
        let mut f = fixture();
        stage(&f, &reddit_item("reddit_post_a", "good")).await;
        stage(&f, &reddit_item("reddit_post_b", "bad")).await;

        let stats = f.drainer.drain_once().await.unwrap();

        assert_eq!(stats.processed.get(&Source::Reddit), Some(&2));
        assert!(stats.worked());
        assert_eq!(f.sink.records().len(), 2);
        assert_eq!(f.reports.count(Source::Reddit), 2);
        assert!(f
            .store
            .scan_keys("reddit:json:*", 50)
            .await
            .unwrap()
            .is_empty());

        // Next cycle finds nothing: the idle tier of the backoff applies.
        let stats = f.drainer.drain_once().await.unwrap();
        assert!(!stats.worked());
    }

    #[tokio::test]
    async fn sink_failure_keeps_the_key_for_the_next_cycle() {
        let mut f = fixture();
        stage(&f, &reddit_item("reddit_post_a", "good")).await;
        f.sink.fail_times(1);

        let stats = f.drainer.drain_once().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(!stats.worked());
        let key = staging_key(Source::Reddit, "reddit_post_a");
        assert!(f.store.get_document(&key).await.unwrap().is_some());

        // Attempt 2 succeeds: exactly one surviving sink record, key gone.
        let stats = f.drainer.drain_once().await.unwrap();
        assert_eq!(stats.processed_total(), 1);
        assert_eq!(f.sink.records().len(), 1);
        assert!(f.store.get_document(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crash_between_sink_and_delete_duplicates_but_never_loses() {
        let f = fixture();
        let item = reddit_item("reddit_post_a", "good");
        stage(&f, &item).await;

        // First consumer sinks the item but dies before deleting the key.
        let crashed = ItemProcessor::new(
            f.classifier.clone(),
            f.sink.clone(),
            f.reports.clone(),
        );
        crashed.process(item).await.unwrap();
        assert_eq!(f.sink.records().len(), 1);

        // A restarted drainer re-reads the still-present key.
        let mut restarted = ScanDrainer::new(
            f.store.clone(),
            Arc::new(ItemProcessor::new(
                f.classifier.clone(),
                f.sink.clone(),
                f.reports.clone(),
            )),
            50,
        );
        let stats = restarted.drain_once().await.unwrap();

        assert_eq!(stats.processed_total(), 1);
        // At most one duplicate sink write, zero data loss.
        assert_eq!(f.sink.records().len(), 2);
        let key = staging_key(Source::Reddit, "reddit_post_a");
        assert!(f.store.get_document(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_documents_are_cleaned_without_processing() {
        let mut f = fixture();
        let key = staging_key(Source::Reddit, "reddit_post_a");
        f.store.put_document(&key, "").await.unwrap();

        let stats = f.drainer.drain_once().await.unwrap();

        assert_eq!(stats.cleaned, 1);
        assert!(stats.worked());
        assert_eq!(stats.processed_total(), 0);
        assert!(f.store.get_document(&key).await.unwrap().is_none());
        // Neither enrichment nor the sink ever saw the entry.
        assert_eq!(f.classifier.calls(), 0);
        assert!(f.sink.records().is_empty());
    }

    #[tokio::test]
    async fn malformed_documents_are_left_in_place() {
        let mut f = fixture();
        let key = staging_key(Source::Reddit, "reddit_post_a");
        f.store.put_document(&key, "{not json").await.unwrap();
        stage(&f, &reddit_item("reddit_post_b", "fine")).await;

        let stats = f.drainer.drain_once().await.unwrap();

        // The malformed key does not block the healthy one.
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed_total(), 1);
        assert!(f.store.get_document(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_content_is_kept_and_not_reported() {
        let mut f = fixture();
        let item = ContentItem {
            comments: vec![ChildItem {
                content_id: "reddit_comm_a".to_owned(),
                text: "   ".to_owned(),
                metadata: ItemMetadata::default(),
            }],
            ..reddit_item("reddit_post_a", "  ")
        };
        stage(&f, &item).await;

        let stats = f.drainer.drain_once().await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed_total(), 0);
        let key = staging_key(Source::Reddit, "reddit_post_a");
        assert!(f.store.get_document(&key).await.unwrap().is_some());
        assert_eq!(f.reports.count(Source::Reddit), 0);
        assert!(f.sink.records().is_empty());
    }
}
