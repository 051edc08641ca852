use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use social_common::item::{ContentItem, Source};
use social_common::store::{StoreClient, StoreError, StreamEntry};

use crate::drainer::{CycleStats, QueueDrainer};
use crate::processor::ItemProcessor;

/// The consumer-group drain protocol: grouped blocking reads over the
/// per-source append-only streams, acknowledging entries only after the sink
/// accepted them. Unacknowledged entries stay in the group's pending list
/// until a recovering consumer claims them.
pub struct StreamDrainer {
    store: Arc<dyn StoreClient>,
    processor: Arc<ItemProcessor>,
    group: String,
    /// Our name within the group; what pending entries get attributed to.
    consumer: String,
    batch_size: usize,
    block_ms: usize,
    groups_ready: bool,
}

impl StreamDrainer {
    pub fn new(
        store: Arc<dyn StoreClient>,
        processor: Arc<ItemProcessor>,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_ms: usize,
    ) -> Self {
        Self {
            store,
            processor,
            group: group.to_owned(),
            consumer: consumer.to_owned(),
            batch_size,
            block_ms,
            groups_ready: false,
        }
    }

    /// Create the consumer groups at the stream origins, once. "Already
    /// exists" is success, handled by the store client.
    async fn ensure_groups(&mut self) -> Result<(), StoreError> {
        if self.groups_ready {
            return Ok(());
        }

        for source in Source::ALL {
            self.store
                .create_group(source.stream_name(), &self.group)
                .await?;
        }
        self.groups_ready = true;

        Ok(())
    }

    async fn process_entries(
        &self,
        source: Source,
        entries: Vec<StreamEntry>,
        stats: &mut CycleStats,
    ) -> Result<(), StoreError> {
        for entry in entries {
            let item = match ContentItem::from_stream_fields(&entry.fields) {
                Ok(item) => item,
                Err(e) => {
                    // Not acknowledged: the entry stays pending rather than
                    // silently vanishing.
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "decode")]
                    )
                    .increment(1);
                    warn!(entry = %entry.id, "failed to decode stream entry: {}", e);
                    continue;
                }
            };

            match self.processor.process(item).await {
                Ok(()) => {
                    self.store
                        .ack(source.stream_name(), &self.group, &entry.id)
                        .await?;
                    stats.record_processed(source);
                    metrics::counter!(
                        "drainer_items_processed_total",
                        &[("source", source.label())]
                    )
                    .increment(1);
                    debug!(entry = %entry.id, "stream entry sunk and acknowledged");
                }
                Err(e) => {
                    stats.skipped += 1;
                    metrics::counter!(
                        "drainer_items_skipped_total",
                        &[("source", source.label()), ("reason", "process")]
                    )
                    .increment(1);
                    warn!(entry = %entry.id, "stream entry not acknowledged: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Claim and re-process entries another consumer left pending for at
    /// least `min_idle_ms`. Recovery is not part of the default drain loop;
    /// operators run it when taking over from a crashed instance.
    pub async fn recover_pending(&mut self, min_idle_ms: usize) -> Result<CycleStats, StoreError> {
        self.ensure_groups().await?;
        let mut stats = CycleStats::default();

        for source in Source::ALL {
            let claimed = self
                .store
                .claim_stale(
                    source.stream_name(),
                    &self.group,
                    &self.consumer,
                    min_idle_ms,
                    self.batch_size,
                )
                .await?;
            self.process_entries(source, claimed, &mut stats).await?;
        }

        Ok(stats)
    }
}

#[async_trait]
impl QueueDrainer for StreamDrainer {
    async fn drain_once(&mut self) -> Result<CycleStats, StoreError> {
        self.ensure_groups().await?;
        let mut stats = CycleStats::default();

        for source in Source::ALL {
            // New entries only: redelivery of claimed entries goes through
            // recover_pending, never through the regular read.
            let entries = self
                .store
                .read_group(
                    source.stream_name(),
                    &self.group,
                    &self.consumer,
                    self.batch_size,
                    self.block_ms,
                )
                .await?;
            self.process_entries(source, entries, &mut stats).await?;
        }

        Ok(stats)
    }
}
