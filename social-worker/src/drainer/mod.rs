use std::collections::HashMap;

use async_trait::async_trait;

use social_common::item::Source;
use social_common::store::StoreError;

pub mod scan;
pub mod stream;

pub use scan::ScanDrainer;
pub use stream::StreamDrainer;

/// What one drain cycle did, split by source. Drives the coordinator's
/// two-tier backoff and the end-of-run reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Items enriched, sunk and removed from staging, per source.
    pub processed: HashMap<Source, u64>,
    /// Empty or absent staged entries removed without processing.
    pub cleaned: u64,
    /// Items left in place: malformed, empty-content, or failed at the sink.
    pub skipped: u64,
}

impl CycleStats {
    pub fn record_processed(&mut self, source: Source) {
        *self.processed.entry(source).or_default() += 1;
    }

    pub fn processed_total(&self) -> u64 {
        self.processed.values().sum()
    }

    /// Whether the cycle made progress. Garbage cleanup counts: it emptied
    /// the queue a little, so the loop should keep its drain bias.
    pub fn worked(&self) -> bool {
        self.processed_total() > 0 || self.cleaned > 0
    }
}

/// A strategy draining staged items towards enrichment and the sink.
///
/// The two protocols (pattern scanning with delete-on-success, and
/// consumer-group stream reads with ack-on-success) are interchangeable
/// behind this trait; the coordinator only sees cycles and their stats.
#[async_trait]
pub trait QueueDrainer: Send {
    /// Run one bounded drain cycle to completion.
    ///
    /// Per-item failures are accounted in the stats, not returned: only a
    /// store-level failure aborts a cycle, and the caller is expected to
    /// retry after a pause rather than terminate.
    async fn drain_once(&mut self) -> Result<CycleStats, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_stats_progress() {
        let mut stats = CycleStats::default();
        assert!(!stats.worked());

        stats.cleaned += 1;
        assert!(stats.worked());

        let mut stats = CycleStats::default();
        stats.record_processed(Source::Reddit);
        stats.record_processed(Source::Reddit);
        stats.record_processed(Source::YouTube);
        assert_eq!(stats.processed_total(), 3);
        assert_eq!(stats.processed.get(&Source::Reddit), Some(&2));

        let mut skipped_only = CycleStats::default();
        skipped_only.skipped = 4;
        assert!(!skipped_only.worked());
    }
}
