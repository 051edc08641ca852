use std::sync::Arc;

use social_common::item::{ContentItem, EnrichedItem};

use crate::enrich::{self, SentimentClient};
use crate::error::ItemError;
use crate::report::ReportAccumulator;
use crate::sink::SinkWriter;

/// The enrichment + sink stage both drain protocols hand their items to.
///
/// `process` returning `Ok` is the one and only signal that a staged item may
/// be deleted or acknowledged; every error path leaves that decision with the
/// caller, which must keep the item in the store.
pub struct ItemProcessor {
    classifier: Arc<dyn SentimentClient>,
    sink: Arc<dyn SinkWriter>,
    reports: ReportAccumulator,
}

impl ItemProcessor {
    pub fn new(
        classifier: Arc<dyn SentimentClient>,
        sink: Arc<dyn SinkWriter>,
        reports: ReportAccumulator,
    ) -> Self {
        Self {
            classifier,
            sink,
            reports,
        }
    }

    pub async fn process(&self, item: ContentItem) -> Result<(), ItemError> {
        let Some(text) = enrich::extract_text(&item) else {
            return Err(ItemError::EmptyContent);
        };

        // Classification absorbs its own failures into Neutral.
        let sentiment = self.classifier.classify(&text).await;

        let enriched = EnrichedItem {
            item,
            sentiment,
            classified_text: text,
        };
        self.sink.insert(&enriched).await?;

        // Recorded only after the sink accepted the item, so the report never
        // mentions content that was not durably persisted.
        self.reports.record(
            enriched.item.source,
            enriched.classified_text,
            enriched.sentiment,
        );

        Ok(())
    }
}
