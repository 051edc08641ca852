use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use social_common::item::{Sentiment, Source};

/// One classified text, as handed to the reporting stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub text: String,
    pub sentiment: Sentiment,
}

/// Everything accumulated for one source over a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source: Source,
    pub entries: Vec<ReportEntry>,
}

/// Accumulates (text, sentiment) pairs per source across drain cycles.
///
/// This is the collaborator interface exposed to the reporting stage:
/// chart/word-cloud rendering consumes the flushed reports; nothing in the
/// pipeline reads them back. Clones share state so the coordinator can flush
/// what drainers recorded.
#[derive(Clone, Default)]
pub struct ReportAccumulator {
    inner: Arc<Mutex<HashMap<Source, Vec<ReportEntry>>>>,
}

impl ReportAccumulator {
    pub fn new() -> Self {
        ReportAccumulator::default()
    }

    pub fn record(&self, source: Source, text: String, sentiment: Sentiment) {
        self.inner
            .lock()
            .expect("poisoned ReportAccumulator")
            .entry(source)
            .or_default()
            .push(ReportEntry { text, sentiment });
    }

    pub fn count(&self, source: Source) -> usize {
        self.inner
            .lock()
            .expect("poisoned ReportAccumulator")
            .get(&source)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drain the accumulated state, returning one report per source that
    /// recorded anything, in `Source::ALL` order.
    pub fn flush(&self) -> Vec<SourceReport> {
        let mut by_source = self.inner.lock().expect("poisoned ReportAccumulator");

        Source::ALL
            .into_iter()
            .filter_map(|source| {
                by_source.remove(&source).map(|entries| SourceReport {
                    source,
                    entries,
                })
            })
            .collect()
    }
}
