use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use health::HealthHandle;

use crate::drainer::{CycleStats, QueueDrainer};
use crate::report::{ReportAccumulator, SourceReport};

/// Owns the drain loop: polling cadence, partial-failure handling, graceful
/// shutdown and the end-of-run report flush.
pub struct PipelineCoordinator {
    drainer: Box<dyn QueueDrainer>,
    reports: ReportAccumulator,
    /// Short pause after a productive cycle: drain a backlog to empty.
    drain_interval: Duration,
    /// Long pause after an empty cycle: don't busy-poll an empty queue.
    idle_interval: Duration,
    /// Fixed pause before retrying after a store error.
    retry_interval: Duration,
    liveness: HealthHandle,
}

impl PipelineCoordinator {
    pub fn new(
        drainer: Box<dyn QueueDrainer>,
        reports: ReportAccumulator,
        drain_interval: Duration,
        idle_interval: Duration,
        retry_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            drainer,
            reports,
            drain_interval,
            idle_interval,
            retry_interval,
            liveness,
        }
    }

    fn pause_after(&self, stats: &CycleStats) -> Duration {
        if stats.worked() {
            self.drain_interval
        } else {
            self.idle_interval
        }
    }

    /// Run drain cycles until the shutdown signal flips, then flush and
    /// return the accumulated per-source reports.
    ///
    /// No error terminates this loop. Store errors pause and retry; per-item
    /// errors were already absorbed into the cycle stats by the drainer.
    /// Shutdown takes effect between cycles, never mid-item, so the
    /// crash-consistency rule holds for graceful exits too.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Vec<SourceReport> {
        info!("pipeline coordinator starting drain loop");

        while !*shutdown.borrow() {
            self.liveness.report_healthy().await;

            let pause = match self.drainer.drain_once().await {
                Ok(stats) => {
                    if stats.worked() {
                        info!(
                            processed = stats.processed_total(),
                            cleaned = stats.cleaned,
                            skipped = stats.skipped,
                            "drain cycle complete"
                        );
                    } else {
                        debug!(skipped = stats.skipped, "nothing to drain, backing off");
                    }
                    metrics::counter!("coordinator_cycles_total").increment(1);
                    self.pause_after(&stats)
                }
                Err(e) => {
                    error!("store unavailable, retrying after pause: {}", e);
                    metrics::counter!("coordinator_store_errors_total").increment(1);
                    self.retry_interval
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("shutdown signal received, flushing reports");
        let reports = self.reports.flush();
        for report in &reports {
            info!(
                source = %report.source,
                items = report.entries.len(),
                "per-source report flushed"
            );
        }

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use health::HealthRegistry;
    use social_common::item::{Sentiment, Source};
    use social_common::store::StoreError;

    struct ScriptedDrainer {
        results: Vec<Result<CycleStats, StoreError>>,
    }

    #[async_trait]
    impl QueueDrainer for ScriptedDrainer {
        async fn drain_once(&mut self) -> Result<CycleStats, StoreError> {
            if self.results.is_empty() {
                return Ok(CycleStats::default());
            }
            self.results.remove(0)
        }
    }

    async fn liveness(registry: &HealthRegistry) -> HealthHandle {
        registry
            .register("drainer".to_string(), time::Duration::seconds(30))
            .await
    }

    fn worked_stats() -> CycleStats {
        let mut stats = CycleStats::default();
        stats.record_processed(Source::Reddit);
        stats
    }

    #[tokio::test]
    async fn backoff_tiers_follow_cycle_outcome() {
        let registry = HealthRegistry::new("liveness");
        let coordinator = PipelineCoordinator::new(
            Box::new(ScriptedDrainer { results: vec![] }),
            ReportAccumulator::new(),
            Duration::from_millis(5),
            Duration::from_millis(500),
            Duration::from_millis(50),
            liveness(&registry).await,
        );

        assert_eq!(
            coordinator.pause_after(&worked_stats()),
            Duration::from_millis(5)
        );
        assert_eq!(
            coordinator.pause_after(&CycleStats::default()),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn run_survives_store_errors_and_flushes_on_shutdown() {
        let registry = HealthRegistry::new("liveness");
        let reports = ReportAccumulator::new();
        reports.record(Source::Reddit, "A".to_owned(), Sentiment::Positive);

        let drainer = ScriptedDrainer {
            results: vec![
                Err(StoreError::TimeoutError {
                    command: "SCAN".to_owned(),
                }),
                Ok(worked_stats()),
            ],
        };
        let coordinator = PipelineCoordinator::new(
            Box::new(drainer),
            reports.clone(),
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(1),
            liveness(&registry).await,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(coordinator.run(shutdown_rx));

        // Give the loop a few cycles, store error included, then interrupt.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let flushed = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("coordinator did not shut down")
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].source, Source::Reddit);

        // The loop consumed the accumulator; a later flush finds it empty.
        assert!(reports.flush().is_empty());
    }
}
