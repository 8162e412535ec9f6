use crate::api::v1::Cluster;
use crate::util::errors::Error;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub object_changes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 300., 1800.]),
            &["instance"],
        )?;
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations")?;
        let object_changes = IntCounterVec::new(
            opts!(
                "applier_object_changes_total",
                "remote objects created, patched or deleted by the applier",
            ),
            &["action"],
        )?;
        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            object_changes,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.object_changes.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, cluster: &Cluster, e: &Error) {
        debug!(
            "reconcile_failure: {:?}",
            &[cluster.key(), e.metric_label()]
        );
        self.failures
            .with_label_values(&[cluster.key().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, provider: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: provider.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}
