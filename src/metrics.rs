use kube::{runtime::reflector::ObjectRef, Resource};
use prometheus::{histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::Error;

/// Reconciliation metrics shared by every controller
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = Histogram::with_opts(
            histogram_opts!(
                "bucket_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "bucket_operator_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )?;
        let reconciliations =
            IntCounter::new("bucket_operator_reconciliations_total", "reconciliations")?;

        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    /// Register the metrics with a registry
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<K: Resource<DynamicType = ()>>(&self, resource: &K, e: &Error) {
        let instance = ObjectRef::from_obj(resource).to_string();
        self.failures
            .with_label_values(&[instance.as_str(), e.metric_label().as_str()])
            .inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Records the reconcile duration when dropped
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.observe(duration);
    }
}
