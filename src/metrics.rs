use kube::{Resource, ResourceExt};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "infisical_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "infisical_controller_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["controller", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("infisical_controller_reconciliations_total", "reconciliations"),
            &["controller"],
        )
        .unwrap();

        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<K>(&self, obj: &K, e: &Error)
    where
        K: Resource<DynamicType = ()> + ResourceExt,
    {
        tracing::debug!(name = %obj.name_any(), error = %e.metric_label(), "counting failure");
        self.failures
            .with_label_values(&[K::kind(&()).as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.with_label_values(&[controller]).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            controller: controller.to_string(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[&self.controller])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::PulledSecret;

    #[test]
    fn failures_are_labelled_by_kind_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        let mut resource = PulledSecret::default();
        resource.metadata.name = Some("app".into());
        metrics.reconcile_failure(&resource, &Error::IllegalResource("app".into(), "x".into()));
        drop(metrics.count_and_measure("PulledSecret"));

        let families = registry.gather();
        let failures = families
            .iter()
            .find(|f| f.get_name() == "infisical_controller_reconciliation_errors_total")
            .unwrap();
        let labels: Vec<_> = failures.get_metric()[0]
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect();
        assert!(labels.contains(&("controller".into(), "PulledSecret".into())));
        assert!(labels.contains(&("error".into(), "illegal_resource".into())));

        assert!(families
            .iter()
            .any(|f| f.get_name() == "infisical_controller_reconcile_duration_seconds"));
    }
}
