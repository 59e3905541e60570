use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

/// Stable identifier of one controller, used as a metric label.
pub type ControllerId = &'static str;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ControllerLabels {
    pub controller: String,
}

impl ControllerLabels {
    fn new(controller: ControllerId) -> Self {
        Self {
            controller: controller.to_string(),
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct FailureLabels {
    pub controller: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TriggerAction {
    Apply,
    Delete,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct TriggerLabels {
    pub controller: String,
    pub action: TriggerAction,
    pub kind: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ResourceLabels {
    pub kind: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobOutcome {
    Active,
    Succeeded,
    Failed,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct JobLabels {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub outcome: JobOutcome,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    ready: Family<ControllerLabels, Gauge>,
    triggered: Family<TriggerLabels, Counter>,
    watch_failures: Family<ControllerLabels, Counter>,
    resources: Family<ResourceLabels, Gauge>,
    jobs: Family<JobLabels, Gauge>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            reconcile: ReconcileMetrics::default().register(registry),
            ready: Family::default(),
            triggered: Family::default(),
            watch_failures: Family::default(),
            resources: Family::default(),
            jobs: Family::default(),
        };
        registry.register(
            "controller_ready",
            "1 when the controller's watch streams are established",
            metrics.ready.clone(),
        );
        registry.register(
            "triggered",
            "reconciliations triggered by child resource events",
            metrics.triggered.clone(),
        );
        registry.register(
            "watch_failures",
            "errors observed on child watch streams",
            metrics.watch_failures.clone(),
        );
        registry.register(
            "managed_resources",
            "managed resource totals",
            metrics.resources.clone(),
        );
        registry.register(
            "job_status",
            "observed state of operator-owned jobs",
            metrics.jobs.clone(),
        );
        metrics
    }

    pub fn ready_set(&self, controller: ControllerId, ready: i64) {
        self.ready
            .get_or_create(&ControllerLabels::new(controller))
            .set(ready);
    }

    pub fn triggered_inc(&self, controller: ControllerId, action: TriggerAction, kind: &str) {
        self.triggered
            .get_or_create(&TriggerLabels {
                controller: controller.to_string(),
                action,
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn watch_failure_inc(&self, controller: ControllerId) {
        self.watch_failures
            .get_or_create(&ControllerLabels::new(controller))
            .inc();
    }

    pub fn resources_set(&self, kind: &str, namespace: &str, total: i64) {
        self.resources
            .get_or_create(&ResourceLabels {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
            })
            .set(total);
    }

    /// Record the observed outcome of one job, clearing the other outcomes so
    /// exactly one series per job is 1.
    pub fn job_status_set(&self, kind: &str, namespace: &str, name: &str, outcome: JobOutcome) {
        for candidate in [JobOutcome::Active, JobOutcome::Succeeded, JobOutcome::Failed] {
            let value = i64::from(candidate == outcome);
            self.jobs
                .get_or_create(&JobLabels {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    outcome: candidate,
                })
                .set(value);
        }
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<ControllerLabels, Counter>,
    pub failures: Family<FailureLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::default(),
            failures: Family::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.failures.clone(),
        );
        r.register("reconcile_runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn failure_inc(&self, controller: ControllerId, error: &Error) {
        self.failures
            .get_or_create(&FailureLabels {
                controller: controller.to_string(),
                error: error.metric_label().to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, controller: ControllerId, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&ControllerLabels::new(controller))
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Observes the reconcile duration on drop, attaching the trace id as an
/// exemplar when one is available.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
