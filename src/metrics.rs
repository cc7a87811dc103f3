//! Counters for every decision outcome, collected in one registry that is
//! built once at startup and shared by reference.

use prometheus::{Counter, Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "pvcexpander";
const CLAIM_LABELS: [&str; 2] = ["persistentvolumeclaim", "namespace"];

pub struct Metrics {
    registry: Registry,
    pub success_resize_total: IntCounterVec,
    pub failed_resize_total: IntCounterVec,
    pub limit_reached_total: IntCounterVec,
    pub success_patch_annotations_total: IntCounterVec,
    pub failed_patch_annotations_total: IntCounterVec,
    pub loop_seconds_total: Counter,
    pub kubernetes_client_fail_total: IntCounterVec,
    pub metrics_client_fail_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let success_resize_total = IntCounterVec::new(
            Opts::new(
                "success_resize_total",
                "counter that indicates how many volume expansions succeeded.",
            ),
            &CLAIM_LABELS,
        )?;
        let failed_resize_total = IntCounterVec::new(
            Opts::new(
                "failed_resize_total",
                "counter that indicates how many volume expansions failed.",
            ),
            &CLAIM_LABELS,
        )?;
        let limit_reached_total = IntCounterVec::new(
            Opts::new(
                "limit_reached_total",
                "counter that indicates how many claims hit their storage limit.",
            ),
            &CLAIM_LABELS,
        )?;
        let success_patch_annotations_total = IntCounterVec::new(
            Opts::new(
                "success_patch_annotations_total",
                "counter that indicates how many annotation propagations succeeded.",
            ),
            &CLAIM_LABELS,
        )?;
        let failed_patch_annotations_total = IntCounterVec::new(
            Opts::new(
                "failed_patch_annotations_total",
                "counter that indicates how many annotation propagations failed.",
            ),
            &CLAIM_LABELS,
        )?;
        let loop_seconds_total = Counter::new(
            "loop_seconds_total",
            "counter that indicates the sum of seconds spent on expansion loops.",
        )?;
        let kubernetes_client_fail_total = IntCounterVec::new(
            Opts::new(
                "kubernetes_client_fail_total",
                "counter that indicates how many requests to the cluster API failed.",
            ),
            &["group", "version", "kind", "verb"],
        )?;
        let metrics_client_fail_total = IntCounter::new(
            "metrics_client_fail_total",
            "counter that indicates how many volume-stats fetches failed.",
        )?;

        registry.register(Box::new(success_resize_total.clone()))?;
        registry.register(Box::new(failed_resize_total.clone()))?;
        registry.register(Box::new(limit_reached_total.clone()))?;
        registry.register(Box::new(success_patch_annotations_total.clone()))?;
        registry.register(Box::new(failed_patch_annotations_total.clone()))?;
        registry.register(Box::new(loop_seconds_total.clone()))?;
        registry.register(Box::new(kubernetes_client_fail_total.clone()))?;
        registry.register(Box::new(metrics_client_fail_total.clone()))?;

        Ok(Metrics {
            registry,
            success_resize_total,
            failed_resize_total,
            limit_reached_total,
            success_patch_annotations_total,
            failed_patch_annotations_total,
            loop_seconds_total,
            kubernetes_client_fail_total,
            metrics_client_fail_total,
        })
    }

    /// Creates the per-claim resize counter children with value 0 so that
    /// dashboards see the series before the first event.
    pub fn prime_resize_counters(&self, name: &str, namespace: &str) {
        self.success_resize_total.with_label_values(&[name, namespace]);
        self.failed_resize_total.with_label_values(&[name, namespace]);
        self.limit_reached_total.with_label_values(&[name, namespace]);
    }

    /// Same as [`Metrics::prime_resize_counters`] for the annotation
    /// propagation counters.
    pub fn prime_patch_annotations_counters(&self, name: &str, namespace: &str) {
        self.success_patch_annotations_total
            .with_label_values(&[name, namespace]);
        self.failed_patch_annotations_total
            .with_label_values(&[name, namespace]);
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
