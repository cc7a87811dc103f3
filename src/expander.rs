//! The periodic reconcile loop: joins storage-class policy, claim
//! annotations, telemetry, and current state into one resize decision per
//! claim, then drives the cluster API toward the desired size.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client_util;
use crate::cr_patch::{CrPatcher, PatchError};
use crate::indexer::ClusterCache;
use crate::metrics::Metrics;
use crate::size::{convert_size_in_bytes, convert_size_in_percent, format_quantity, parse_quantity, SizeError};
use crate::telemetry::{ClaimRef, TelemetrySource, VolumeStats};
use crate::{
    ANNOTATION_PATCHING_ENABLED_KEY, INITIAL_RESIZE_GROUP_BY_ANNOTATION,
    PREVIOUS_CAPACITY_BYTES_ANNOTATION, RESIZE_INCREASE_ANNOTATION,
    RESIZE_INODES_THRESHOLD_ANNOTATION, RESIZE_THRESHOLD_ANNOTATION, STORAGE_LIMIT_ANNOTATION,
    TARGET_RESOURCE_CLASS_ANNOTATION,
};

const GIB: i64 = 1 << 30;
const STORAGE_RESOURCE: &str = "storage";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Annotations propagated from a StatefulSet claim template to its
/// provisioned claims.
const PROPAGATED_ANNOTATIONS: [&str; 5] = [
    RESIZE_THRESHOLD_ANNOTATION,
    RESIZE_INODES_THRESHOLD_ANNOTATION,
    RESIZE_INCREASE_ANNOTATION,
    STORAGE_LIMIT_ANNOTATION,
    INITIAL_RESIZE_GROUP_BY_ANNOTATION,
];

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("invalid storage limit: {0}")]
    StorageLimit(#[from] SizeError),
    #[error("failed to update claim: {0}")]
    UpdateFailed(#[source] kube::Error),
    #[error(transparent)]
    CrPatch(#[from] PatchError),
}

/// Fallback policy values used when a claim carries no explicit
/// annotation.
#[derive(Clone, Debug)]
pub struct ResizeDefaults {
    pub threshold: String,
    pub inodes_threshold: String,
    pub increase: String,
}

impl Default for ResizeDefaults {
    fn default() -> Self {
        ResizeDefaults {
            threshold: crate::DEFAULT_THRESHOLD.to_string(),
            inodes_threshold: crate::DEFAULT_INODES_THRESHOLD.to_string(),
            increase: crate::DEFAULT_INCREASE.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExpanderConfig {
    pub interval: Duration,
    pub annotation_patching_enabled: bool,
    pub defaults: ResizeDefaults,
}

/// What one tick decided for one claim.
#[derive(Debug, PartialEq, Eq)]
enum ResizePlan {
    /// Nothing to do this tick.
    Skip,
    /// A previous request has not been realized by the storage layer yet.
    InProgress,
    /// Current capacity is at or beyond the storage limit.
    LimitReached,
    /// Grow the request and stamp the capacity observed right now.
    Resize {
        new_request: i64,
        observed_capacity: i64,
    },
}

pub struct Expander {
    client: Client,
    cache: Arc<ClusterCache>,
    telemetry: TelemetrySource,
    cr_patcher: CrPatcher,
    metrics: Arc<Metrics>,
    reporter: Reporter,
    config: ExpanderConfig,
}

impl Expander {
    pub fn new(
        client: Client,
        cache: Arc<ClusterCache>,
        telemetry: TelemetrySource,
        cr_patcher: CrPatcher,
        metrics: Arc<Metrics>,
        config: ExpanderConfig,
    ) -> Self {
        Expander {
            client,
            cache,
            telemetry,
            cr_patcher,
            metrics,
            reporter: Reporter {
                controller: "pvc-expander".to_string(),
                instance: None,
            },
            config,
        }
    }

    /// Runs the reconcile loop until shutdown. Ticks never overlap; on
    /// shutdown the in-flight tick gets a grace period to finish its
    /// current claim.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let tick = self.reconcile_tick();
                    tokio::pin!(tick);
                    tokio::select! {
                        _ = &mut tick => {}
                        _ = shutdown.cancelled() => {
                            if tokio::time::timeout(SHUTDOWN_GRACE, &mut tick).await.is_err() {
                                warn!("tick abandoned after shutdown grace period");
                            }
                            self.metrics.loop_seconds_total.inc_by(started.elapsed().as_secs_f64());
                            break;
                        }
                    }
                    self.metrics.loop_seconds_total.inc_by(started.elapsed().as_secs_f64());
                }
            }
        }
        info!("expander loop terminated");
    }

    async fn reconcile_tick(&self) {
        let classes = self.cache.enabled_storage_classes();

        // One telemetry snapshot serves the whole tick.
        let stats = match self.telemetry.get_metrics().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("failed to fetch volume stats: {}", e);
                return;
            }
        };

        for sc in classes {
            for pvc in self.cache.claims_for_class(&sc.name_any()) {
                self.process_claim(pvc, &stats).await;
            }
        }
    }

    async fn process_claim(
        &self,
        mut pvc: PersistentVolumeClaim,
        stats: &HashMap<ClaimRef, VolumeStats>,
    ) {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let name = pvc.name_any();

        if self.config.annotation_patching_enabled {
            // Prime the series so dashboards see it before the first event.
            self.metrics.prime_patch_annotations_counters(&name, &namespace);

            match self.owner_stateful_set(&pvc).await {
                Err(e) => {
                    error!("failed to get owner StatefulSet of {}/{}: {}", namespace, name, e);
                    self.metrics
                        .failed_patch_annotations_total
                        .with_label_values(&[&name, &namespace])
                        .inc();
                }
                Ok(None) => {}
                Ok(Some(sts)) => {
                    if let Err(e) = self.reconcile_annotations(&mut pvc, &sts).await {
                        error!(
                            "failed to propagate annotations to {}/{}: {}",
                            namespace, name, e
                        );
                        self.metrics
                            .failed_patch_annotations_total
                            .with_label_values(&[&name, &namespace])
                            .inc();
                    }
                }
            }
        }

        match is_target_claim(&pvc) {
            Err(e) => {
                self.metrics
                    .failed_resize_total
                    .with_label_values(&[&name, &namespace])
                    .inc();
                error!("failed to check claim {}/{}: {}", namespace, name, e);
                return;
            }
            Ok(false) => return,
            Ok(true) => {}
        }

        self.metrics.prime_resize_counters(&name, &namespace);

        let claim_ref = ClaimRef {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        let Some(vs) = stats.get(&claim_ref) else {
            // Stats exporters only report for actively-mounted volumes, so
            // a missing entry usually means an offline volume, not a
            // failure.
            info!("no volume stats for {}/{}", namespace, name);
            return;
        };

        if let Err(e) = self.resize(&mut pvc, vs).await {
            self.metrics
                .failed_resize_total
                .with_label_values(&[&name, &namespace])
                .inc();
            error!("failed to resize {}/{}: {}", namespace, name, e);
            self.emit_event(&pvc, EventType::Warning, "ResizeFailed", e.to_string())
                .await;
        }
    }

    async fn resize(
        &self,
        pvc: &mut PersistentVolumeClaim,
        vs: &VolumeStats,
    ) -> Result<(), ExpandError> {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let name = pvc.name_any();

        match plan_resize(pvc, vs, &self.config.defaults)? {
            ResizePlan::Skip => Ok(()),
            ResizePlan::InProgress => {
                info!(
                    "waiting for {}/{} to reach its requested size; capacity {}",
                    namespace, name, vs.capacity_bytes
                );
                Ok(())
            }
            ResizePlan::LimitReached => {
                info!("{}/{} reached its storage limit", namespace, name);
                self.metrics
                    .limit_reached_total
                    .with_label_values(&[&name, &namespace])
                    .inc();
                Ok(())
            }
            ResizePlan::Resize {
                new_request,
                observed_capacity,
            } => {
                self.apply_resize(pvc, new_request, observed_capacity).await?;
                info!(
                    "resize started for {}/{}: request {}, available {}, free inodes {}",
                    namespace, name, new_request, vs.available_bytes, vs.available_inodes
                );
                self.emit_event(
                    pvc,
                    EventType::Normal,
                    "Resized",
                    format!("claim volume is resized to {}", format_quantity(new_request)),
                )
                .await;
                self.metrics
                    .success_resize_total
                    .with_label_values(&[&name, &namespace])
                    .inc();
                Ok(())
            }
        }
    }

    /// Writes the decision back: either the claim spec and the
    /// previous-capacity stamp in one update, or a CR patch with an
    /// annotation-only stamp when the claim targets an operator-managed
    /// resource.
    async fn apply_resize(
        &self,
        pvc: &mut PersistentVolumeClaim,
        new_request: i64,
        observed_capacity: i64,
    ) -> Result<(), ExpandError> {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let via_cr = pvc
            .annotations()
            .contains_key(TARGET_RESOURCE_CLASS_ANNOTATION);

        if via_cr {
            self.cr_patcher.patch_target(pvc, new_request).await?;
        } else if let Some(resources) = pvc.spec.as_mut().and_then(|s| s.resources.as_mut()) {
            resources
                .requests
                .get_or_insert_with(BTreeMap::new)
                .insert(
                    STORAGE_RESOURCE.to_string(),
                    Quantity(format_quantity(new_request)),
                );
        }

        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                PREVIOUS_CAPACITY_BYTES_ANNOTATION.to_string(),
                observed_capacity.to_string(),
            );

        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &namespace);
        *pvc = client_util::replace(&api, pvc, &self.metrics)
            .await
            .map_err(ExpandError::UpdateFailed)?;
        Ok(())
    }

    /// Resolves the claim's owning StatefulSet, if any. Claims provisioned
    /// by older control planes may carry the owner reference without the
    /// controller flag.
    async fn owner_stateful_set(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<Option<StatefulSet>, kube::Error> {
        let owners = &pvc.metadata.owner_references;
        let owner = owners
            .as_ref()
            .and_then(|refs| {
                refs.iter()
                    .find(|r| r.controller == Some(true))
                    .or_else(|| refs.iter().find(|r| r.kind == "StatefulSet"))
            });
        let Some(owner) = owner else {
            debug!("claim {} has no owner reference", pvc.name_any());
            return Ok(None);
        };
        if owner.kind != "StatefulSet" {
            debug!("claim {} is owned by a {}", pvc.name_any(), owner.kind);
            return Ok(None);
        }

        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), &namespace);
        client_util::get(&api, &owner.name, &self.metrics)
            .await
            .map(Some)
    }

    /// Reconciles the policy-annotation subset of the claim with its
    /// StatefulSet's claim template. No-op reconciliations do not write
    /// but still count as success.
    async fn reconcile_annotations(
        &self,
        pvc: &mut PersistentVolumeClaim,
        sts: &StatefulSet,
    ) -> Result<(), ExpandError> {
        let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
        let name = pvc.name_any();

        let enabled = sts
            .annotations()
            .get(ANNOTATION_PATCHING_ENABLED_KEY)
            .map(String::as_str);
        if enabled != Some("true") {
            debug!(
                "owner StatefulSet {} does not enable annotation propagation",
                sts.name_any()
            );
            return Ok(());
        }

        let templates = sts
            .spec
            .as_ref()
            .and_then(|s| s.volume_claim_templates.as_ref());
        let Some(templates) = templates else {
            return Ok(());
        };

        for template in templates {
            let template_name = template.metadata.name.clone().unwrap_or_default();
            if !template_matches_claim_name(&template_name, &sts.name_any(), &name) {
                continue;
            }

            let empty = BTreeMap::new();
            let current = pvc.metadata.annotations.as_ref().unwrap_or(&empty);
            let desired = reconciled_annotations(
                template.metadata.annotations.as_ref().unwrap_or(&empty),
                current,
            );

            if &desired == current {
                debug!("annotations of {}/{} match the template", namespace, name);
                self.metrics
                    .success_patch_annotations_total
                    .with_label_values(&[&name, &namespace])
                    .inc();
                continue;
            }

            pvc.metadata.annotations = Some(desired);
            let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &namespace);
            *pvc = client_util::replace(&api, pvc, &self.metrics)
                .await
                .map_err(ExpandError::UpdateFailed)?;
            info!("annotations of {}/{} updated from template", namespace, name);
            self.emit_event(
                pvc,
                EventType::Normal,
                "AnnotationsPatched",
                "claim annotations updated from the StatefulSet template".to_string(),
            )
            .await;
            self.metrics
                .success_patch_annotations_total
                .with_label_values(&[&name, &namespace])
                .inc();
        }
        Ok(())
    }

    async fn emit_event(
        &self,
        pvc: &PersistentVolumeClaim,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            ObjectRef::from_obj(pvc).into(),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("failed to publish event for {}: {}", pvc.name_any(), e);
        }
    }
}

/// Upper bound for the claim's requested size. Missing or empty
/// annotation means zero, which makes the claim ineligible.
pub fn storage_limit(pvc: &PersistentVolumeClaim) -> Result<i64, SizeError> {
    match pvc.annotations().get(STORAGE_LIMIT_ANNOTATION) {
        Some(value) if !value.is_empty() => parse_quantity(value),
        _ => Ok(0),
    }
}

/// A claim is eligible iff its storage limit is positive, its volume mode
/// is filesystem, and it is bound.
pub fn is_target_claim(pvc: &PersistentVolumeClaim) -> Result<bool, SizeError> {
    if storage_limit(pvc)? <= 0 {
        return Ok(false);
    }
    let mode = pvc.spec.as_ref().and_then(|s| s.volume_mode.as_deref());
    if mode.is_some() && mode != Some("Filesystem") {
        return Ok(false);
    }
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some("Bound") {
        return Ok(false);
    }
    Ok(true)
}

/// The storage quantity currently requested by the claim spec.
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<i64> {
    let requests = pvc.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?;
    parse_quantity(&requests.get(STORAGE_RESOURCE)?.0).ok()
}

fn current_capacity(pvc: &PersistentVolumeClaim) -> Option<i64> {
    let capacity = pvc.status.as_ref()?.capacity.as_ref()?;
    parse_quantity(&capacity.get(STORAGE_RESOURCE)?.0).ok()
}

/// Requested size after a grow: current capacity plus the increase,
/// rounded up to the next gibibyte boundary, clamped to the limit.
fn next_request_bytes(capacity: i64, increase: i64, limit: i64) -> i64 {
    let rounded = (capacity + increase + GIB - 1) / GIB * GIB;
    rounded.min(limit)
}

fn plan_resize(
    pvc: &PersistentVolumeClaim,
    vs: &VolumeStats,
    defaults: &ResizeDefaults,
) -> Result<ResizePlan, SizeError> {
    let annotations = pvc.annotations();
    let name = pvc.name_any();

    let threshold_value = annotations
        .get(RESIZE_THRESHOLD_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    let threshold =
        match convert_size_in_bytes(threshold_value, vs.capacity_bytes, &defaults.threshold) {
            Ok(v) => v,
            // Admin-authored values may temporarily hold invalid content.
            Err(e) => {
                warn!("invalid threshold annotation on {}: {}", name, e);
                return Ok(ResizePlan::Skip);
            }
        };

    let inodes_value = annotations
        .get(RESIZE_INODES_THRESHOLD_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    let inodes_threshold = match convert_size_in_percent(
        inodes_value,
        vs.capacity_inodes,
        &defaults.inodes_threshold,
    ) {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid inodes-threshold annotation on {}: {}", name, e);
            return Ok(ResizePlan::Skip);
        }
    };

    let Some(capacity) = current_capacity(pvc) else {
        info!("skipping {}: claim capacity is not reported yet", name);
        return Ok(ResizePlan::Skip);
    };
    if capacity == 0 {
        info!("skipping {}: claim capacity is zero", name);
        return Ok(ResizePlan::Skip);
    }

    let increase_value = annotations
        .get(RESIZE_INCREASE_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    let increase = match convert_size_in_bytes(increase_value, capacity, &defaults.increase) {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid increase annotation on {}: {}", name, e);
            return Ok(ResizePlan::Skip);
        }
    };

    if let Some(previous) = annotations.get(PREVIOUS_CAPACITY_BYTES_ANNOTATION) {
        let previous = match previous.parse::<i64>() {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid previous-capacity annotation on {}: {}", name, e);
                return Ok(ResizePlan::Skip);
            }
        };
        if previous == vs.capacity_bytes {
            return Ok(ResizePlan::InProgress);
        }
    }

    let limit = storage_limit(pvc)?;
    if capacity >= limit {
        return Ok(ResizePlan::LimitReached);
    }

    if threshold > vs.available_bytes || inodes_threshold > vs.available_inodes {
        return Ok(ResizePlan::Resize {
            new_request: next_request_bytes(capacity, increase, limit),
            observed_capacity: vs.capacity_bytes,
        });
    }
    Ok(ResizePlan::Skip)
}

/// The desired annotation set: the claim's annotations with the policy
/// subset aligned to the template. Non-policy annotations are untouched.
fn reconciled_annotations(
    template: &BTreeMap<String, String>,
    claim: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut desired = claim.clone();
    desired.retain(|key, _| {
        !PROPAGATED_ANNOTATIONS.contains(&key.as_str()) || template.contains_key(key)
    });
    for (key, value) in template {
        if PROPAGATED_ANNOTATIONS.contains(&key.as_str()) {
            desired.insert(key.clone(), value.clone());
        }
    }
    desired
}

/// Whether `claim_name` looks like an instance of the template, i.e.
/// `<templateName>-<stsName>-<ordinal>`.
fn template_matches_claim_name(template_name: &str, sts_name: &str, claim_name: &str) -> bool {
    match Regex::new(&format!("^{}-{}-\\d+$", template_name, sts_name)) {
        Ok(re) => re.is_match(claim_name),
        Err(e) => {
            warn!("failed to compile claim name pattern: {}", e);
            false
        }
    }
}
