//! Watcher-fed local cache of storage classes and claims, with the two
//! secondary indices the expander scans: storage classes by the value of
//! the enabled annotation and claims by storage-class name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::telemetry::ClaimRef;
use crate::AUTO_RESIZE_ENABLED_KEY;

#[derive(Default)]
struct ClassState {
    by_name: BTreeMap<String, StorageClass>,
    by_enabled: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct ClaimState {
    by_ref: BTreeMap<ClaimRef, PersistentVolumeClaim>,
    by_class: BTreeMap<String, BTreeSet<ClaimRef>>,
}

/// Read-optimized view of the cluster objects the expander scans each
/// tick. Writers are the watch tasks; readers are the reconcile loop and
/// the admission mutator.
pub struct ClusterCache {
    skip_annotation_check: bool,
    classes: RwLock<ClassState>,
    claims: RwLock<ClaimState>,
}

impl ClusterCache {
    /// With `skip_annotation_check` every storage class is indexed as
    /// enabled regardless of its annotation.
    pub fn new(skip_annotation_check: bool) -> Self {
        ClusterCache {
            skip_annotation_check,
            classes: RwLock::new(ClassState::default()),
            claims: RwLock::new(ClaimState::default()),
        }
    }

    fn enabled_index_value(&self, sc: &StorageClass) -> Option<String> {
        if self.skip_annotation_check {
            return Some("true".to_string());
        }
        sc.annotations().get(AUTO_RESIZE_ENABLED_KEY).cloned()
    }

    /// Storage classes whose enabled annotation indexes as `"true"`,
    /// in name order.
    pub fn enabled_storage_classes(&self) -> Vec<StorageClass> {
        let state = self.classes.read().unwrap();
        let Some(names) = state.by_enabled.get("true") else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| state.by_name.get(name).cloned())
            .collect()
    }

    /// Claims referencing the given storage class, in namespace/name order.
    pub fn claims_for_class(&self, class_name: &str) -> Vec<PersistentVolumeClaim> {
        let state = self.claims.read().unwrap();
        let Some(refs) = state.by_class.get(class_name) else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|r| state.by_ref.get(r).cloned())
            .collect()
    }

    /// Claims in `namespace` carrying `label_key=label_value`, in name
    /// order. Serves the admission mutator's peer-group lookup.
    pub fn claims_with_label(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Vec<PersistentVolumeClaim> {
        let state = self.claims.read().unwrap();
        state
            .by_ref
            .iter()
            .filter(|(r, _)| r.namespace == namespace)
            .filter(|(_, pvc)| {
                pvc.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(label_key))
                    .map(|v| v == label_value)
                    .unwrap_or(false)
            })
            .map(|(_, pvc)| pvc.clone())
            .collect()
    }

    pub fn apply_storage_class_event(&self, event: watcher::Event<StorageClass>) {
        let mut state = self.classes.write().unwrap();
        match event {
            watcher::Event::Applied(sc) => self.insert_class(&mut state, sc),
            watcher::Event::Deleted(sc) => {
                let name = sc.name_any();
                state.by_name.remove(&name);
                for names in state.by_enabled.values_mut() {
                    names.remove(&name);
                }
            }
            watcher::Event::Restarted(scs) => {
                state.by_name.clear();
                state.by_enabled.clear();
                for sc in scs {
                    self.insert_class(&mut state, sc);
                }
            }
        }
    }

    fn insert_class(&self, state: &mut ClassState, sc: StorageClass) {
        let name = sc.name_any();
        for names in state.by_enabled.values_mut() {
            names.remove(&name);
        }
        if let Some(value) = self.enabled_index_value(&sc) {
            state.by_enabled.entry(value).or_default().insert(name.clone());
        }
        state.by_name.insert(name, sc);
    }

    /// `scope` is the namespace the producing watcher observes; a restart
    /// only replaces that namespace's entries. `None` means cluster-wide.
    pub fn apply_claim_event(
        &self,
        event: watcher::Event<PersistentVolumeClaim>,
        scope: Option<&str>,
    ) {
        let mut state = self.claims.write().unwrap();
        match event {
            watcher::Event::Applied(pvc) => insert_claim(&mut state, pvc),
            watcher::Event::Deleted(pvc) => {
                let claim_ref = claim_ref_of(&pvc);
                state.by_ref.remove(&claim_ref);
                for refs in state.by_class.values_mut() {
                    refs.remove(&claim_ref);
                }
            }
            watcher::Event::Restarted(pvcs) => {
                let stale: Vec<ClaimRef> = state
                    .by_ref
                    .keys()
                    .filter(|r| scope.map(|ns| r.namespace == ns).unwrap_or(true))
                    .cloned()
                    .collect();
                for claim_ref in stale {
                    state.by_ref.remove(&claim_ref);
                    for refs in state.by_class.values_mut() {
                        refs.remove(&claim_ref);
                    }
                }
                for pvc in pvcs {
                    insert_claim(&mut state, pvc);
                }
            }
        }
    }
}

fn claim_ref_of(pvc: &PersistentVolumeClaim) -> ClaimRef {
    ClaimRef {
        namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
        name: pvc.metadata.name.clone().unwrap_or_default(),
    }
}

fn insert_claim(state: &mut ClaimState, pvc: PersistentVolumeClaim) {
    let claim_ref = claim_ref_of(&pvc);
    for refs in state.by_class.values_mut() {
        refs.remove(&claim_ref);
    }
    if let Some(class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()) {
        state
            .by_class
            .entry(class)
            .or_default()
            .insert(claim_ref.clone());
    }
    state.by_ref.insert(claim_ref, pvc);
}

/// Keeps the storage-class side of the cache current until shutdown.
pub async fn watch_storage_classes(
    cache: Arc<ClusterCache>,
    client: Client,
    shutdown: CancellationToken,
) {
    let api = Api::<StorageClass>::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = stream.next() => match event {
                Some(Ok(event)) => cache.apply_storage_class_event(event),
                Some(Err(e)) => warn!("storage class watch error: {}", e),
                None => return,
            },
        }
    }
}

/// Keeps the claim side of the cache current until shutdown. One task per
/// configured namespace, or one cluster-wide task.
pub async fn watch_claims(
    cache: Arc<ClusterCache>,
    client: Client,
    namespace: Option<String>,
    shutdown: CancellationToken,
) {
    let api = match &namespace {
        Some(ns) => Api::<PersistentVolumeClaim>::namespaced(client, ns),
        None => Api::<PersistentVolumeClaim>::all(client),
    };
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = stream.next() => match event {
                Some(Ok(event)) => cache.apply_claim_event(event, namespace.as_deref()),
                Some(Err(e)) => warn!("claim watch error: {}", e),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn storage_class(name: &str, enabled: Option<&str>) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: enabled.map(|v| {
                    BTreeMap::from([(AUTO_RESIZE_ENABLED_KEY.to_string(), v.to_string())])
                }),
                ..ObjectMeta::default()
            },
            ..StorageClass::default()
        }
    }

    fn pvc(namespace: &str, name: &str, class: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(class.to_string()),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        }
    }

    fn with_label(mut pvc: PersistentVolumeClaim, key: &str, value: &str) -> PersistentVolumeClaim {
        pvc.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        pvc
    }

    #[test]
    fn only_classes_annotated_true_are_listed() {
        let cache = ClusterCache::new(false);
        cache.apply_storage_class_event(watcher::Event::Applied(storage_class(
            "fast",
            Some("true"),
        )));
        cache.apply_storage_class_event(watcher::Event::Applied(storage_class(
            "slow",
            Some("false"),
        )));
        cache.apply_storage_class_event(watcher::Event::Applied(storage_class("plain", None)));

        let enabled = cache.enabled_storage_classes();
        assert_eq!(
            enabled.iter().map(|sc| sc.name_any()).collect::<Vec<_>>(),
            vec!["fast"]
        );
    }

    #[test]
    fn skipping_the_annotation_check_enables_every_class() {
        let cache = ClusterCache::new(true);
        cache.apply_storage_class_event(watcher::Event::Applied(storage_class("plain", None)));
        cache.apply_storage_class_event(watcher::Event::Applied(storage_class(
            "slow",
            Some("false"),
        )));

        let enabled = cache.enabled_storage_classes();
        assert_eq!(
            enabled.iter().map(|sc| sc.name_any()).collect::<Vec<_>>(),
            vec!["plain", "slow"]
        );
    }

    #[test]
    fn claims_are_indexed_by_storage_class_in_order() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns2", "b", "fast")), None);
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns1", "a", "fast")), None);
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns1", "c", "slow")), None);

        let fast = cache.claims_for_class("fast");
        assert_eq!(
            fast.iter().map(|p| p.name_any()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(cache.claims_for_class("missing").is_empty());
    }

    #[test]
    fn deleting_a_claim_removes_it_from_the_index() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns1", "a", "fast")), None);
        cache.apply_claim_event(watcher::Event::Deleted(pvc("ns1", "a", "fast")), None);

        assert!(cache.claims_for_class("fast").is_empty());
    }

    #[test]
    fn a_namespaced_restart_only_replaces_that_namespace() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns1", "a", "fast")), Some("ns1"));
        cache.apply_claim_event(watcher::Event::Applied(pvc("ns2", "b", "fast")), Some("ns2"));

        cache.apply_claim_event(
            watcher::Event::Restarted(vec![pvc("ns1", "c", "fast")]),
            Some("ns1"),
        );

        let fast = cache.claims_for_class("fast");
        assert_eq!(
            fast.iter().map(|p| p.name_any()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
    }

    #[test]
    fn claims_with_label_filters_namespace_and_value() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(
            watcher::Event::Applied(with_label(pvc("ns1", "a", "fast"), "grp", "x")),
            None,
        );
        cache.apply_claim_event(
            watcher::Event::Applied(with_label(pvc("ns1", "b", "fast"), "grp", "y")),
            None,
        );
        cache.apply_claim_event(
            watcher::Event::Applied(with_label(pvc("ns2", "c", "fast"), "grp", "x")),
            None,
        );

        let group = cache.claims_with_label("ns1", "grp", "x");
        assert_eq!(
            group.iter().map(|p| p.name_any()).collect::<Vec<_>>(),
            vec!["a"]
        );
    }
}
