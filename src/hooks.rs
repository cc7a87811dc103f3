//! Request-time mutation of new claims: a claim that declares an
//! initial-resize group is aligned with the largest request among its
//! peers before it is persisted.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warp::{reply, Filter, Reply};

use crate::expander::{requested_storage, storage_limit};
use crate::indexer::ClusterCache;
use crate::size::SizeError;
use crate::INITIAL_RESIZE_GROUP_BY_ANNOTATION;

const STORAGE_RESOURCE: &str = "storage";

#[derive(Debug, Error)]
enum MutateError {
    #[error("no value is set for the label key {0}")]
    MissingLabel(String),
    #[error("invalid storage limit: {0}")]
    InvalidLimit(#[from] SizeError),
    #[error("resized capacity {request} is not below the storage limit {limit}")]
    OverLimit { request: i64, limit: i64 },
}

/// Aligns the new claim's request with its peer group. Returns the
/// mutated claim, or `None` when the claim is admitted unchanged.
fn align_with_peer_group(
    pvc: &PersistentVolumeClaim,
    peers: &[PersistentVolumeClaim],
) -> Result<Option<PersistentVolumeClaim>, MutateError> {
    let original_request = requested_storage(pvc).unwrap_or(0);

    let mut mutated = pvc.clone();
    let mut request = original_request;
    for peer in peers {
        let peer_request = requested_storage(peer).unwrap_or(0);
        if peer_request > request {
            request = peer_request;
            let quantity = peer
                .spec
                .as_ref()
                .and_then(|s| s.resources.as_ref())
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get(STORAGE_RESOURCE))
                .cloned()
                .unwrap_or_else(|| Quantity(request.to_string()));
            if let Some(requests) = mutated
                .spec
                .as_mut()
                .and_then(|s| s.resources.as_mut())
                .and_then(|r| r.requests.as_mut())
            {
                requests.insert(STORAGE_RESOURCE.to_string(), quantity);
            }
        }
    }

    if request == original_request {
        return Ok(None);
    }

    let limit = storage_limit(pvc)?;
    if limit == 0 {
        // No storage limit, no harmonization.
        return Ok(None);
    }
    if request >= limit {
        return Err(MutateError::OverLimit { request, limit });
    }
    Ok(Some(mutated))
}

/// Decides one admission request against the indexed view of the
/// cluster. Only CREATE operations are mutated.
fn mutate(req: &AdmissionRequest<PersistentVolumeClaim>, cache: &ClusterCache) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    if req.operation != Operation::Create {
        return res;
    }
    let Some(pvc) = &req.object else {
        return res;
    };

    let Some(group_key) = pvc
        .annotations()
        .get(INITIAL_RESIZE_GROUP_BY_ANNOTATION)
        .filter(|v| !v.is_empty())
    else {
        return res;
    };

    let group_value = pvc
        .labels()
        .get(group_key)
        .filter(|v| !v.is_empty())
        .cloned();
    let Some(group_value) = group_value else {
        let err = MutateError::MissingLabel(group_key.clone());
        warn!("denied claim {}: {}", pvc.name_any(), err);
        return res.deny(err.to_string());
    };

    let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
    let peers = cache.claims_with_label(&namespace, group_key, &group_value);

    match align_with_peer_group(pvc, &peers) {
        Ok(None) => res,
        Ok(Some(mutated)) => {
            info!(
                "aligning claim {}/{} with its resize group {}={}",
                namespace,
                pvc.name_any(),
                group_key,
                group_value
            );
            let patch = match (serde_json::to_value(pvc), serde_json::to_value(&mutated)) {
                (Ok(original), Ok(mutated)) => json_patch::diff(&original, &mutated),
                (Err(e), _) | (_, Err(e)) => {
                    error!("failed to serialize claim for patching: {}", e);
                    return AdmissionResponse::invalid(e.to_string());
                }
            };
            match res.with_patch(patch) {
                Ok(res) => res,
                Err(e) => AdmissionResponse::invalid(e.to_string()),
            }
        }
        Err(e) => {
            warn!("denied claim {}/{}: {}", namespace, pvc.name_any(), e);
            res.deny(e.to_string())
        }
    }
}

async fn mutate_handler(
    body: AdmissionReview<PersistentVolumeClaim>,
    cache: Arc<ClusterCache>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid admission request: {}", err);
            return Ok(reply::json(
                &AdmissionResponse::invalid(err.to_string()).into_review(),
            ));
        }
    };
    Ok(reply::json(&mutate(&req, &cache).into_review()))
}

/// Serves `POST /pvc/mutate` over TLS until shutdown. Certificate and key
/// are read from `cert_dir` (`tls.crt` / `tls.key`).
pub async fn serve(
    cache: Arc<ClusterCache>,
    addr: std::net::SocketAddr,
    cert_dir: PathBuf,
    shutdown: CancellationToken,
) {
    let cache = warp::any().map(move || Arc::clone(&cache));
    let routes = warp::path!("pvc" / "mutate")
        .and(warp::post())
        .and(warp::body::json())
        .and(cache)
        .and_then(mutate_handler)
        .with(warp::trace::request());

    let (bound, server) = warp::serve(routes)
        .tls()
        .cert_path(cert_dir.join("tls.crt"))
        .key_path(cert_dir.join("tls.key"))
        .bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await });
    info!("admission webhook listening on {}", bound);
    server.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STORAGE_LIMIT_ANNOTATION;
    use kube::runtime::watcher;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn pvc(name: &str, request: &str) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {
                "namespace": "default",
                "name": name,
            },
            "spec": {
                "storageClassName": "fast",
                "resources": {"requests": {"storage": request}},
            },
        }))
        .unwrap()
    }

    fn with_group(mut pvc: PersistentVolumeClaim, key: &str, value: &str) -> PersistentVolumeClaim {
        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(INITIAL_RESIZE_GROUP_BY_ANNOTATION.to_string(), key.to_string());
        pvc.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        pvc
    }

    fn with_limit(mut pvc: PersistentVolumeClaim, limit: &str) -> PersistentVolumeClaim {
        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(STORAGE_LIMIT_ANNOTATION.to_string(), limit.to_string());
        pvc
    }

    #[test]
    fn claims_without_a_group_annotation_are_admitted_unchanged() {
        let new = with_limit(pvc("b", "1Gi"), "10Gi");
        assert_eq!(align_with_peer_group(&new, &[]).unwrap(), None);
    }

    #[test]
    fn the_request_is_raised_to_the_peer_group_maximum() {
        let new = with_limit(with_group(pvc("b", "1Gi"), "grp", "x"), "10Gi");
        let peers = vec![with_group(pvc("a", "3Gi"), "grp", "x")];

        let mutated = align_with_peer_group(&new, &peers).unwrap().unwrap();
        assert_eq!(requested_storage(&mutated), Some(3 << 30));
    }

    #[test]
    fn a_claim_already_at_the_group_maximum_is_unchanged() {
        let new = with_limit(with_group(pvc("b", "3Gi"), "grp", "x"), "10Gi");
        let peers = vec![with_group(pvc("a", "3Gi"), "grp", "x")];
        assert_eq!(align_with_peer_group(&new, &peers).unwrap(), None);
    }

    #[test]
    fn a_raised_request_reaching_the_limit_is_rejected() {
        let new = with_limit(with_group(pvc("b", "1Gi"), "grp", "x"), "2Gi");
        let peers = vec![with_group(pvc("a", "3Gi"), "grp", "x")];
        assert!(matches!(
            align_with_peer_group(&new, &peers),
            Err(MutateError::OverLimit { .. })
        ));
    }

    #[test]
    fn without_a_storage_limit_the_claim_is_admitted_unchanged() {
        let new = with_group(pvc("b", "1Gi"), "grp", "x");
        let peers = vec![with_group(pvc("a", "3Gi"), "grp", "x")];
        assert_eq!(align_with_peer_group(&new, &peers).unwrap(), None);
    }

    fn admission_request(
        operation: &str,
        pvc: &PersistentVolumeClaim,
    ) -> AdmissionRequest<PersistentVolumeClaim> {
        let review: AdmissionReview<PersistentVolumeClaim> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-4328-b325-87b8f8b7c2b3",
                "kind": {"group": "", "version": "v1", "kind": "PersistentVolumeClaim"},
                "resource": {"group": "", "version": "v1", "resource": "persistentvolumeclaims"},
                "namespace": "default",
                "operation": operation,
                "userInfo": {},
                "object": serde_json::to_value(pvc).unwrap(),
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn only_create_operations_are_mutated() {
        let cache = ClusterCache::new(false);
        let claim = with_limit(with_group(pvc("b", "1Gi"), "grp", "x"), "10Gi");
        let res = mutate(&admission_request("UPDATE", &claim), &cache);
        assert!(res.allowed);
    }

    #[test]
    fn a_create_in_a_group_returns_a_patch_against_the_original() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(
            watcher::Event::Applied(with_group(pvc("a", "3Gi"), "grp", "x")),
            None,
        );

        let claim = with_limit(with_group(pvc("b", "1Gi"), "grp", "x"), "10Gi");
        let res = mutate(&admission_request("CREATE", &claim), &cache);
        assert!(res.allowed);

        let patch: json_patch::Patch =
            serde_json::from_slice(res.patch.as_deref().unwrap()).unwrap();
        let mut doc = serde_json::to_value(&claim).unwrap();
        json_patch::patch(&mut doc, &patch).unwrap();
        assert_eq!(doc["spec"]["resources"]["requests"]["storage"], "3Gi");
    }

    #[test]
    fn a_group_claim_without_the_label_is_rejected() {
        let cache = ClusterCache::new(false);
        let mut claim = with_limit(pvc("b", "1Gi"), "10Gi");
        claim
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(INITIAL_RESIZE_GROUP_BY_ANNOTATION.to_string(), "grp".to_string());

        let res = mutate(&admission_request("CREATE", &claim), &cache);
        assert!(!res.allowed);
    }

    #[test]
    fn a_group_maximum_over_the_limit_rejects_the_create() {
        let cache = ClusterCache::new(false);
        cache.apply_claim_event(
            watcher::Event::Applied(with_group(pvc("a", "3Gi"), "grp", "x")),
            None,
        );

        let claim = with_limit(with_group(pvc("b", "1Gi"), "grp", "x"), "2Gi");
        let res = mutate(&admission_request("CREATE", &claim), &cache);
        assert!(!res.allowed);
    }
}
