//! Thin wrappers over the cluster API that record a per-kind failure
//! counter without changing call-site error handling.

use std::fmt::Debug;

use kube::api::{Api, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::metrics::Metrics;

fn record_failure<K>(metrics: &Metrics, verb: &str)
where
    K: Resource<DynamicType = ()>,
{
    metrics
        .kubernetes_client_fail_total
        .with_label_values(&[&K::group(&()), &K::version(&()), &K::kind(&()), verb])
        .inc();
}

fn record_dynamic_failure(metrics: &Metrics, resource: &ApiResource, verb: &str) {
    metrics
        .kubernetes_client_fail_total
        .with_label_values(&[&resource.group, &resource.version, &resource.kind, verb])
        .inc();
}

pub async fn list<K>(
    api: &Api<K>,
    params: &ListParams,
    metrics: &Metrics,
) -> kube::Result<ObjectList<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let res = api.list(params).await;
    if res.is_err() {
        record_failure::<K>(metrics, "LIST");
    }
    res
}

pub async fn get<K>(api: &Api<K>, name: &str, metrics: &Metrics) -> kube::Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let res = api.get(name).await;
    if res.is_err() {
        record_failure::<K>(metrics, "GET");
    }
    res
}

pub async fn replace<K>(api: &Api<K>, obj: &K, metrics: &Metrics) -> kube::Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    let res = api.replace(&name, &PostParams::default(), obj).await;
    if res.is_err() {
        record_failure::<K>(metrics, "PUT");
    }
    res
}

pub async fn get_dynamic(
    api: &Api<DynamicObject>,
    resource: &ApiResource,
    name: &str,
    metrics: &Metrics,
) -> kube::Result<DynamicObject> {
    let res = api.get(name).await;
    if res.is_err() {
        record_dynamic_failure(metrics, resource, "GET");
    }
    res
}

pub async fn patch_dynamic<P: Serialize + Debug>(
    api: &Api<DynamicObject>,
    resource: &ApiResource,
    name: &str,
    patch: &Patch<P>,
    metrics: &Metrics,
) -> kube::Result<DynamicObject> {
    let res = api.patch(name, &PatchParams::default(), patch).await;
    if res.is_err() {
        record_dynamic_failure(metrics, resource, "PATCH");
    }
    res
}
