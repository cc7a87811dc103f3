//! Volume-stats collection.
//!
//! One snapshot of per-claim filesystem usage is fetched per reconcile
//! tick, either from a central time-series endpoint or by scraping the
//! metrics endpoint of every ready node through the API-server proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

use crate::metrics::Metrics;

pub const VOLUME_AVAILABLE_QUERY: &str = "kubelet_volume_stats_available_bytes";
pub const VOLUME_CAPACITY_QUERY: &str = "kubelet_volume_stats_capacity_bytes";
pub const INODES_AVAILABLE_QUERY: &str = "kubelet_volume_stats_inodes_free";
pub const INODES_CAPACITY_QUERY: &str = "kubelet_volume_stats_inodes";

/// Namespace-qualified claim identity used to join telemetry with cluster
/// objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

/// Usage figures for one claim. A capacity of zero means the volume did
/// not report that series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub available_bytes: i64,
    pub capacity_bytes: i64,
    pub available_inodes: i64,
    pub capacity_inodes: i64,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("time-series request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("time-series query returned status {0:?}")]
    QueryFailed(String),
    #[error("unexpected time-series result type {0:?}")]
    UnexpectedResultType(String),
    #[error("failed to list cluster nodes: {0}")]
    NodeList(#[source] kube::Error),
}

/// The two interchangeable volume-stats back-ends.
pub enum TelemetrySource {
    Timeseries(TimeseriesClient),
    NodeProxy(NodeProxyClient),
}

impl TelemetrySource {
    /// Returns one map of claim to volume stats. Partial results are
    /// permitted; claims absent from the map are skipped downstream.
    pub async fn get_metrics(
        &self,
    ) -> Result<HashMap<ClaimRef, VolumeStats>, TelemetryError> {
        match self {
            TelemetrySource::Timeseries(c) => c.get_metrics().await,
            TelemetrySource::NodeProxy(c) => c.get_metrics().await,
        }
    }
}

#[derive(serde::Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(serde::Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(serde::Deserialize)]
struct VectorSample {
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// Issues four point-in-time queries against an external query endpoint
/// and joins them per claim.
pub struct TimeseriesClient {
    http: reqwest::Client,
    base_url: String,
    metrics: Arc<Metrics>,
}

impl TimeseriesClient {
    pub fn new(base_url: String, metrics: Arc<Metrics>) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(TimeseriesClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            metrics,
        })
    }

    async fn get_metrics(&self) -> Result<HashMap<ClaimRef, VolumeStats>, TelemetryError> {
        // All four series are sampled at the same instant.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let available_bytes = self.query_values(VOLUME_AVAILABLE_QUERY, now).await?;
        let capacity_bytes = self.query_values(VOLUME_CAPACITY_QUERY, now).await?;
        let available_inodes = self.query_values(INODES_AVAILABLE_QUERY, now).await?;
        let capacity_inodes = self.query_values(INODES_CAPACITY_QUERY, now).await?;

        Ok(join_stat_maps(
            available_bytes,
            capacity_bytes,
            available_inodes,
            capacity_inodes,
        ))
    }

    async fn query_values(
        &self,
        query: &str,
        timestamp: f64,
    ) -> Result<HashMap<ClaimRef, i64>, TelemetryError> {
        let response = match self.run_query(query, timestamp).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.metrics_client_fail_total.inc();
                return Err(e.into());
            }
        };

        let data = match response {
            QueryResponse {
                status,
                data: Some(data),
            } if status == "success" => data,
            QueryResponse { status, .. } => {
                self.metrics.metrics_client_fail_total.inc();
                return Err(TelemetryError::QueryFailed(status));
            }
        };
        if data.result_type != "vector" {
            return Err(TelemetryError::UnexpectedResultType(data.result_type));
        }

        let mut values = HashMap::new();
        for sample in data.result {
            let claim = ClaimRef {
                namespace: sample.metric.get("namespace").cloned().unwrap_or_default(),
                name: sample
                    .metric
                    .get("persistentvolumeclaim")
                    .cloned()
                    .unwrap_or_default(),
            };
            let value = sample.value.1.parse::<f64>().unwrap_or_default() as i64;
            values.insert(claim, value);
        }
        Ok(values)
    }

    async fn run_query(
        &self,
        query: &str,
        timestamp: f64,
    ) -> Result<QueryResponse, reqwest::Error> {
        let time = timestamp.to_string();
        self.http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<QueryResponse>()
            .await
    }
}

/// Inner join of the four per-claim series: a claim is reported only when
/// every series produced a value for it.
fn join_stat_maps(
    available_bytes: HashMap<ClaimRef, i64>,
    capacity_bytes: HashMap<ClaimRef, i64>,
    available_inodes: HashMap<ClaimRef, i64>,
    capacity_inodes: HashMap<ClaimRef, i64>,
) -> HashMap<ClaimRef, VolumeStats> {
    let mut joined = HashMap::new();
    for (claim, available) in available_bytes {
        let Some(&capacity) = capacity_bytes.get(&claim) else {
            continue;
        };
        let Some(&inodes_free) = available_inodes.get(&claim) else {
            continue;
        };
        let Some(&inodes) = capacity_inodes.get(&claim) else {
            continue;
        };
        joined.insert(
            claim,
            VolumeStats {
                available_bytes: available,
                capacity_bytes: capacity,
                available_inodes: inodes_free,
                capacity_inodes: inodes,
            },
        );
    }
    joined
}

/// Scrapes the kubelet metrics endpoint of every ready node through the
/// API-server proxy and merges the per-node results.
pub struct NodeProxyClient {
    client: Client,
    metrics: Arc<Metrics>,
}

impl NodeProxyClient {
    pub fn new(client: Client, metrics: Arc<Metrics>) -> Self {
        NodeProxyClient { client, metrics }
    }

    async fn get_metrics(&self) -> Result<HashMap<ClaimRef, VolumeStats>, TelemetryError> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                self.metrics.metrics_client_fail_total.inc();
                TelemetryError::NodeList(e)
            })?;

        let usage = Arc::new(Mutex::new(HashMap::new()));
        let mut scrapes = JoinSet::new();
        for node in nodes.items {
            if !is_node_ready(&node) {
                continue;
            }
            let Some(node_name) = node.metadata.name else {
                continue;
            };
            let client = self.client.clone();
            let usage = Arc::clone(&usage);
            scrapes.spawn(async move {
                match scrape_node(client, &node_name).await {
                    Ok(node_usage) => {
                        let mut usage = usage.lock().await;
                        usage.extend(node_usage);
                    }
                    // Other nodes still contribute.
                    Err(e) => warn!("failed to get volume stats from node {}: {}", node_name, e),
                }
            });
        }
        while let Some(joined) = scrapes.join_next().await {
            if let Err(e) = joined {
                warn!("node scrape task failed: {}", e);
            }
        }

        let usage = Arc::try_unwrap(usage)
            .map(Mutex::into_inner)
            .unwrap_or_default();
        Ok(usage)
    }
}

async fn scrape_node(
    client: Client,
    node_name: &str,
) -> anyhow::Result<HashMap<ClaimRef, VolumeStats>> {
    let request = http::Request::get(format!("/api/v1/nodes/{}/proxy/metrics", node_name))
        .body(Vec::new())?;
    let body = client.request_text(request).await?;
    parse_node_exposition(&body)
}

/// Extracts the four volume gauges from a text-format exposition and joins
/// them by claim.
fn parse_node_exposition(body: &str) -> anyhow::Result<HashMap<ClaimRef, VolumeStats>> {
    let lines = body
        .lines()
        .map(|line| Ok::<_, std::io::Error>(line.to_string()));
    let scrape = prometheus_parse::Scrape::parse(lines)?;

    let mut usage: HashMap<ClaimRef, VolumeStats> = HashMap::new();
    for sample in scrape.samples {
        let value = match sample.value {
            prometheus_parse::Value::Counter(v)
            | prometheus_parse::Value::Gauge(v)
            | prometheus_parse::Value::Untyped(v) => v as i64,
            _ => continue,
        };
        let claim = ClaimRef {
            namespace: sample.labels.get("namespace").unwrap_or_default().to_string(),
            name: sample
                .labels
                .get("persistentvolumeclaim")
                .unwrap_or_default()
                .to_string(),
        };
        if claim.namespace.is_empty() || claim.name.is_empty() {
            continue;
        }
        let stats = usage.entry(claim).or_default();
        match sample.metric.as_str() {
            VOLUME_AVAILABLE_QUERY => stats.available_bytes = value,
            VOLUME_CAPACITY_QUERY => stats.capacity_bytes = value,
            INODES_AVAILABLE_QUERY => stats.available_inodes = value,
            INODES_CAPACITY_QUERY => stats.capacity_inodes = value,
            _ => {}
        }
    }
    Ok(usage)
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn claim(namespace: &str, name: &str) -> ClaimRef {
        ClaimRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn join_keeps_only_claims_with_all_four_series() {
        let complete = claim("default", "data-db-0");
        let partial = claim("default", "data-db-1");

        let available = HashMap::from([(complete.clone(), 100), (partial.clone(), 7)]);
        let capacity = HashMap::from([(complete.clone(), 1000), (partial.clone(), 70)]);
        let inodes_free = HashMap::from([(complete.clone(), 50)]);
        let inodes = HashMap::from([(complete.clone(), 500)]);

        let joined = join_stat_maps(available, capacity, inodes_free, inodes);
        assert_eq!(joined.len(), 1);
        assert_eq!(
            joined[&complete],
            VolumeStats {
                available_bytes: 100,
                capacity_bytes: 1000,
                available_inodes: 50,
                capacity_inodes: 500,
            }
        );
    }

    #[test]
    fn node_exposition_is_parsed_and_joined_per_claim() {
        let body = "\
# HELP kubelet_volume_stats_available_bytes Number of available bytes in the volume
# TYPE kubelet_volume_stats_available_bytes gauge
kubelet_volume_stats_available_bytes{namespace=\"default\",persistentvolumeclaim=\"data-db-0\"} 5.36870912e+08
kubelet_volume_stats_available_bytes{namespace=\"prod\",persistentvolumeclaim=\"data-db-1\"} 1024
# TYPE kubelet_volume_stats_capacity_bytes gauge
kubelet_volume_stats_capacity_bytes{namespace=\"default\",persistentvolumeclaim=\"data-db-0\"} 1.073741824e+09
# TYPE kubelet_volume_stats_inodes_free gauge
kubelet_volume_stats_inodes_free{namespace=\"default\",persistentvolumeclaim=\"data-db-0\"} 1000
# TYPE kubelet_volume_stats_inodes gauge
kubelet_volume_stats_inodes{namespace=\"default\",persistentvolumeclaim=\"data-db-0\"} 2000
# TYPE some_other_metric gauge
some_other_metric{namespace=\"default\",persistentvolumeclaim=\"data-db-0\"} 1
";
        let usage = parse_node_exposition(body).unwrap();

        let complete = &usage[&claim("default", "data-db-0")];
        assert_eq!(complete.available_bytes, 536870912);
        assert_eq!(complete.capacity_bytes, 1 << 30);
        assert_eq!(complete.available_inodes, 1000);
        assert_eq!(complete.capacity_inodes, 2000);

        // A claim scraped with only one series keeps zero (unreported)
        // capacities and is skipped downstream.
        let partial = &usage[&claim("prod", "data-db-1")];
        assert_eq!(partial.available_bytes, 1024);
        assert_eq!(partial.capacity_bytes, 0);
    }

    fn node_with_conditions(conditions: Vec<NodeCondition>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn node_readiness_follows_the_ready_condition() {
        let ready = node_with_conditions(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..NodeCondition::default()
        }]);
        let not_ready = node_with_conditions(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            ..NodeCondition::default()
        }]);

        assert!(is_node_ready(&ready));
        assert!(!is_node_ready(&not_ready));
        assert!(!is_node_ready(&Node::default()));
    }
}
