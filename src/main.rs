use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warp::Filter;

use pvc_expander::cr_patch::CrPatcher;
use pvc_expander::expander::{Expander, ExpanderConfig, ResizeDefaults};
use pvc_expander::hooks;
use pvc_expander::indexer::{watch_claims, watch_storage_classes, ClusterCache};
use pvc_expander::metrics::Metrics;
use pvc_expander::resource_class::load_resource_classes;
use pvc_expander::telemetry::{NodeProxyClient, TelemetrySource, TimeseriesClient};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum TelemetryKind {
    /// Query a central time-series endpoint.
    Timeseries,
    /// Scrape every ready node's metrics endpoint through the API proxy.
    PerNode,
}

#[derive(Debug, Parser)]
#[command(
    name = "pvc-expander",
    about = "Grows PersistentVolumeClaims before their filesystems run out of free space or inodes."
)]
struct Options {
    /// Interval between expansion scans.
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Where to fetch per-volume usage from.
    #[arg(long, value_enum, default_value = "per-node")]
    telemetry_source: TelemetryKind,

    /// Query endpoint URL; required when the telemetry source is
    /// `timeseries`.
    #[arg(long)]
    timeseries_url: Option<String>,

    /// Namespaces to watch claims in. Empty for all namespaces.
    #[arg(long)]
    namespaces: Vec<String>,

    /// Treat every storage class as enabled regardless of its annotation.
    #[arg(long)]
    skip_annotation_check: bool,

    /// Enable the claim-creation mutating webhook.
    #[arg(long)]
    webhook_enabled: bool,

    /// Listen address for the webhook endpoint.
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Directory holding the webhook TLS material (tls.crt / tls.key).
    #[arg(long, default_value = "/certs")]
    cert_dir: PathBuf,

    /// Listen address of the health and readiness probes.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Listen address of the metrics endpoint.
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Free-space threshold for claims without an explicit annotation.
    #[arg(long, default_value = pvc_expander::DEFAULT_THRESHOLD)]
    default_threshold: String,

    /// Free-inodes threshold for claims without an explicit annotation.
    #[arg(long, default_value = pvc_expander::DEFAULT_INODES_THRESHOLD)]
    default_inodes_threshold: String,

    /// Increase for claims without an explicit annotation.
    #[arg(long, default_value = pvc_expander::DEFAULT_INCREASE)]
    default_increase: String,

    /// Path to the resource-class catalog enabling CR patching.
    #[arg(long)]
    resource_classes_path: Option<PathBuf>,

    /// Propagate policy annotations from StatefulSet claim templates.
    #[arg(long)]
    annotation_patching_enabled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Options::parse();

    let metrics = Arc::new(Metrics::new().context("failed to build the metrics registry")?);

    let resource_classes = match &opts.resource_classes_path {
        Some(path) => load_resource_classes(path)
            .with_context(|| format!("invalid resource class catalog {}", path.display()))?,
        None => HashMap::new(),
    };

    let client = Client::try_default().await?;
    let cache = Arc::new(ClusterCache::new(opts.skip_annotation_check));
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(watch_storage_classes(
        Arc::clone(&cache),
        client.clone(),
        shutdown.clone(),
    )));
    if opts.namespaces.is_empty() {
        tasks.push(tokio::spawn(watch_claims(
            Arc::clone(&cache),
            client.clone(),
            None,
            shutdown.clone(),
        )));
    } else {
        for namespace in &opts.namespaces {
            tasks.push(tokio::spawn(watch_claims(
                Arc::clone(&cache),
                client.clone(),
                Some(namespace.clone()),
                shutdown.clone(),
            )));
        }
    }

    let telemetry = match opts.telemetry_source {
        TelemetryKind::Timeseries => {
            let url = opts
                .timeseries_url
                .clone()
                .context("--timeseries-url is required with --telemetry-source=timeseries")?;
            TelemetrySource::Timeseries(TimeseriesClient::new(url, Arc::clone(&metrics))?)
        }
        TelemetryKind::PerNode => {
            TelemetrySource::NodeProxy(NodeProxyClient::new(client.clone(), Arc::clone(&metrics)))
        }
    };

    let cr_patcher = CrPatcher::new(client.clone(), resource_classes, Arc::clone(&metrics));
    let expander = Expander::new(
        client.clone(),
        Arc::clone(&cache),
        telemetry,
        cr_patcher,
        Arc::clone(&metrics),
        ExpanderConfig {
            interval: opts.interval,
            annotation_patching_enabled: opts.annotation_patching_enabled,
            defaults: ResizeDefaults {
                threshold: opts.default_threshold.clone(),
                inodes_threshold: opts.default_inodes_threshold.clone(),
                increase: opts.default_increase.clone(),
            },
        },
    );
    tasks.push(tokio::spawn(expander.run(shutdown.clone())));

    if opts.webhook_enabled {
        tasks.push(tokio::spawn(hooks::serve(
            Arc::clone(&cache),
            opts.webhook_addr,
            opts.cert_dir.clone(),
            shutdown.clone(),
        )));
    }

    tasks.push(tokio::spawn(serve_metrics(
        Arc::clone(&metrics),
        opts.metrics_addr,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(serve_probes(opts.health_addr, shutdown.clone())));

    info!("pvc-expander started");
    wait_for_signal().await?;
    info!("shutting down");
    shutdown.cancel();
    futures::future::join_all(tasks).await;
    Ok(())
}

async fn serve_metrics(metrics: Arc<Metrics>, addr: SocketAddr, shutdown: CancellationToken) {
    let route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || match metrics.export() {
            Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
            Err(e) => {
                error!("failed to encode metrics: {}", e);
                warp::reply::with_status(
                    e.to_string(),
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        });
    let (bound, server) =
        warp::serve(route).bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await
        });
    info!("metrics endpoint listening on {}", bound);
    server.await;
}

async fn serve_probes(addr: SocketAddr, shutdown: CancellationToken) {
    let healthz = warp::path("healthz").and(warp::path::end()).map(|| "ok");
    let readyz = warp::path("readyz").and(warp::path::end()).map(|| "ok");
    let (bound, server) = warp::serve(healthz.or(readyz))
        .bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await });
    info!("probe endpoint listening on {}", bound);
    server.await;
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
