//! Operational counters exposed in Prometheus text format.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use warp::filters::BoxedFilter;
use warp::Filter;

#[derive(Debug)]
enum MetricType {
    Counter,
    Gauge,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

struct Metric {
    name: &'static str,
    description: &'static str,
    metric_type: MetricType,
    value: i64,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# HELP {} {}", self.name, self.description)?;
        writeln!(f, "# TYPE {} {}", self.name, self.metric_type)?;
        writeln!(f, "{} {}", self.name, self.value)
    }
}

/// Counters maintained by the orchestrator and served by the metrics endpoint.
#[derive(Debug, Default)]
pub struct Metrics {
    builds_total: AtomicU64,
    build_failures_total: AtomicU64,
    destroys_total: AtomicU64,
    active_environments: AtomicI64,
}

impl Metrics {
    /// Creates a zeroed counter set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a build that provisioned an environment, successfully or not.
    /// Failed environments keep their partial resources and stay active
    /// until destroyed.
    pub fn record_build(&self) {
        self.builds_total.fetch_add(1, Ordering::Relaxed);
        self.active_environments.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a build that ended in failure.
    pub fn record_build_failure(&self) {
        self.build_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed destroy. The gauge only drops when this process
    /// had counted the environment active; environments adopted from the
    /// store never incremented it.
    pub fn record_destroy(&self, retired: bool) {
        self.destroys_total.fetch_add(1, Ordering::Relaxed);

        if retired {
            self.active_environments.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Renders all counters in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metrics = vec![
            Metric {
                name: "envgrid_builds_total",
                description: "Number of build requests that started provisioning",
                metric_type: MetricType::Counter,
                value: self.builds_total.load(Ordering::Relaxed) as i64,
            },
            Metric {
                name: "envgrid_build_failures_total",
                description: "Number of build requests that ended in failure",
                metric_type: MetricType::Counter,
                value: self.build_failures_total.load(Ordering::Relaxed) as i64,
            },
            Metric {
                name: "envgrid_destroys_total",
                description: "Number of environments destroyed on request",
                metric_type: MetricType::Counter,
                value: self.destroys_total.load(Ordering::Relaxed) as i64,
            },
            Metric {
                name: "envgrid_active_environments",
                description: "Environments currently provisioned or provisioning",
                metric_type: MetricType::Gauge,
                value: self.active_environments.load(Ordering::Relaxed),
            },
        ];

        metrics
            .iter()
            .map(|metric| format!("{}", metric))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Route serving the rendered counters under the configured path, which may
/// contain several segments (e.g. `/ops/metrics`).
fn route(
    path: &str,
    metrics: Arc<Metrics>,
) -> BoxedFilter<(warp::reply::WithStatus<String>,)> {
    let with_metrics = warp::any().map(move || metrics.clone());

    let mut prefix = warp::any().boxed();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        prefix = prefix.and(warp::path(segment.to_owned())).boxed();
    }

    warp::get()
        .and(prefix)
        .and(warp::path::end())
        .and(with_metrics)
        .map(|metrics: Arc<Metrics>| {
            warp::reply::with_status(metrics.render(), warp::http::StatusCode::OK)
        })
        .boxed()
}

/// Serves the counters over plain HTTP until the process exits.
pub async fn serve(port: u16, path: &str, metrics: Arc<Metrics>) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!("Serving metrics at {:?}", addr);

    warp::serve(route(path, metrics)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();

        metrics.record_build();
        metrics.record_build();
        metrics.record_build_failure();
        metrics.record_destroy(true);

        let rendered = metrics.render();

        assert!(rendered.contains("envgrid_builds_total 2"));
        assert!(rendered.contains("envgrid_build_failures_total 1"));
        assert!(rendered.contains("envgrid_destroys_total 1"));
        assert!(rendered.contains("envgrid_active_environments 1"));
    }

    #[test]
    fn exposition_carries_type_headers() {
        let metrics = Metrics::new();
        let rendered = metrics.render();

        assert!(rendered.contains("# TYPE envgrid_builds_total counter"));
        assert!(rendered.contains("# TYPE envgrid_active_environments gauge"));
    }

    #[tokio::test]
    async fn endpoint_serves_the_configured_path() {
        let metrics = Metrics::new();
        metrics.record_build();

        let filter = route("/metrics", metrics);

        let response = warp::test::request().path("/metrics").reply(&filter).await;

        assert_eq!(response.status(), 200);
        let body = std::str::from_utf8(response.body()).unwrap();
        assert!(body.contains("envgrid_builds_total 1"));
    }

    #[tokio::test]
    async fn endpoint_handles_nested_paths() {
        let metrics = Metrics::new();

        let filter = route("/ops/metrics", metrics);

        let found = warp::test::request()
            .path("/ops/metrics")
            .reply(&filter)
            .await;
        assert_eq!(found.status(), 200);

        let miss = warp::test::request().path("/metrics").reply(&filter).await;
        assert_eq!(miss.status(), 404);
    }
}
