use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "relaytally";

/// Prometheus metrics describing the collector's own health.
///
/// All metrics use the "relaytally" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed poll cycles.
    pub cycles: Counter,
    /// Wall-clock duration of a poll cycle, publish included.
    pub cycle_duration: Histogram,
    /// Instances listed in the last good instance file.
    pub instances_configured: Gauge,
    /// Instances that answered during the last cycle.
    pub instances_reachable: Gauge,
    /// Failed instance polls by instance and error_type.
    pub poll_errors: CounterVec,
    /// Bytes attributed to countries by direction (download/upload).
    pub attributed_bytes: CounterVec,
    /// Geo lookups by answering source (cache/control/tool/unknown).
    pub geo_lookups: CounterVec,
    /// Entries currently held by the geo cache.
    pub geo_cache_entries: Gauge,
    /// Failed writes by store.
    pub persist_errors: CounterVec,
    /// Unix time of the last successful snapshot publish.
    pub last_publish_timestamp: Gauge,
    /// Instance file reads or parses that fell back to the last good
    /// configuration.
    pub config_reload_errors: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Total completed poll cycles.").namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Poll cycle duration including publish.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let instances_configured = Gauge::with_opts(
            Opts::new(
                "instances_configured",
                "Number of instances in the active instance configuration.",
            )
            .namespace(NAMESPACE),
        )?;
        let instances_reachable = Gauge::with_opts(
            Opts::new(
                "instances_reachable",
                "Number of instances that answered during the last cycle.",
            )
            .namespace(NAMESPACE),
        )?;
        let poll_errors = CounterVec::new(
            Opts::new(
                "poll_errors_total",
                "Total failed instance polls by instance and error type.",
            )
            .namespace(NAMESPACE),
            &["instance", "error_type"],
        )?;
        let attributed_bytes = CounterVec::new(
            Opts::new(
                "attributed_bytes_total",
                "Total bytes attributed to countries by direction.",
            )
            .namespace(NAMESPACE),
            &["direction"],
        )?;
        let geo_lookups = CounterVec::new(
            Opts::new(
                "geo_lookups_total",
                "Total address resolutions by answering source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let geo_cache_entries = Gauge::with_opts(
            Opts::new("geo_cache_entries", "Number of entries in the geo cache.")
                .namespace(NAMESPACE),
        )?;
        let persist_errors = CounterVec::new(
            Opts::new(
                "persist_errors_total",
                "Total failed writes by store.",
            )
            .namespace(NAMESPACE),
            &["store"],
        )?;
        let last_publish_timestamp = Gauge::with_opts(
            Opts::new(
                "last_publish_timestamp_seconds",
                "Unix time of the last successful snapshot publish.",
            )
            .namespace(NAMESPACE),
        )?;
        let config_reload_errors = Counter::with_opts(
            Opts::new(
                "config_reload_errors_total",
                "Total instance file reloads that kept the previous configuration.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(instances_configured.clone()))?;
        registry.register(Box::new(instances_reachable.clone()))?;
        registry.register(Box::new(poll_errors.clone()))?;
        registry.register(Box::new(attributed_bytes.clone()))?;
        registry.register(Box::new(geo_lookups.clone()))?;
        registry.register(Box::new(geo_cache_entries.clone()))?;
        registry.register(Box::new(persist_errors.clone()))?;
        registry.register(Box::new(last_publish_timestamp.clone()))?;
        registry.register(Box::new(config_reload_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_duration,
            instances_configured,
            instances_reachable,
            poll_errors,
            attributed_bytes,
            geo_lookups,
            geo_cache_entries,
            persist_errors,
            last_publish_timestamp,
            config_reload_errors,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[test]
    fn test_metrics_are_namespaced() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.cycles.inc();
        metrics
            .poll_errors
            .with_label_values(&["2", "timeout"])
            .inc();
        metrics
            .attributed_bytes
            .with_label_values(&["download"])
            .inc_by(1500.0);

        let text = metrics.encode_text().expect("encode");
        assert!(text.contains("relaytally_cycles_total 1"));
        assert!(text.contains(r#"relaytally_poll_errors_total{error_type="timeout",instance="2"} 1"#));
        assert!(text.contains(r#"relaytally_attributed_bytes_total{direction="download"} 1500"#));
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.geo_cache_entries.set(42.0);
        let addr = metrics.start().await.expect("start");

        let health = http_get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let body = http_get(addr, "/metrics").await;
        assert!(body.contains("relaytally_geo_cache_entries 42"));

        metrics.stop().await.expect("stop");
    }
}
