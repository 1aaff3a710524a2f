use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "historian";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "historian" namespace and live in a private registry
/// so tests can create as many instances as they like.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Events delivered to the ingest filter.
    pub events_received: Counter,
    /// Events discarded by the ingest filter, by reason.
    pub events_rejected: CounterVec,
    /// Entries appended to the local cache.
    pub cache_appends: Counter,
    /// Metrics with a debounced event waiting to be appended.
    pub debounce_pending: Gauge,

    // === Sweeps ===
    /// Sweeps by kind (dispatch/retention) and outcome.
    pub sweeps: CounterVec,
    /// Sweep wall time by kind.
    pub sweep_duration: HistogramVec,
    /// Entries written to the store.
    pub entries_persisted: Counter,
    /// Inserts that failed and will be retried.
    pub insert_errors: Counter,
    /// Cache entries skipped as corrupt, by stage (dispatch/query).
    pub corrupt_entries: CounterVec,
    /// Entries removed by the retention pruner.
    pub retention_removed: Counter,
    /// Dimension keys created in the store, by table.
    pub dimension_creates: CounterVec,
    /// Whether the last probe or borrow reached the store (1=yes, 0=no).
    pub store_available: Gauge,

    // === Queries ===
    /// History requests by serving source (store/cache/none).
    pub history_requests: CounterVec,
    /// History request latency.
    pub history_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events delivered to the ingest filter.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_rejected = CounterVec::new(
            Opts::new(
                "events_rejected_total",
                "Total events discarded by the ingest filter by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let cache_appends = Counter::with_opts(
            Opts::new(
                "cache_appends_total",
                "Total entries appended to the local cache.",
            )
            .namespace(NAMESPACE),
        )?;
        let debounce_pending = Gauge::with_opts(
            Opts::new(
                "debounce_pending",
                "Number of metrics with a debounced event waiting to be appended.",
            )
            .namespace(NAMESPACE),
        )?;

        let sweeps = CounterVec::new(
            Opts::new("sweeps_total", "Total sweeps by kind and outcome.").namespace(NAMESPACE),
            &["sweep", "result"],
        )?;
        let sweep_duration = HistogramVec::new(
            HistogramOpts::new("sweep_duration_seconds", "Sweep wall time by kind.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["sweep"],
        )?;
        let entries_persisted = Counter::with_opts(
            Opts::new(
                "entries_persisted_total",
                "Total cache entries written to the store.",
            )
            .namespace(NAMESPACE),
        )?;
        let insert_errors = Counter::with_opts(
            Opts::new(
                "insert_errors_total",
                "Total store inserts that failed and were left for retry.",
            )
            .namespace(NAMESPACE),
        )?;
        let corrupt_entries = CounterVec::new(
            Opts::new(
                "corrupt_entries_total",
                "Total cache entries skipped as corrupt by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let retention_removed = Counter::with_opts(
            Opts::new(
                "retention_removed_total",
                "Total cache entries removed by the retention pruner.",
            )
            .namespace(NAMESPACE),
        )?;
        let dimension_creates = CounterVec::new(
            Opts::new(
                "dimension_creates_total",
                "Total dimension keys created in the store by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let store_available = Gauge::with_opts(
            Opts::new(
                "store_available",
                "Whether the store was reachable on the last attempt (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        let history_requests = CounterVec::new(
            Opts::new(
                "history_requests_total",
                "Total history requests by serving source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let history_duration = Histogram::with_opts(
            HistogramOpts::new(
                "history_duration_seconds",
                "Time to answer a history request.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(cache_appends.clone()))?;
        registry.register(Box::new(debounce_pending.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;
        registry.register(Box::new(sweep_duration.clone()))?;
        registry.register(Box::new(entries_persisted.clone()))?;
        registry.register(Box::new(insert_errors.clone()))?;
        registry.register(Box::new(corrupt_entries.clone()))?;
        registry.register(Box::new(retention_removed.clone()))?;
        registry.register(Box::new(dimension_creates.clone()))?;
        registry.register(Box::new(store_available.clone()))?;
        registry.register(Box::new(history_requests.clone()))?;
        registry.register(Box::new(history_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_rejected,
            cache_appends,
            debounce_pending,
            sweeps,
            sweep_duration,
            entries_persisted,
            insert_errors,
            corrupt_entries,
            retention_removed,
            dimension_creates,
            store_available,
            history_requests,
            history_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Expands the ":port" shorthand to a bindable address.
pub(crate) fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
