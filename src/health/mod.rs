pub mod api;

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

use self::api::ReadApi;

const NAMESPACE: &str = "wristband";

/// Prometheus metrics for agent health, plus the HTTP server exposing them.
///
/// All metrics use the "wristband" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Sampling ===
    /// Probes started by the dispatcher.
    pub probes_launched: Counter,
    /// Probe failures by kind (connect_timeout/connect_refused/other/panic).
    pub probe_failures: CounterVec,
    /// Probes currently running.
    pub probes_in_flight: Gauge,
    /// Registered instance schedules.
    pub schedules_registered: Gauge,
    /// Current write queue length.
    pub write_queue_length: Gauge,

    // === Write path ===
    /// Samples persisted.
    pub samples_written: Counter,
    /// Samples dropped by reason.
    pub samples_dropped: CounterVec,
    /// Dictionary rows opened.
    pub dictionary_rows_opened: Counter,
    /// Dictionary rows closed.
    pub dictionary_rows_closed: Counter,
    /// Duration of one batch write (1ms-10s buckets).
    pub write_duration: Histogram,

    // === Lifecycle ===
    /// Completed rollups.
    pub archive_rollups: Counter,
    /// Tier evaluations skipped by reason.
    pub archive_skips: CounterVec,
    /// Failed rollups.
    pub archive_errors: Counter,
    /// Duration of one rollup unit of work (1ms-60s buckets).
    pub archive_duration: Histogram,
    /// Purge deletes executed.
    pub purge_runs: Counter,
    /// Failed purge deletes.
    pub purge_errors: Counter,

    // === Supervision ===
    /// Whether the repository is reachable (1=yes, 0=no).
    pub repository_accessible: Gauge,
    /// Component failures by component.
    pub component_failures: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let probes_launched = Counter::with_opts(
            Opts::new("probes_launched_total", "Total probes started.").namespace(NAMESPACE),
        )?;
        let probe_failures = CounterVec::new(
            Opts::new("probe_failures_total", "Total probe failures by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let probes_in_flight = Gauge::with_opts(
            Opts::new("probes_in_flight", "Probes currently running.").namespace(NAMESPACE),
        )?;
        let schedules_registered = Gauge::with_opts(
            Opts::new("schedules_registered", "Registered instance schedules.")
                .namespace(NAMESPACE),
        )?;
        let write_queue_length = Gauge::with_opts(
            Opts::new("write_queue_length", "Probe results waiting to be written.")
                .namespace(NAMESPACE),
        )?;

        let samples_written = Counter::with_opts(
            Opts::new("samples_written_total", "Total samples persisted.").namespace(NAMESPACE),
        )?;
        let samples_dropped = CounterVec::new(
            Opts::new("samples_dropped_total", "Total samples dropped by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let dictionary_rows_opened = Counter::with_opts(
            Opts::new("dictionary_rows_opened_total", "Total dictionary rows opened.")
                .namespace(NAMESPACE),
        )?;
        let dictionary_rows_closed = Counter::with_opts(
            Opts::new("dictionary_rows_closed_total", "Total dictionary rows closed.")
                .namespace(NAMESPACE),
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new("write_duration_seconds", "Batch write duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;

        let archive_rollups = Counter::with_opts(
            Opts::new("archive_rollups_total", "Total completed rollups.").namespace(NAMESPACE),
        )?;
        let archive_skips = CounterVec::new(
            Opts::new("archive_skips_total", "Total tier evaluations skipped by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let archive_errors = Counter::with_opts(
            Opts::new("archive_errors_total", "Total failed rollups.").namespace(NAMESPACE),
        )?;
        let archive_duration = Histogram::with_opts(
            HistogramOpts::new("archive_duration_seconds", "Rollup unit-of-work duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let purge_runs = Counter::with_opts(
            Opts::new("purge_runs_total", "Total purge deletes executed.").namespace(NAMESPACE),
        )?;
        let purge_errors = Counter::with_opts(
            Opts::new("purge_errors_total", "Total failed purge deletes.").namespace(NAMESPACE),
        )?;

        let repository_accessible = Gauge::with_opts(
            Opts::new(
                "repository_accessible",
                "Whether the repository is reachable (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let component_failures = CounterVec::new(
            Opts::new("component_failures_total", "Total component failures.")
                .namespace(NAMESPACE),
            &["component"],
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(probes_launched.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(probes_in_flight.clone()))?;
        registry.register(Box::new(schedules_registered.clone()))?;
        registry.register(Box::new(write_queue_length.clone()))?;
        registry.register(Box::new(samples_written.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(dictionary_rows_opened.clone()))?;
        registry.register(Box::new(dictionary_rows_closed.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;
        registry.register(Box::new(archive_rollups.clone()))?;
        registry.register(Box::new(archive_skips.clone()))?;
        registry.register(Box::new(archive_errors.clone()))?;
        registry.register(Box::new(archive_duration.clone()))?;
        registry.register(Box::new(purge_runs.clone()))?;
        registry.register(Box::new(purge_errors.clone()))?;
        registry.register(Box::new(repository_accessible.clone()))?;
        registry.register(Box::new(component_failures.clone()))?;

        repository_accessible.set(1.0);

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            probes_launched,
            probe_failures,
            probes_in_flight,
            schedules_registered,
            write_queue_length,
            samples_written,
            samples_dropped,
            dictionary_rows_opened,
            dictionary_rows_closed,
            write_duration,
            archive_rollups,
            archive_skips,
            archive_errors,
            archive_duration,
            purge_runs,
            purge_errors,
            repository_accessible,
            component_failures,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Serves /metrics, /healthz and the read API on the configured
    /// address until [`stop`](Self::stop). `:port` binds every interface.
    pub async fn start(&self, api: Option<Arc<ReadApi>>) -> Result<()> {
        let bind_addr = match self.addr.as_str() {
            "" => "0.0.0.0:9090".to_string(),
            port if port.starts_with(':') => format!("0.0.0.0{port}"),
            addr => addr.to_string(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/api/targets/:target/groups/:group/current",
                get(api::current_handler),
            )
            .route(
                "/api/targets/:target/groups/:group/top/:column",
                get(api::top_handler),
            );

        #[cfg(feature = "profiling")]
        let app = app
            .route("/debug/pprof/profile", get(profiling::protobuf_handler))
            .route("/debug/pprof/flamegraph", get(profiling::flamegraph_handler));

        let app = app.with_state(Arc::new(AppState {
            registry: self.registry.clone(),
            api,
        }));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding health server to {bind_addr}"))?;
        let local_addr = listener.local_addr().context("reading bound address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server listening");

            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;

            if let Err(e) = served {
                tracing::error!(error = %e, "health server terminated");
            }
        });

        Ok(())
    }

    /// Signals the server to drain and exit. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

pub(crate) struct AppState {
    registry: Registry,
    pub(crate) api: Option<Arc<ReadApi>>,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("metrics are not valid UTF-8")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering /metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string())
        }
    }
}

/// CPU profiling endpoints, compiled with the `profiling` feature.
#[cfg(feature = "profiling")]
mod profiling {
    use anyhow::{anyhow, Result};
    use axum::extract::Query;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};

    #[derive(serde::Deserialize)]
    pub(super) struct ProfileQuery {
        seconds: Option<u64>,
    }

    pub(super) async fn protobuf_handler(Query(q): Query<ProfileQuery>) -> Response {
        respond("application/octet-stream", q, |report| {
            use prost::Message;
            let profile = report.pprof().map_err(|e| anyhow!("building pprof: {e}"))?;
            let mut buf = Vec::with_capacity(profile.encoded_len());
            profile
                .encode(&mut buf)
                .map_err(|e| anyhow!("encoding pprof: {e}"))?;
            Ok(buf)
        })
        .await
    }

    pub(super) async fn flamegraph_handler(Query(q): Query<ProfileQuery>) -> Response {
        respond("image/svg+xml", q, |report| {
            let mut svg = Vec::new();
            report
                .flamegraph(&mut svg)
                .map_err(|e| anyhow!("rendering flamegraph: {e}"))?;
            Ok(svg)
        })
        .await
    }

    /// Samples the process on the blocking pool, then encodes the report.
    async fn respond<F>(content_type: &'static str, q: ProfileQuery, encode: F) -> Response
    where
        F: FnOnce(&pprof::Report) -> Result<Vec<u8>> + Send + 'static,
    {
        let seconds = q.seconds.unwrap_or(30);
        let sampled = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let guard = pprof::ProfilerGuardBuilder::default()
                .frequency(100)
                .build()
                .map_err(|e| anyhow!("starting profiler: {e}"))?;
            std::thread::sleep(std::time::Duration::from_secs(seconds));
            let report = guard
                .report()
                .build()
                .map_err(|e| anyhow!("collecting profile: {e}"))?;
            encode(&report)
        })
        .await;

        match sampled {
            Ok(Ok(body)) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
                .into_response(),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "profiling request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
            Err(e) => {
                tracing::error!(error = %e, "profiling task panicked");
                (StatusCode::INTERNAL_SERVER_ERROR, "task failed").into_response()
            }
        }
    }
}
