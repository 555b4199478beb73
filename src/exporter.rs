//! # Prometheus Exporter
//!
//! A small HTTP server exposing `GET /metrics` in the Prometheus text
//! format, plus the background task that reconciles the router's metrics
//! into the exported series once per second.
//!
//! Every exporter owns its own [`prometheus::Registry`]; nothing is
//! registered globally, so multiple routers in one process stay independent.
//!
//! The latency histogram is observed directly from the per-attempt path.
//! The counters are reconciled by diffing each provider's snapshot against
//! the last exported totals and incrementing by the delta, which keeps them
//! monotonic and equal to the engine's counters at every refresh.

use crate::error::RouterError;
use crate::metrics::{MetricsSnapshot, ProviderMetrics};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Content type of the `/metrics` response (text format v0.0.4).
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

const LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

fn exporter_error(e: prometheus::Error) -> RouterError {
    RouterError::Exporter {
        message: e.to_string(),
    }
}

/// The exported series and the registry that owns them.
pub(crate) struct ExporterMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    latency_seconds: HistogramVec,
    tokens_total: IntCounterVec,
    cost_total: CounterVec,
    provider_health: GaugeVec,
}

impl ExporterMetrics {
    pub(crate) fn new() -> Result<Self, RouterError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("llm_requests_total", "Requests per provider and outcome."),
            &["provider", "status"],
        )
        .map_err(exporter_error)?;
        let latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "llm_request_latency_seconds",
                "Per-attempt latency in seconds.",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider"],
        )
        .map_err(exporter_error)?;
        let tokens_total = IntCounterVec::new(
            Opts::new("llm_tokens_total", "Tokens processed per provider and type."),
            &["provider", "type"],
        )
        .map_err(exporter_error)?;
        let cost_total = CounterVec::new(
            Opts::new("llm_cost_total", "Accumulated cost per provider, in rubles."),
            &["provider"],
        )
        .map_err(exporter_error)?;
        let provider_health = GaugeVec::new(
            Opts::new(
                "llm_provider_health",
                "Derived provider health: 1 healthy, 0.5 degraded, 0 unhealthy.",
            ),
            &["provider"],
        )
        .map_err(exporter_error)?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(latency_seconds.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(tokens_total.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(cost_total.clone()))
            .map_err(exporter_error)?;
        registry
            .register(Box::new(provider_health.clone()))
            .map_err(exporter_error)?;

        Ok(Self {
            registry,
            requests_total,
            latency_seconds,
            tokens_total,
            cost_total,
            provider_health,
        })
    }

    /// Observe one attempt's latency; called from the request path.
    pub(crate) fn observe_latency(&self, provider: &str, seconds: f64) {
        self.latency_seconds
            .with_label_values(&[provider])
            .observe(seconds);
    }

    /// Materialize every series for a provider so scrapes show zeros before
    /// the first request.
    fn touch(&self, provider: &str) {
        self.requests_total
            .with_label_values(&[provider, "success"]);
        self.requests_total
            .with_label_values(&[provider, "failure"]);
        self.tokens_total.with_label_values(&[provider, "prompt"]);
        self.tokens_total
            .with_label_values(&[provider, "completion"]);
        self.cost_total.with_label_values(&[provider]);
        self.provider_health.with_label_values(&[provider]);
    }

    fn publish(&self, provider: &str, snapshot: &MetricsSnapshot, last: &mut ExportedTotals) {
        let success = snapshot.success.saturating_sub(last.success);
        if success > 0 {
            self.requests_total
                .with_label_values(&[provider, "success"])
                .inc_by(success);
        }
        let failure = snapshot.failure.saturating_sub(last.failure);
        if failure > 0 {
            self.requests_total
                .with_label_values(&[provider, "failure"])
                .inc_by(failure);
        }
        let prompt = snapshot.prompt_tokens.saturating_sub(last.prompt_tokens);
        if prompt > 0 {
            self.tokens_total
                .with_label_values(&[provider, "prompt"])
                .inc_by(prompt);
        }
        let completion = snapshot
            .completion_tokens
            .saturating_sub(last.completion_tokens);
        if completion > 0 {
            self.tokens_total
                .with_label_values(&[provider, "completion"])
                .inc_by(completion);
        }
        let cost = snapshot.cost_rub - last.cost_rub;
        if cost > 0.0 {
            self.cost_total.with_label_values(&[provider]).inc_by(cost);
        }
        self.provider_health
            .with_label_values(&[provider])
            .set(snapshot.health.gauge_value());

        *last = ExportedTotals::from(snapshot);
    }

    /// Render the registry in the Prometheus text format.
    pub(crate) fn encode(&self) -> Result<String, RouterError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(exporter_error)?;
        String::from_utf8(buffer).map_err(|e| RouterError::Exporter {
            message: format!("metrics are not valid UTF-8: {e}"),
        })
    }
}

#[derive(Default, Clone, Copy)]
struct ExportedTotals {
    success: u64,
    failure: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    cost_rub: f64,
}

impl From<&MetricsSnapshot> for ExportedTotals {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            success: snapshot.success,
            failure: snapshot.failure,
            prompt_tokens: snapshot.prompt_tokens,
            completion_tokens: snapshot.completion_tokens,
            cost_rub: snapshot.cost_rub,
        }
    }
}

/// Bind the exporter's listener, mapping an occupied port onto the typed
/// error so callers can pick another one.
pub(crate) async fn bind(port: u16) -> Result<TcpListener, RouterError> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(RouterError::MetricsPortInUse { port })
        }
        Err(e) => Err(RouterError::Exporter {
            message: format!("failed to bind metrics listener: {e}"),
        }),
    }
}

/// Spawn the once-per-second reconciliation task.
pub(crate) fn spawn_refresher(
    metrics: Arc<ExporterMetrics>,
    providers: Vec<(String, Arc<ProviderMetrics>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for (name, _) in &providers {
            metrics.touch(name);
        }
        let mut exported: HashMap<String, ExportedTotals> = HashMap::new();
        let mut ticks = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            ticks.tick().await;
            for (name, record) in &providers {
                let snapshot = record.snapshot();
                let last = exported.entry(name.clone()).or_default();
                metrics.publish(name, &snapshot, last);
            }
        }
    })
}

/// Spawn the HTTP server; the returned sender triggers graceful shutdown.
pub(crate) fn spawn_server(
    listener: TcpListener,
    metrics: Arc<ExporterMetrics>,
) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(metrics);
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "metrics server terminated unexpectedly");
        }
    });
    (handle, shutdown_tx)
}

async fn metrics_handler(State(metrics): State<Arc<ExporterMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Running exporter state held by the router.
pub(crate) struct ExporterHandle {
    pub(crate) addr: SocketAddr,
    pub(crate) refresher: JoinHandle<()>,
    pub(crate) server: JoinHandle<()>,
    pub(crate) shutdown: oneshot::Sender<()>,
}
