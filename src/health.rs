//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is this replica leading and reconciling?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::crd::{RelatedResources, ResourceKind, ResourcePhase};

/// Port the health server binds to
pub const HEALTH_PORT: u16 = 8080;

/// Labels for per-kind metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl prometheus_client::encoding::EncodeLabelSet for KindLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for reconciliation errors
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub kind: String,
    pub reason: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ErrorLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("reason", self.reason.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for resource phase metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub kind: String,
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<KindLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ErrorLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,
    /// SQL statements applied
    pub sql_operations_total: Family<KindLabels, Counter>,
    /// Managed resources by kind and phase
    pub resources: Family<PhaseLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "postgres_access_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "postgres_access_operator_reconciliation_errors",
            "Total number of reconciliation errors by reason",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "postgres_access_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let sql_operations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "postgres_access_operator_sql_operations",
            "Total number of SQL operations applied",
            sql_operations_total.clone(),
        );

        let resources = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "postgres_access_operator_resources",
            "Managed resources by kind and phase",
            resources.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            sql_operations_total,
            resources,
            registry,
        }
    }

    fn kind(kind: ResourceKind) -> KindLabels {
        KindLabels {
            kind: kind.as_str().to_string(),
        }
    }

    /// Record a finished reconciliation
    pub fn record_reconcile(&self, kind: ResourceKind, duration_secs: f64) {
        let labels = Self::kind(kind);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: ResourceKind, reason: &str) {
        let labels = ErrorLabels {
            kind: kind.as_str().to_string(),
            reason: reason.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    pub fn record_sql_operations(&self, kind: ResourceKind, count: usize) {
        if count == 0 {
            return;
        }
        self.sql_operations_total
            .get_or_create(&Self::kind(kind))
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Update resource counts by phase
    ///
    /// Every phase of every kind is written so a phase that empties out
    /// drops to zero.
    pub fn set_resources_by_phase(&self, related: &RelatedResources) {
        let mut counts: BTreeMap<(ResourceKind, ResourcePhase), i64> = BTreeMap::new();
        for kind in [ResourceKind::Role, ResourceKind::Database, ResourceKind::Grant] {
            for phase in ResourcePhase::ALL {
                counts.insert((kind, phase), 0);
            }
        }
        for resource in related.iter() {
            *counts.entry((resource.kind(), resource.phase())).or_default() += 1;
        }
        for ((kind, phase), count) in counts {
            let labels = PhaseLabels {
                kind: kind.as_str().to_string(),
                phase: phase.to_string(),
            };
            self.resources.get_or_create(&labels).set(count);
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leading and running controllers)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Unix time of the last finished reconcile
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self, unix_secs: u64) {
        self.last_reconcile.store(unix_secs, Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until leadership is acquired.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on [`HEALTH_PORT`]
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(("0.0.0.0", HEALTH_PORT)).await?;
    tracing::info!(port = HEALTH_PORT, "Health server listening");

    axum::serve(listener, app).await
}
