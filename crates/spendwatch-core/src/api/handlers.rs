//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::signature::{verify_signature, SIGNATURE_HEADER};
use crate::collector::{PriceTable, WebhookPayload};
use crate::error::Error;
use crate::models::{Severity, SpendingSummary, WindowDefinition, WindowTotal};
use crate::monitor::{AcceptanceOutcome, MonitorController};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Event pipeline and window state
    pub monitor: Arc<MonitorController>,
    /// Webhook HMAC secret; `None` disables signature checks
    pub webhook_secret: Option<Arc<str>>,
    /// Used to price webhooks that carry no cost
    pub prices: Option<Arc<PriceTable>>,
    /// Prometheus recorder; `None` answers `/metrics` with 404
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// State with signature checks, cost estimation and metrics disabled
    pub fn new(monitor: Arc<MonitorController>) -> Self {
        Self {
            monitor,
            webhook_secret: None,
            prices: None,
            metrics: None,
        }
    }
}

type ApiError = (StatusCode, String);

/// Map a crate error onto an HTTP status
fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::InvalidEvent(_) | Error::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// healthy or unhealthy
    pub status: String,
    /// Crate version
    pub version: String,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint; unhealthy when the ledger is unreachable
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match state.monitor.ledger().health_check().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }),
    )
}

/// Service description
#[derive(Serialize)]
pub struct RootResponse {
    /// Service name
    pub service: String,
    /// Crate version
    pub version: String,
    /// Always running
    pub status: String,
    /// Tracked window kinds and limits
    pub windows: Vec<WindowDefinition>,
    /// Served routes
    pub endpoints: Vec<&'static str>,
}

/// Root endpoint with basic info
pub async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        service: "spendwatch".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
        windows: state.monitor.definitions(),
        endpoints: vec![
            "POST /webhook",
            "GET /health",
            "GET /spending-summary",
            "GET /api/v1/totals",
            "GET /api/v1/totals/:kind",
            "GET /metrics",
        ],
    })
}

/// Webhook response
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// accepted, duplicate, invalid or skipped
    pub status: String,
    /// Human readable detail
    pub message: String,
    /// Post-update totals, empty unless accepted
    #[serde(default)]
    pub totals: Vec<WindowTotal>,
    /// Number of alerts this event raised
    #[serde(default)]
    pub alerts: usize,
}

impl WebhookResponse {
    fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
            totals: Vec::new(),
            alerts: 0,
        }
    }
}

/// Receive a cost webhook
pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match handle_webhook(&state, &headers, &body).await {
        Ok(response) => response,
        Err((status, message)) => (status, Json(WebhookResponse::new("error", message))).into_response(),
    }
}

async fn handle_webhook(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response, ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !verify_signature(secret, body, signature) {
            warn!("Invalid webhook signature");
            return Err(api_error(Error::Unauthorized("Invalid signature".to_string())));
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}")))?;

    let event = match payload.into_event(state.prices.as_deref()) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!("No cost data in webhook, skipping");
            let response = WebhookResponse::new("skipped", "No cost data in webhook");
            return Ok((StatusCode::OK, Json(response)).into_response());
        }
        Err(e) => {
            warn!(error = %e, "Rejected webhook");
            crate::telemetry::record_event("invalid");
            let response = WebhookResponse::new("invalid", e.to_string());
            return Ok((StatusCode::BAD_REQUEST, Json(response)).into_response());
        }
    };

    let result = state.monitor.handle_event(event).await.map_err(api_error)?;

    let (code, message) = match &result.outcome {
        AcceptanceOutcome::Accepted => (StatusCode::OK, "Webhook processed successfully".to_string()),
        AcceptanceOutcome::Duplicate => (StatusCode::OK, "Request already processed".to_string()),
        AcceptanceOutcome::Invalid { reason } => (StatusCode::BAD_REQUEST, reason.clone()),
    };

    let response = WebhookResponse {
        status: result.outcome.as_str().to_string(),
        message,
        alerts: result.alerts.len(),
        totals: result.totals,
    };

    Ok((code, Json(response)).into_response())
}

/// Query parameters for the spending summary
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    /// Trailing hours to cover, 24 when absent
    pub hours: Option<u32>,
}

/// Spending summary response
#[derive(Serialize)]
pub struct SummaryResponse {
    /// Always success
    pub status: String,
    /// The summary itself
    pub data: SpendingSummary,
    /// Configured hourly limit, if any
    pub hourly_limit: Option<Decimal>,
    /// Tracked window kinds and limits
    pub windows: Vec<WindowDefinition>,
}

/// Spending over the last N hours (default 24)
pub async fn spending_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let hours = query.hours.unwrap_or(24);
    let data = state.monitor.spending_summary(hours).await.map_err(api_error)?;

    Ok(Json(SummaryResponse {
        status: "success".to_string(),
        data,
        hourly_limit: state.monitor.limit_of(&crate::models::WindowKind::Hourly),
        windows: state.monitor.definitions(),
    }))
}

/// A window total with its limit and classification
#[derive(Debug, Serialize, Deserialize)]
pub struct TotalView {
    /// Current total
    #[serde(flatten)]
    pub total: WindowTotal,
    /// Limit of the kind, `None` when unlimited
    pub limit: Option<Decimal>,
    /// Classification against the limit
    pub severity: Option<Severity>,
}

impl TotalView {
    fn new(state: &AppState, total: WindowTotal) -> Self {
        Self {
            limit: state.monitor.limit_of(&total.kind),
            severity: state.monitor.severity_of(&total),
            total,
        }
    }
}

/// Current totals of every tracked window kind
pub async fn list_totals(State(state): State<AppState>) -> Result<Json<Vec<TotalView>>, ApiError> {
    let totals = state.monitor.all_current_totals().await.map_err(api_error)?;
    Ok(Json(totals.into_iter().map(|t| TotalView::new(&state, t)).collect()))
}

/// Current total of one window kind
pub async fn get_total(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<TotalView>, ApiError> {
    let kind = state
        .monitor
        .find_kind(&kind)
        .cloned()
        .ok_or_else(|| api_error(Error::not_found("Window kind", kind)))?;

    let total = state.monitor.current_totals(&kind).await.map_err(api_error)?;
    Ok(Json(TotalView::new(&state, total)))
}

/// Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or((StatusCode::NOT_FOUND, "Metrics not enabled".to_string()))
}
