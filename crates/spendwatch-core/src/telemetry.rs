//! Logging setup and Prometheus metrics

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::models::{Severity, WindowKind};

/// Events handled, labelled by outcome
pub const EVENTS_TOTAL: &str = "spendwatch_events_total";
/// Alerts emitted, labelled by kind and severity
pub const ALERTS_TOTAL: &str = "spendwatch_alerts_total";
/// Failed channel deliveries
pub const NOTIFICATION_FAILURES_TOTAL: &str = "spendwatch_notification_failures_total";
/// Current spend of each window kind
pub const WINDOW_SPEND: &str = "spendwatch_window_spend";
/// Running totals found out of step with the ledger
pub const RECONCILE_DRIFT_TOTAL: &str = "spendwatch_reconcile_drift_total";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spendwatch={default_level},tower_http=info")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Install the Prometheus recorder and return the handle used to render `/metrics`
pub fn install_prometheus() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install metrics recorder: {e}")))
}

/// Count a handled event by outcome (`accepted`, `duplicate`, `invalid`, `error`)
pub fn record_event(outcome: &'static str) {
    counter!(EVENTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Count an emitted alert
pub fn record_alert(kind: &WindowKind, severity: Severity) {
    counter!(
        ALERTS_TOTAL,
        "kind" => kind.name().to_string(),
        "severity" => severity.as_str()
    )
    .increment(1);
}

/// Count a failed channel send
pub fn record_notification_failure(channel: &str) {
    counter!(NOTIFICATION_FAILURES_TOTAL, "channel" => channel.to_string()).increment(1);
}

/// Publish the current total of a window kind
pub fn record_window_spend(kind: &WindowKind, sum: Decimal) {
    gauge!(WINDOW_SPEND, "kind" => kind.name().to_string()).set(sum.to_f64().unwrap_or(0.0));
}

/// Count a running total that disagreed with the ledger
pub fn record_reconcile_drift(kind: &WindowKind) {
    counter!(RECONCILE_DRIFT_TOTAL, "kind" => kind.name().to_string()).increment(1);
}
