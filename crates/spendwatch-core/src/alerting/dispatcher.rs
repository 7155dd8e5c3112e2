//! Alert dispatch
//!
//! [`AlertDispatcher::maybe_notify`] is the suppression policy: one notification
//! per severity level per window instance, reset on rollover. It is pure so the
//! monitor can apply it under the per-kind lock. [`AlertDispatcher::deliver`]
//! does the sending and runs after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::notifier::{NotificationChannel, NotificationError};
use crate::models::{AlertNotification, AlertState, DeliveryResult, Severity, WindowTotal};

/// Decides which threshold crossings become notifications and delivers them
#[derive(Clone)]
pub struct AlertDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    send_timeout: Duration,
    approaching_cooldown: Duration,
}

impl AlertDispatcher {
    /// Create a dispatcher over a set of channels
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, send_timeout: Duration) -> Self {
        Self {
            channels,
            send_timeout,
            approaching_cooldown: Duration::ZERO,
        }
    }

    /// Suppress approaching notifications sent less than `cooldown` after the
    /// previous notification of the same kind
    pub fn with_approaching_cooldown(mut self, cooldown: Duration) -> Self {
        self.approaching_cooldown = cooldown;
        self
    }

    /// Names of the configured channels
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Apply the suppression rules for one evaluation.
    ///
    /// Returns the next alert state and the notification to send, if any.
    /// Evaluations of a window instance older than the one in `state` leave
    /// the state untouched and never notify.
    pub fn maybe_notify(
        &self,
        severity: Severity,
        total: &WindowTotal,
        limit: Decimal,
        state: &AlertState,
        now: DateTime<Utc>,
    ) -> (AlertState, Option<AlertNotification>) {
        let state = match state.window_start {
            Some(start) if total.window_start < start => {
                debug!(kind = %total.kind, "Ignoring evaluation of a past window instance");
                return (state.clone(), None);
            }
            Some(start) if total.window_start == start => state.clone(),
            _ => state.rolled_over(total.window_start),
        };

        if severity <= state.last_alert_level {
            return (state, None);
        }

        if severity == Severity::Approaching && self.in_cooldown(&state, now) {
            debug!(kind = %total.kind, "Approaching alert suppressed by cooldown");
            return (
                AlertState {
                    last_alert_level: severity,
                    ..state
                },
                None,
            );
        }

        let notification = AlertNotification::from_total(total, severity, limit, now);
        let next = AlertState {
            window_start: Some(total.window_start),
            last_alert_level: severity,
            last_alert_time: Some(now),
        };

        (next, Some(notification))
    }

    fn in_cooldown(&self, state: &AlertState, now: DateTime<Utc>) -> bool {
        if self.approaching_cooldown.is_zero() {
            return false;
        }
        let Some(last) = state.last_alert_time else {
            return false;
        };
        match chrono::Duration::from_std(self.approaching_cooldown) {
            Ok(cooldown) => now < last + cooldown,
            Err(_) => true,
        }
    }

    /// Send an alert to every channel concurrently, each bounded by the send
    /// timeout. Failures are reported, never retried.
    pub async fn deliver(&self, alert: &AlertNotification) -> Vec<DeliveryResult> {
        info!(
            kind = %alert.kind,
            severity = %alert.severity,
            sum_cost = %alert.sum_cost,
            limit = %alert.limit,
            "{}",
            alert.message()
        );

        let sends = self.channels.iter().map(|channel| async move {
            let sent_at = Utc::now();
            let result = match tokio::time::timeout(self.send_timeout, channel.send(alert)).await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout(self.send_timeout)),
            };

            if let Err(e) = &result {
                warn!(channel = channel.name(), kind = %alert.kind, error = %e, "Failed to send notification");
                crate::telemetry::record_notification_failure(channel.name());
            }

            DeliveryResult {
                channel: channel.name().to_string(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                sent_at,
            }
        });

        join_all(sends).await
    }
}
