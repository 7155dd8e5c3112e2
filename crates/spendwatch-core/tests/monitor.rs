//! End-to-end behavior of the monitor controller over the in-memory ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rust_decimal::Decimal;

use spendwatch::alerting::NotificationError;
use spendwatch::monitor::MAX_SUMMARY_HOURS;
use spendwatch::prelude::*;

/// Remembers every notification it is handed
#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<AlertNotification>>,
    fail: AtomicBool,
}

impl RecordingChannel {
    fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn severities(&self) -> Vec<Severity> {
        self.sent.lock().unwrap().iter().map(|n| n.severity).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &AlertNotification) -> std::result::Result<(), NotificationError> {
        self.sent.lock().unwrap().push(alert.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::HttpError("connection refused".to_string()));
        }
        Ok(())
    }
}

/// In-memory ledger that can be taken offline
#[derive(Default)]
struct FlakyLedger {
    inner: InMemoryLedger,
    down: AtomicBool,
}

impl FlakyLedger {
    fn check(&self) -> spendwatch::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::ledger("connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn insert_if_absent(&self, event: &EventRecord) -> spendwatch::Result<bool> {
        self.check()?;
        self.inner.insert_if_absent(event).await
    }

    async fn contains(&self, id: &str) -> spendwatch::Result<bool> {
        self.check()?;
        self.inner.contains(id).await
    }

    async fn sum_cost_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> spendwatch::Result<Decimal> {
        self.check()?;
        self.inner.sum_cost_in_range(start, end).await
    }

    async fn iterate_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> spendwatch::Result<Vec<EventRecord>> {
        self.check()?;
        self.inner.iterate_range(start, end).await
    }
}

fn dollars(n: i64) -> Decimal {
    Decimal::from(n)
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
}

fn event(id: &str, h: u32, m: u32, cost: i64) -> IncomingEvent {
    IncomingEvent::new(id, Some(at(h, m).to_rfc3339()), dollars(cost))
}

fn hourly_limit(limit: i64) -> Vec<WindowDefinition> {
    vec![WindowDefinition::new(WindowKind::Hourly, Some(dollars(limit)))]
}

fn monitor_with(
    ledger: Arc<dyn Ledger>,
    channel: Arc<RecordingChannel>,
    definitions: Vec<WindowDefinition>,
) -> MonitorController {
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![channel];
    let dispatcher = AlertDispatcher::new(channels, Duration::from_secs(1));
    MonitorController::new(definitions, ledger, ThresholdEvaluator::default(), dispatcher)
}

fn monitor(channel: Arc<RecordingChannel>) -> MonitorController {
    monitor_with(Arc::new(InMemoryLedger::new()), channel, hourly_limit(10))
}

fn hourly_sum(result: &AcceptanceResult) -> Decimal {
    result.total(&WindowKind::Hourly).unwrap().sum_cost
}

#[tokio::test]
async fn test_crossing_thresholds_notifies_once_per_level() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel.clone());

    let mut seen = Vec::new();
    for (i, minute) in [5, 20, 35].into_iter().enumerate() {
        let result = monitor
            .handle_event(event(&format!("req-{i}"), 14, minute, 3))
            .await
            .unwrap();
        assert!(result.is_accepted());
        seen.push(monitor.severity_of(result.total(&WindowKind::Hourly).unwrap()));
    }

    assert_eq!(
        seen,
        vec![Some(Severity::Ok), Some(Severity::Ok), Some(Severity::Approaching)]
    );
    assert_eq!(channel.severities(), vec![Severity::Approaching]);

    let result = monitor.handle_event(event("req-3", 14, 50, 2)).await.unwrap();
    assert_eq!(hourly_sum(&result), dollars(11));
    assert_eq!(result.alerts.len(), 1);
    assert_eq!(result.alerts[0].notification.severity, Severity::Exceeded);
    assert_eq!(result.alerts[0].notification.limit, dollars(10));

    // already exceeded: more spending stays quiet
    let result = monitor.handle_event(event("req-4", 14, 55, 1)).await.unwrap();
    assert!(result.alerts.is_empty());
    assert_eq!(channel.severities(), vec![Severity::Approaching, Severity::Exceeded]);
}

#[tokio::test]
async fn test_duplicate_event_counted_once() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel);

    let first = monitor.handle_event(event("req-1", 14, 5, 3)).await.unwrap();
    let second = monitor.handle_event(event("req-1", 14, 6, 3)).await.unwrap();

    assert_eq!(first.outcome, AcceptanceOutcome::Accepted);
    assert_eq!(second.outcome, AcceptanceOutcome::Duplicate);
    assert!(second.totals.is_empty());

    let third = monitor.handle_event(event("req-2", 14, 7, 1)).await.unwrap();
    assert_eq!(hourly_sum(&third), dollars(4));
    assert_eq!(third.total(&WindowKind::Hourly).unwrap().event_count, 2);
}

#[tokio::test]
async fn test_invalid_event_rejected_without_side_effects() {
    let ledger = Arc::new(InMemoryLedger::new());
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor_with(ledger.clone(), channel, hourly_limit(10));

    let result = monitor.handle_event(event("req-1", 14, 5, -1)).await.unwrap();

    assert!(matches!(result.outcome, AcceptanceOutcome::Invalid { .. }));
    assert!(ledger.is_empty().await);

    let bad_time = IncomingEvent::new("req-2", Some("not a time".to_string()), dollars(1));
    let result = monitor.handle_event(bad_time).await.unwrap();
    assert!(
        matches!(&result.outcome, AcceptanceOutcome::Invalid { reason } if reason.contains("not a time"))
    );
}

#[tokio::test]
async fn test_new_window_resets_alert_state() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel.clone());

    let result = monitor.handle_event(event("req-1", 14, 30, 11)).await.unwrap();
    assert_eq!(result.alerts[0].notification.severity, Severity::Exceeded);

    let result = monitor.handle_event(event("req-2", 15, 10, 9)).await.unwrap();
    let total = result.total(&WindowKind::Hourly).unwrap();
    assert_eq!(total.window_start, at(15, 0));
    assert_eq!(total.sum_cost, dollars(9));
    assert_eq!(result.alerts.len(), 1);
    assert_eq!(result.alerts[0].notification.severity, Severity::Approaching);
    assert_eq!(result.alerts[0].notification.window_start, at(15, 0));
}

#[tokio::test]
async fn test_late_breach_alerts_once_for_its_own_window() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel.clone());

    monitor.handle_event(event("req-1", 14, 10, 1)).await.unwrap();

    // a skewed clock moves the running window to 15:00
    let ahead = IncomingEvent::new("req-2", Some(at(15, 1).to_rfc3339()), Decimal::new(1, 2));
    monitor.handle_event(ahead).await.unwrap();

    let late = monitor.handle_event(event("req-3", 14, 20, 12)).await.unwrap();
    assert!(late.is_accepted());
    assert_eq!(late.alerts.len(), 1);

    let alert = &late.alerts[0].notification;
    assert_eq!(alert.severity, Severity::Exceeded);
    assert_eq!(alert.window_start, at(14, 0));
    assert_eq!(alert.sum_cost, dollars(13));

    let total = late.total(&WindowKind::Hourly).unwrap();
    assert_eq!(total.window_start, at(14, 0));
    assert_eq!(total.sum_cost, dollars(13));

    // the 14:00 window already reported its highest level
    let again = monitor.handle_event(event("req-4", 14, 30, 2)).await.unwrap();
    assert!(again.alerts.is_empty());
    assert_eq!(again.total(&WindowKind::Hourly).unwrap().sum_cost, dollars(15));

    // the running window is untouched
    let next = monitor.handle_event(event("req-5", 15, 20, 1)).await.unwrap();
    assert_eq!(hourly_sum(&next), Decimal::new(101, 2));
    assert!(next.alerts.is_empty());
    assert_eq!(channel.severities(), vec![Severity::Exceeded]);
}

#[tokio::test]
async fn test_late_event_below_notified_level_stays_quiet() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel.clone());

    monitor.handle_event(event("req-1", 14, 10, 9)).await.unwrap();
    monitor.handle_event(event("req-2", 15, 10, 1)).await.unwrap();
    assert_eq!(channel.severities(), vec![Severity::Approaching]);

    let late = monitor.handle_event(event("req-3", 14, 50, 0)).await.unwrap();
    assert!(late.alerts.is_empty());

    let late = monitor.handle_event(event("req-4", 14, 55, 2)).await.unwrap();
    assert_eq!(late.alerts.len(), 1);
    assert_eq!(channel.severities(), vec![Severity::Approaching, Severity::Exceeded]);
}

#[tokio::test]
async fn test_late_event_after_restart_uses_alert_log() {
    let store = Arc::new(InMemoryLedger::new());

    let first = Arc::new(RecordingChannel::default());
    let before = monitor_with(store.clone(), first.clone(), hourly_limit(10)).with_alert_log(store.clone());
    before.handle_event(event("req-1", 14, 10, 11)).await.unwrap();
    assert_eq!(first.severities(), vec![Severity::Exceeded]);
    drop(before);

    let second = Arc::new(RecordingChannel::default());
    let after = monitor_with(store.clone(), second.clone(), hourly_limit(10)).with_alert_log(store.clone());
    after.restore(at(15, 5)).await.unwrap();

    let late = after.handle_event(event("req-2", 14, 40, 3)).await.unwrap();
    assert!(late.alerts.is_empty());
    assert_eq!(late.total(&WindowKind::Hourly).unwrap().sum_cost, dollars(14));
    assert!(second.severities().is_empty());
}

#[tokio::test]
async fn test_every_window_kind_updated() {
    let channel = Arc::new(RecordingChannel::default());
    let definitions = vec![
        WindowDefinition::new(WindowKind::Hourly, Some(dollars(10))),
        WindowDefinition::new(WindowKind::Daily, Some(dollars(15))),
        WindowDefinition::new(WindowKind::Monthly, None),
        WindowDefinition::new(
            WindowKind::custom("burst", Duration::from_secs(900)),
            Some(dollars(4)),
        ),
    ];
    let monitor = monitor_with(Arc::new(InMemoryLedger::new()), channel.clone(), definitions);

    monitor.handle_event(event("req-1", 9, 5, 6)).await.unwrap();
    let result = monitor.handle_event(event("req-2", 14, 5, 7)).await.unwrap();

    assert_eq!(result.totals.len(), 4);
    assert_eq!(hourly_sum(&result), dollars(7));
    assert_eq!(result.total(&WindowKind::Daily).unwrap().sum_cost, dollars(13));
    assert_eq!(result.total(&WindowKind::Monthly).unwrap().sum_cost, dollars(13));

    let burst = monitor.find_kind("BURST").cloned().unwrap();
    let burst_total = result.total(&burst).unwrap();
    assert_eq!(burst_total.window_start, at(14, 0));
    assert_eq!(burst_total.sum_cost, dollars(7));

    let mut alerted: Vec<(String, Severity)> = result
        .alerts
        .iter()
        .map(|a| (a.notification.kind.name().to_string(), a.notification.severity))
        .collect();
    alerted.sort();
    assert_eq!(
        alerted,
        vec![
            ("burst".to_string(), Severity::Exceeded),
            ("daily".to_string(), Severity::Approaching),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_events_notify_once_per_level() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = Arc::new(monitor(channel.clone()));

    monitor.handle_event(event("seed", 14, 0, 0)).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .handle_event(event(&format!("req-{i}"), 14, 10 + i, 1))
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_accepted());
    }

    let mut severities = channel.severities();
    severities.sort();
    assert_eq!(severities, vec![Severity::Approaching, Severity::Exceeded]);

    let totals = monitor.totals_at(at(14, 30)).await.unwrap();
    assert_eq!(totals[0].sum_cost, dollars(10));
    assert_eq!(totals[0].event_count, 11);
}

#[tokio::test]
async fn test_failed_delivery_reported_and_not_retried() {
    let channel = Arc::new(RecordingChannel::failing());
    let monitor = monitor(channel.clone());

    let result = monitor.handle_event(event("req-1", 14, 5, 9)).await.unwrap();
    assert!(result.is_accepted());
    assert_eq!(result.alerts.len(), 1);

    let delivery = &result.alerts[0].deliveries[0];
    assert_eq!(delivery.channel, "recording");
    assert!(!delivery.success);
    assert!(delivery.error.as_deref().unwrap().contains("connection refused"));

    let result = monitor.handle_event(event("req-2", 14, 6, 0)).await.unwrap();
    assert!(result.alerts.is_empty());
    assert_eq!(channel.severities(), vec![Severity::Approaching]);
}

#[tokio::test]
async fn test_ledger_outage_surfaces_and_recovers() {
    let ledger = Arc::new(FlakyLedger::default());
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor_with(ledger.clone(), channel, hourly_limit(10));

    monitor.handle_event(event("req-1", 14, 5, 2)).await.unwrap();

    ledger.down.store(true, Ordering::SeqCst);
    let err = monitor.handle_event(event("req-2", 14, 6, 2)).await.unwrap_err();
    assert!(matches!(err, Error::LedgerUnavailable(_)));
    assert!(monitor.totals_at(at(14, 30)).await.is_err());

    ledger.down.store(false, Ordering::SeqCst);
    let result = monitor.handle_event(event("req-2", 14, 6, 2)).await.unwrap();
    assert!(result.is_accepted());
    assert_eq!(hourly_sum(&result), dollars(4));
}

#[tokio::test]
async fn test_restore_does_not_renotify() {
    let store = Arc::new(InMemoryLedger::new());
    let now = at(14, 40);

    let first = Arc::new(RecordingChannel::default());
    let before = monitor_with(store.clone(), first.clone(), hourly_limit(10)).with_alert_log(store.clone());
    before.handle_event(event("req-1", 14, 5, 9)).await.unwrap();
    assert_eq!(first.severities(), vec![Severity::Approaching]);
    drop(before);

    let second = Arc::new(RecordingChannel::default());
    let after = monitor_with(store.clone(), second.clone(), hourly_limit(10)).with_alert_log(store.clone());
    after.restore(now).await.unwrap();

    let result = after.handle_event(event("req-2", 14, 45, 0)).await.unwrap();
    assert_eq!(hourly_sum(&result), dollars(9));
    assert!(result.alerts.is_empty());

    let result = after.handle_event(event("req-3", 14, 50, 1)).await.unwrap();
    assert_eq!(hourly_sum(&result), dollars(10));
    assert_eq!(second.severities(), vec![Severity::Exceeded]);
    assert_eq!(store.alerts().await.len(), 2);
}

#[tokio::test]
async fn test_restore_without_alert_log_uses_current_severity() {
    let store = Arc::new(InMemoryLedger::new());

    let channel = Arc::new(RecordingChannel::default());
    let first = monitor_with(store.clone(), channel.clone(), hourly_limit(10));
    first.handle_event(event("req-1", 14, 5, 8)).await.unwrap();

    let channel = Arc::new(RecordingChannel::default());
    let restarted = monitor_with(store, channel.clone(), hourly_limit(10));
    restarted.restore(at(14, 30)).await.unwrap();
    restarted.handle_event(event("req-2", 14, 35, 1)).await.unwrap();

    assert!(channel.severities().is_empty());
}

#[tokio::test]
async fn test_reconcile_reports_drift() {
    let store = Arc::new(InMemoryLedger::new());
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor_with(store.clone(), channel, hourly_limit(100));

    monitor.handle_event(event("req-1", 14, 5, 3)).await.unwrap();
    assert_eq!(monitor.reconcile().await.unwrap(), 0);

    // written behind the monitor's back
    store
        .insert_if_absent(&EventRecord::new("external", at(14, 10), dollars(4)))
        .await
        .unwrap();
    assert_eq!(monitor.reconcile().await.unwrap(), 1);

    let result = monitor.handle_event(event("req-2", 14, 20, 1)).await.unwrap();
    assert_eq!(hourly_sum(&result), dollars(8));
}

#[tokio::test]
async fn test_spending_summary_covers_trailing_hours() {
    let channel = Arc::new(RecordingChannel::default());
    let monitor = monitor(channel);
    let now = Utc::now();

    for (id, minutes_ago, cost) in [("a", 10, 2), ("b", 90, 3), ("c", 60 * 30, 50)] {
        let ts = now - chrono::Duration::minutes(minutes_ago);
        monitor
            .handle_event(IncomingEvent::new(id, Some(ts.to_rfc3339()), dollars(cost)))
            .await
            .unwrap();
    }

    let summary = monitor.spending_summary(24).await.unwrap();
    assert_eq!(summary.total_requests, 2);
    assert_eq!(summary.total_cost, dollars(5));
    assert_eq!(summary.hours_analyzed, 24);
}

#[tokio::test]
async fn test_spending_summary_rejects_unbounded_hours() {
    let monitor = monitor(Arc::new(RecordingChannel::default()));

    let err = monitor.spending_summary(u32::MAX).await.unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));

    let summary = monitor.spending_summary(MAX_SUMMARY_HOURS).await.unwrap();
    assert_eq!(summary.total_requests, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_window_totals_match_ledger(
        events in prop::collection::vec((0u32..3, 0u32..60, 0i64..500), 1..40)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let channel = Arc::new(RecordingChannel::default());
            let monitor = monitor_with(
                Arc::new(InMemoryLedger::new()),
                channel.clone(),
                vec![WindowDefinition::new(WindowKind::Hourly, Some(dollars(50)))],
            );

            let mut last_sum: Option<(DateTime<Utc>, Decimal)> = None;
            for (i, (h, m, cents)) in events.iter().enumerate() {
                let incoming = IncomingEvent::new(
                    format!("req-{i}"),
                    Some(at(10 + h, *m).to_rfc3339()),
                    Decimal::new(*cents, 2),
                );
                let result = monitor.handle_event(incoming).await.unwrap();
                let total = result.total(&WindowKind::Hourly).unwrap().clone();

                let expected: Decimal = events[..=i]
                    .iter()
                    .filter(|(eh, _, _)| eh == h)
                    .map(|(_, _, c)| Decimal::new(*c, 2))
                    .sum();
                prop_assert_eq!(total.sum_cost, expected);
                prop_assert_eq!(total.window_start, at(10 + h, 0));

                if let Some((start, sum)) = last_sum {
                    if start == total.window_start {
                        prop_assert!(total.sum_cost >= sum);
                    }
                }
                last_sum = Some((total.window_start, total.sum_cost));
            }

            // each level is reported at most once per window instance
            let sent = channel.sent.lock().unwrap().clone();
            let mut seen = std::collections::HashSet::new();
            for alert in &sent {
                prop_assert!(seen.insert((alert.window_start, alert.severity)));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
