//! Monitor controller
//!
//! Single entry point for accepted cost events. Each tracked window kind owns a
//! slot holding its running total and alert state behind a `tokio::sync::Mutex`;
//! every mutation of either goes through that lock. Notifications are decided
//! under the lock and sent after it is released.
//!
//! An event older than the running window is evaluated against the level its
//! own window last reached, so a late breach is still reported once without
//! disturbing the running window's state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerting::{channels_from_config, AlertDispatcher, ThresholdEvaluator};
use crate::collector::{RunningTotal, WindowAggregator};
use crate::config::Config;
use crate::db::{AlertLog, Ledger, Stores};
use crate::error::{Error, Result};
use crate::models::{
    AlertNotification, AlertRecord, AlertState, EventRecord, IncomingEvent, Severity,
    SpendingSummary, WindowBounds, WindowDefinition, WindowKind, WindowTotal,
};
use crate::telemetry;

/// Longest trailing period a spending summary may cover (ten years)
pub const MAX_SUMMARY_HOURS: u32 = 10 * 366 * 24;

/// How an event was handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcceptanceOutcome {
    /// Persisted and aggregated
    Accepted,
    /// An event with the same id was already accepted
    Duplicate,
    /// Rejected by validation; nothing was stored
    Invalid {
        /// Why validation failed
        reason: String,
    },
}

impl AcceptanceOutcome {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Invalid { .. } => "invalid",
        }
    }
}

/// Result of [`MonitorController::handle_event`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceResult {
    /// Outcome
    #[serde(flatten)]
    pub outcome: AcceptanceOutcome,
    /// Post-update total of every tracked kind, for the window containing the
    /// event. Empty unless accepted.
    pub totals: Vec<WindowTotal>,
    /// Alerts emitted by this event, with their delivery results
    pub alerts: Vec<AlertRecord>,
}

impl AcceptanceResult {
    fn rejected(outcome: AcceptanceOutcome) -> Self {
        Self {
            outcome,
            totals: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Whether the event was persisted
    pub fn is_accepted(&self) -> bool {
        self.outcome == AcceptanceOutcome::Accepted
    }

    /// Total for one kind
    pub fn total(&self, kind: &WindowKind) -> Option<&WindowTotal> {
        self.totals.iter().find(|t| &t.kind == kind)
    }
}

/// Closed window instances per kind whose alert level is kept in memory
const PAST_WINDOWS_TRACKED: usize = 48;

/// Mutable per-kind state
#[derive(Debug, Default)]
struct SlotState {
    running: Option<RunningTotal>,
    alert: AlertState,
    /// Highest level reached by recent closed instances, by window start
    past: BTreeMap<DateTime<Utc>, Severity>,
}

impl SlotState {
    fn retire(&mut self, window_start: DateTime<Utc>, level: Severity) {
        let entry = self.past.entry(window_start).or_default();
        *entry = (*entry).max(level);
        while self.past.len() > PAST_WINDOWS_TRACKED {
            self.past.pop_first();
        }
    }
}

struct WindowSlot {
    definition: WindowDefinition,
    state: Mutex<SlotState>,
}

/// Orchestrates persistence, aggregation, evaluation and dispatch
pub struct MonitorController {
    ledger: Arc<dyn Ledger>,
    alert_log: Option<Arc<dyn AlertLog>>,
    aggregator: WindowAggregator,
    evaluator: ThresholdEvaluator,
    dispatcher: AlertDispatcher,
    slots: Vec<WindowSlot>,
}

impl MonitorController {
    /// Create a controller tracking `definitions`
    pub fn new(
        definitions: Vec<WindowDefinition>,
        ledger: Arc<dyn Ledger>,
        evaluator: ThresholdEvaluator,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let slots = definitions
            .into_iter()
            .map(|definition| WindowSlot {
                definition,
                state: Mutex::new(SlotState::default()),
            })
            .collect();

        Self {
            aggregator: WindowAggregator::new(ledger.clone()),
            ledger,
            alert_log: None,
            evaluator,
            dispatcher,
            slots,
        }
    }

    /// Record emitted alerts and restore alert levels from `log`
    pub fn with_alert_log(mut self, log: Arc<dyn AlertLog>) -> Self {
        self.alert_log = Some(log);
        self
    }

    /// Build a controller from configuration and connected stores
    pub fn from_config(config: &Config, stores: Stores) -> Result<Self> {
        let channels = channels_from_config(&config.channels)?;
        let dispatcher = AlertDispatcher::new(channels, config.alerting.send_timeout)
            .with_approaching_cooldown(config.alerting.approaching_cooldown);
        let evaluator = ThresholdEvaluator::new(config.limits.approaching_ratio);

        Ok(Self::new(config.window_definitions(), stores.ledger, evaluator, dispatcher)
            .with_alert_log(stores.alert_log))
    }

    /// Tracked window kinds and their limits
    pub fn definitions(&self) -> Vec<WindowDefinition> {
        self.slots.iter().map(|s| s.definition.clone()).collect()
    }

    /// Look up a tracked kind by name
    pub fn find_kind(&self, name: &str) -> Option<&WindowKind> {
        self.slots
            .iter()
            .map(|s| &s.definition.kind)
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Configured limit of a tracked kind
    pub fn limit_of(&self, kind: &WindowKind) -> Option<Decimal> {
        self.slots
            .iter()
            .find(|s| &s.definition.kind == kind)
            .and_then(|s| s.definition.limit)
    }

    /// Severity of a total against its kind's limit, `None` when unlimited
    pub fn severity_of(&self, total: &WindowTotal) -> Option<Severity> {
        self.evaluator.evaluate_limit(total, self.limit_of(&total.kind))
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Accept one event: de-duplicate, validate, persist, aggregate, evaluate
    /// and notify.
    ///
    /// Duplicate and invalid events are `Ok` results. Ledger failures are
    /// returned as [`Error::LedgerUnavailable`].
    pub async fn handle_event(&self, event: IncomingEvent) -> Result<AcceptanceResult> {
        let result = self.process(event).await;

        match &result {
            Ok(r) => telemetry::record_event(r.outcome.as_str()),
            Err(e) => {
                error!(error = %e, "Failed to handle event");
                telemetry::record_event("error");
            }
        }

        result
    }

    async fn process(&self, event: IncomingEvent) -> Result<AcceptanceResult> {
        if self.ledger.contains(event.id.trim()).await? {
            debug!(id = %event.id, "Duplicate event");
            return Ok(AcceptanceResult::rejected(AcceptanceOutcome::Duplicate));
        }

        let record = match event.into_record(Utc::now()) {
            Ok(record) => record,
            Err(Error::InvalidEvent(reason)) => {
                warn!(reason = %reason, "Rejected invalid event");
                return Ok(AcceptanceResult::rejected(AcceptanceOutcome::Invalid { reason }));
            }
            Err(e) => return Err(e),
        };

        if !self.ledger.insert_if_absent(&record).await? {
            debug!(id = %record.id, "Duplicate event lost the insert race");
            return Ok(AcceptanceResult::rejected(AcceptanceOutcome::Duplicate));
        }

        info!(id = %record.id, cost = %record.cost, timestamp = %record.timestamp, "Event accepted");

        let now = Utc::now();
        let mut totals = Vec::with_capacity(self.slots.len());
        let mut pending = Vec::new();

        for slot in &self.slots {
            match self.apply(slot, &record, now).await {
                Ok((total, notification)) => {
                    totals.push(total);
                    pending.extend(notification);
                }
                Err(e) => {
                    // levels already raised for earlier kinds will not be raised again
                    self.dispatch(pending).await;
                    return Err(e);
                }
            }
        }

        let alerts = self.dispatch(pending).await;

        Ok(AcceptanceResult {
            outcome: AcceptanceOutcome::Accepted,
            totals,
            alerts,
        })
    }

    /// Fold an accepted record into one kind's running total and evaluate it.
    /// The slot lock is held for the whole state transition.
    async fn apply(
        &self,
        slot: &WindowSlot,
        record: &EventRecord,
        now: DateTime<Utc>,
    ) -> Result<(WindowTotal, Option<AlertNotification>)> {
        let kind = &slot.definition.kind;
        let bounds = kind.bounds_for(record.timestamp);
        let mut state = slot.state.lock().await;

        if matches!(&state.running, Some(running) if bounds.start < running.bounds().start) {
            debug!(kind = %kind, id = %record.id, "Event belongs to a past window");
            return self.apply_late(slot, &mut state, bounds, now).await;
        }

        let total = match state.running.as_mut() {
            Some(running) if running.bounds() == bounds => {
                running.add(record);
                running.snapshot(kind)
            }
            _ => {
                let mut running = self.aggregator.seed(bounds).await?;
                running.add(record);
                let total = running.snapshot(kind);
                state.running = Some(running);
                total
            }
        };

        telemetry::record_window_spend(kind, total.sum_cost);

        let Some(limit) = slot.definition.limit else {
            return Ok((total, None));
        };

        if let Some(start) = state.alert.window_start {
            if start < total.window_start {
                let level = state.alert.last_alert_level;
                state.retire(start, level);
            }
        }

        let severity = self.evaluator.evaluate(&total, limit);
        let (next, notification) =
            self.dispatcher
                .maybe_notify(severity, &total, limit, &state.alert, now);
        state.alert = next;

        debug!(
            kind = %kind,
            sum_cost = %total.sum_cost,
            limit = %limit,
            severity = %severity,
            notify = notification.is_some(),
            "Evaluated window"
        );

        Ok((total, notification))
    }

    /// Evaluate a closed window instance after a late event landed in it.
    ///
    /// The total comes from the ledger. The level it is compared against is the
    /// one remembered for that instance, else the alert log's, else `Ok`.
    async fn apply_late(
        &self,
        slot: &WindowSlot,
        state: &mut SlotState,
        bounds: WindowBounds,
        now: DateTime<Utc>,
    ) -> Result<(WindowTotal, Option<AlertNotification>)> {
        let kind = &slot.definition.kind;
        let total = self.aggregator.seed(bounds).await?.snapshot(kind);

        let Some(limit) = slot.definition.limit else {
            return Ok((total, None));
        };

        let level = match (state.past.get(&bounds.start), &self.alert_log) {
            (Some(level), _) => *level,
            (None, Some(log)) => log.highest_level(kind, bounds.start).await?,
            (None, None) => Severity::Ok,
        };

        let previous = AlertState {
            window_start: Some(bounds.start),
            last_alert_level: level,
            last_alert_time: state.alert.last_alert_time,
        };

        let severity = self.evaluator.evaluate(&total, limit);
        let (next, notification) = self
            .dispatcher
            .maybe_notify(severity, &total, limit, &previous, now);
        state.retire(bounds.start, next.last_alert_level);

        debug!(
            kind = %kind,
            window_start = %bounds.start,
            sum_cost = %total.sum_cost,
            severity = %severity,
            notify = notification.is_some(),
            "Evaluated past window"
        );

        Ok((total, notification))
    }

    /// Deliver notifications concurrently and record them in the alert log
    async fn dispatch(&self, pending: Vec<AlertNotification>) -> Vec<AlertRecord> {
        if pending.is_empty() {
            return Vec::new();
        }

        let deliveries = join_all(pending.iter().map(|n| self.dispatcher.deliver(n))).await;

        let mut records = Vec::with_capacity(pending.len());
        for (notification, deliveries) in pending.into_iter().zip(deliveries) {
            telemetry::record_alert(&notification.kind, notification.severity);

            let record = AlertRecord {
                notification,
                deliveries,
            };

            if let Some(log) = &self.alert_log {
                if let Err(e) = log.record(&record).await {
                    warn!(error = %e, kind = %record.notification.kind, "Failed to record alert");
                }
            }

            records.push(record);
        }

        records
    }

    /// Total of the current window instance of `kind`.
    ///
    /// Served from the running total when it covers `now`, otherwise computed
    /// from the ledger. Untracked kinds are always computed from the ledger.
    pub async fn current_totals(&self, kind: &WindowKind) -> Result<WindowTotal> {
        let now = Utc::now();

        if let Some(slot) = self.slots.iter().find(|s| &s.definition.kind == kind) {
            let state = slot.state.lock().await;
            if let Some(running) = state.running.as_ref() {
                if running.bounds().contains(now) {
                    return Ok(running.snapshot(kind));
                }
            }
        }

        self.aggregator.total(kind, now).await
    }

    /// Current totals of every tracked kind
    pub async fn all_current_totals(&self) -> Result<Vec<WindowTotal>> {
        let mut totals = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            totals.push(self.current_totals(&slot.definition.kind).await?);
        }
        Ok(totals)
    }

    /// Ledger-derived totals of every tracked kind at `reference`
    pub async fn totals_at(&self, reference: DateTime<Utc>) -> Result<Vec<WindowTotal>> {
        let mut totals = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            totals.push(self.aggregator.total(&slot.definition.kind, reference).await?);
        }
        Ok(totals)
    }

    /// Rebuild running totals and alert levels for the window instances
    /// containing `now`, so a restart neither loses spending nor re-notifies.
    ///
    /// Alert levels come from the alert log when one is configured, otherwise
    /// from evaluating the restored totals.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<()> {
        for slot in &self.slots {
            let kind = &slot.definition.kind;
            let bounds = kind.bounds_for(now);
            let running = self.aggregator.seed(bounds).await?;
            let total = running.snapshot(kind);

            let level = match (&self.alert_log, slot.definition.limit) {
                (Some(log), _) => log.highest_level(kind, bounds.start).await?,
                (None, Some(limit)) => self.evaluator.evaluate(&total, limit),
                (None, None) => Severity::Ok,
            };

            let mut state = slot.state.lock().await;
            state.running = Some(running);
            state.alert = AlertState {
                window_start: Some(bounds.start),
                last_alert_level: level,
                last_alert_time: None,
            };

            telemetry::record_window_spend(kind, total.sum_cost);
            info!(
                kind = %kind,
                sum_cost = %total.sum_cost,
                events = total.event_count,
                level = %level,
                "Restored window state"
            );
        }

        Ok(())
    }

    /// Compare every running total with the ledger sum of its window and
    /// reseed the ones that drifted.
    ///
    /// Returns the number of kinds whose running total had drifted.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut drifted = 0;

        for slot in &self.slots {
            let kind = &slot.definition.kind;
            let mut state = slot.state.lock().await;

            let Some((bounds, running_sum)) = state.running.as_ref().map(|r| (r.bounds(), r.sum()))
            else {
                continue;
            };

            let ledger_sum = self.ledger.sum_cost_in_range(bounds.start, bounds.end).await?;
            if ledger_sum == running_sum {
                continue;
            }

            warn!(
                kind = %kind,
                running = %running_sum,
                ledger = %ledger_sum,
                "Running total drifted from ledger"
            );
            telemetry::record_reconcile_drift(kind);
            drifted += 1;

            state.running = Some(self.aggregator.seed(bounds).await?);
        }

        Ok(drifted)
    }

    /// Periodically reconcile running totals until the task is dropped
    pub async fn run_reconciler(self: Arc<Self>, period: Duration) {
        info!(every = ?period, "Starting reconciler");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = self.reconcile().await {
                error!(error = %e, "Error reconciling window totals");
            }
        }
    }

    /// Spending over the trailing `hours`, at most [`MAX_SUMMARY_HOURS`]
    pub async fn spending_summary(&self, hours: u32) -> Result<SpendingSummary> {
        if hours > MAX_SUMMARY_HOURS {
            return Err(Error::InvalidQuery(format!(
                "hours must be at most {MAX_SUMMARY_HOURS}, got {hours}"
            )));
        }

        let end = Utc::now();
        let start = end - chrono::Duration::hours(i64::from(hours));
        let records = self.ledger.iterate_range(start, end).await?;
        Ok(SpendingSummary::from_records(&records, hours))
    }
}
