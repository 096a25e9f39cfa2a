// libs/appointment-cell/src/services/reconciler.rs
//
// Periodic reconciliation: brings persisted appointment status in line with
// what wall-clock time implies, with no human action. Every tick is a full
// idempotent scan; there is no cursor to lose and nothing to replay.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;
use shared_database::store::StoreClient;
use shared_utils::time::{system_clock, Clock};

use crate::models::{Appointment, AppointmentStatus, PaymentStatus};
use crate::services::lifecycle::AppointmentLifecycleService;

/// What a single tick did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub started: u32,
    pub completed: u32,
    pub cancelled: u32,
    pub failures: u32,
}

impl TickSummary {
    pub fn total_transitions(&self) -> u32 {
        self.started + self.completed + self.cancelled
    }
}

pub struct ReconciliationScheduler {
    store: Arc<StoreClient>,
    lifecycle: AppointmentLifecycleService,
    clock: Arc<dyn Clock>,
    tick_period: std::time::Duration,
}

impl ReconciliationScheduler {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(StoreClient::new(config)),
            lifecycle: AppointmentLifecycleService::new(),
            clock,
            tick_period: std::time::Duration::from_secs(config.reconciler_tick_seconds),
        }
    }

    /// Run as a background task for the life of the process.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting reconciliation scheduler with {}s tick period",
            self.tick_period.as_secs()
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let now = self.clock.now();
                let summary = self.tick(now).await;
                if summary.total_transitions() > 0 || summary.failures > 0 {
                    info!(
                        "Reconciliation tick: {} started, {} completed, {} cancelled, {} failures",
                        summary.started, summary.completed, summary.cancelled, summary.failures
                    );
                }
            }
        })
    }

    /// One full reconciliation pass. Public so tests can drive simulated
    /// ticks directly. The three passes filter on disjoint status sets, so
    /// their order does not matter.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        self.auto_start_pass(now, &mut summary).await;
        self.auto_complete_pass(now, &mut summary).await;
        self.payment_timeout_pass(now, &mut summary).await;

        summary
    }

    /// Confirmed appointments whose scheduled time has arrived go live.
    async fn auto_start_pass(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let path = format!(
            "/rest/v1/appointments?status=eq.{}&scheduled_at=lte.{}",
            AppointmentStatus::Confirmed,
            urlencoding::encode(&now.to_rfc3339()),
        );

        for appointment in self.fetch_candidates(&path, summary).await {
            if self.lifecycle.automatic_transition(&appointment, now)
                != Some(AppointmentStatus::InProgress)
            {
                continue;
            }

            let patch = json!({
                "status": AppointmentStatus::InProgress,
                "updated_at": now.to_rfc3339(),
            });

            match self.apply(&appointment, patch).await {
                Ok(true) => {
                    info!("Auto-started appointment {}", appointment.id);
                    summary.started += 1;
                }
                Ok(false) => debug!(
                    "Appointment {} changed status before auto-start, skipping",
                    appointment.id
                ),
                Err(e) => {
                    warn!("Failed to auto-start appointment {}: {}", appointment.id, e);
                    summary.failures += 1;
                }
            }
        }
    }

    /// Live appointments past their end plus grace period wrap up.
    async fn auto_complete_pass(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let path = format!(
            "/rest/v1/appointments?status=eq.{}",
            AppointmentStatus::InProgress
        );

        for appointment in self.fetch_candidates(&path, summary).await {
            if self.lifecycle.automatic_transition(&appointment, now)
                != Some(AppointmentStatus::Completed)
            {
                continue;
            }

            let patch = json!({
                "status": AppointmentStatus::Completed,
                "updated_at": now.to_rfc3339(),
            });

            match self.apply(&appointment, patch).await {
                Ok(true) => {
                    info!("Auto-completed appointment {}", appointment.id);
                    summary.completed += 1;
                }
                Ok(false) => debug!(
                    "Appointment {} changed status before auto-complete, skipping",
                    appointment.id
                ),
                Err(e) => {
                    warn!("Failed to auto-complete appointment {}: {}", appointment.id, e);
                    summary.failures += 1;
                }
            }
        }
    }

    /// Soft holds whose payment never arrived are released.
    async fn payment_timeout_pass(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let deadline =
            now - Duration::hours(self.lifecycle.rules().payment_timeout_hours);
        let path = format!(
            "/rest/v1/appointments?status=eq.{}&created_at=lte.{}",
            AppointmentStatus::PaymentPending,
            urlencoding::encode(&deadline.to_rfc3339()),
        );

        for appointment in self.fetch_candidates(&path, summary).await {
            if self.lifecycle.automatic_transition(&appointment, now)
                != Some(AppointmentStatus::Cancelled)
            {
                continue;
            }

            let patch = json!({
                "status": AppointmentStatus::Cancelled,
                "payment_status": PaymentStatus::Failed,
                "cancellation_reason":
                    "Cancelled by system: payment was not completed within the payment window",
                "updated_at": now.to_rfc3339(),
            });

            match self.apply(&appointment, patch).await {
                Ok(true) => {
                    info!(
                        "Auto-cancelled appointment {} after payment timeout",
                        appointment.id
                    );
                    summary.cancelled += 1;
                }
                Ok(false) => debug!(
                    "Appointment {} changed status before payment-timeout cancel, skipping",
                    appointment.id
                ),
                Err(e) => {
                    warn!(
                        "Failed to cancel appointment {} on payment timeout: {}",
                        appointment.id, e
                    );
                    summary.failures += 1;
                }
            }
        }
    }

    /// Fetch and parse one pass's candidates. Rows that fail to parse are
    /// logged and skipped; the rest of the pass continues.
    async fn fetch_candidates(&self, path: &str, summary: &mut TickSummary) -> Vec<Appointment> {
        let rows: Vec<Value> = match self.store.request(Method::GET, path, None, None).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Reconciliation scan failed, will retry next tick: {}", e);
                summary.failures += 1;
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| match serde_json::from_value::<Appointment>(row) {
                Ok(appointment) => Some(appointment),
                Err(e) => {
                    warn!("Skipping unparseable appointment row: {}", e);
                    summary.failures += 1;
                    None
                }
            })
            .collect()
    }

    /// Compare-and-set against the status the scan observed. `Ok(false)`
    /// means the precondition no longer held (someone else transitioned the
    /// appointment first), which is a no-op by design.
    async fn apply(&self, appointment: &Appointment, patch: Value) -> anyhow::Result<bool> {
        let filter = format!("id=eq.{}&status=eq.{}", appointment.id, appointment.status);
        let updated: Vec<Appointment> = self
            .store
            .update_where("appointments", &filter, patch, None)
            .await?;
        Ok(!updated.is_empty())
    }
}
