//! Background sweeper: periodic SLA escalation scanning, approval expiry and
//! approval reminders / escalation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::executor::BlueprintEngine;
use crate::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// (record, SLA) pairs inspected.
    pub checked: usize,
    pub breaches: usize,
    pub escalations_fired: usize,
    pub escalation_failures: usize,
    pub approvals_expired: usize,
    pub approval_reminders: usize,
    pub approvals_escalated: usize,
}

pub struct Sweeper {
    engine: Arc<BlueprintEngine>,
}

impl Sweeper {
    pub fn new(engine: Arc<BlueprintEngine>) -> Self {
        Self { engine }
    }

    /// One pass over SLAs and pending approval gates. Expiry runs before
    /// follow-up so an expired gate gets no reminder.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let scan = self.engine.scan_slas(now).await?;
        let approvals_expired = self.engine.expire_approvals(now).await?;
        let follow_up = self.engine.follow_up_approvals(now).await?;

        Ok(SweepReport {
            checked: scan.checked,
            breaches: scan.breaches,
            escalations_fired: scan.escalations_fired,
            escalation_failures: scan.escalation_failures,
            approvals_expired,
            approval_reminders: follow_up.reminders_sent,
            approvals_escalated: follow_up.escalated,
        })
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to `true`.
    ///
    /// A failed pass is logged and the loop carries on.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config().sweep_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("sweeper started (every {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) => info!(
                            checked = report.checked,
                            breaches = report.breaches,
                            escalations_fired = report.escalations_fired,
                            escalation_failures = report.escalation_failures,
                            approvals_expired = report.approvals_expired,
                            approval_reminders = report.approval_reminders,
                            approvals_escalated = report.approvals_escalated,
                            "sweep finished"
                        ),
                        Err(e) => error!("sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}
