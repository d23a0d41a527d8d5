//! Action dispatch.
//!
//! `ActionDispatcher` runs a list of configured actions through the handler
//! registry after a transition has committed (or when an SLA escalation
//! fires). Actions are best-effort: a failing action is logged and reported,
//! never propagated, and never stops the actions after it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use actions::{ActionContext, ActionError, ActionHandler, ActionRegistry};

use crate::config::EngineConfig;
use crate::EngineError;

/// One action as the dispatcher sees it: transition actions and SLA
/// escalations both boil down to this.
#[derive(Debug, Clone)]
pub struct PlannedAction<'a> {
    pub id: Uuid,
    pub action_type: &'a str,
    pub config: &'a Value,
    pub display_order: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// What happened to one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    pub action_id: Uuid,
    pub action_type: String,
    pub outcome: ActionOutcome,
    /// Dispatch attempts made (0 for skipped actions).
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ActionOutcome::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ActionDispatcher {
    registry: ActionRegistry,
    config: EngineConfig,
}

impl ActionDispatcher {
    pub fn new(registry: ActionRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn is_registered(&self, action_type: &str) -> bool {
        self.registry.contains_key(action_type)
    }

    /// Dispatch `planned` in ascending `display_order`, skipping inactive ones.
    #[instrument(skip_all, fields(record_id = %ctx.record_id, actions = planned.len()))]
    pub async fn dispatch_all(&self, planned: &[PlannedAction<'_>], ctx: &ActionContext) -> Vec<ActionReport> {
        let mut ordered: Vec<&PlannedAction<'_>> = planned.iter().collect();
        ordered.sort_by_key(|a| a.display_order);

        let mut reports = Vec::with_capacity(ordered.len());
        for action in ordered {
            if !action.is_active {
                reports.push(ActionReport {
                    action_id: action.id,
                    action_type: action.action_type.to_owned(),
                    outcome: ActionOutcome::Skipped,
                    attempts: 0,
                    output: None,
                    error: None,
                });
                continue;
            }
            reports.push(self.dispatch(action, ctx).await);
        }

        let failed = reports.iter().filter(|r| r.outcome == ActionOutcome::Failed).count();
        if failed > 0 {
            warn!("{} of {} actions failed", failed, reports.len());
        }
        reports
    }

    /// Dispatch a single action, retrying retryable failures.
    pub async fn dispatch(&self, action: &PlannedAction<'_>, ctx: &ActionContext) -> ActionReport {
        let mut report = ActionReport {
            action_id: action.id,
            action_type: action.action_type.to_owned(),
            outcome: ActionOutcome::Failed,
            attempts: 0,
            output: None,
            error: None,
        };

        let Some(handler) = self.registry.get(action.action_type) else {
            let err = EngineError::ActionDispatchFailed {
                action_type: action.action_type.to_owned(),
                message: "no handler registered for this action type".into(),
            };
            warn!("{}", err);
            report.error = Some(err.to_string());
            return report;
        };

        match self.execute_with_retry(action, handler, ctx).await {
            (attempts, Ok(output)) => {
                info!("action '{}' ({}) succeeded", action.action_type, action.id);
                report.outcome = ActionOutcome::Succeeded;
                report.attempts = attempts;
                report.output = Some(output);
            }
            (attempts, Err(err)) => {
                warn!("{}", err);
                report.attempts = attempts;
                report.error = Some(err.to_string());
            }
        }
        report
    }

    /// Exponential back-off before retry number `retries + 1`, capped at
    /// `max_retry_delay`.
    fn backoff(&self, retries: u32) -> Duration {
        let cap = self.config.max_retry_delay;
        self.config
            .retry_base_delay
            .checked_mul(2u32.saturating_pow(retries))
            .map_or(cap, |d| d.min(cap))
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single action with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        action: &PlannedAction<'_>,
        handler: &Arc<dyn ActionHandler>,
        ctx: &ActionContext,
    ) -> (u32, Result<Value, EngineError>) {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match handler.execute(action.config, ctx).await {
                Ok(output) => return (attempts, Ok(output)),

                Err(ActionError::Fatal(msg)) => {
                    return (
                        attempts,
                        Err(EngineError::ActionDispatchFailed {
                            action_type: action.action_type.to_owned(),
                            message: msg,
                        }),
                    );
                }

                Err(ActionError::Retryable(msg)) => {
                    let retries = attempts - 1;
                    if retries >= self.config.max_action_retries {
                        return (
                            attempts,
                            Err(EngineError::ActionDispatchFailed {
                                action_type: action.action_type.to_owned(),
                                message: format!("gave up after {attempts} attempts: {msg}"),
                            }),
                        );
                    }

                    let delay = self.backoff(retries);
                    warn!(
                        "action '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        action.action_type,
                        attempts,
                        self.config.max_action_retries.saturating_add(1),
                        delay,
                        msg
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
