//! Follow-up on approval requests nobody has answered yet.
//!
//! Covers delegation (applied when a gate opens), manual reassignment, and
//! the sweeper's reminders and time-based escalation. Every change to a
//! request goes through the execution's versioned write, so a request that
//! is decided, reassigned or escalated concurrently is never followed up
//! twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use actions::ActionContext;

use crate::approval;
use crate::dispatch::PlannedAction;
use crate::executor::{BlueprintEngine, MAX_WRITE_ATTEMPTS};
use crate::graph::BlueprintGraph;
use crate::runtime::{ApprovalRequest, ApprovalRequestStatus, Delegation, ExecutionStatus, GateStatus, TransitionExecution};
use crate::store::ExecutionWrite;
use crate::EngineError;

/// Action type approval notifications are dispatched as.
pub const NOTIFY_ACTION: &str = "notify_user";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FollowUpReport {
    pub reminders_sent: usize,
    pub escalated: usize,
    /// Requests due for escalation for which no target user was found.
    pub escalation_targets_missing: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DelegationOverview {
    /// Everything the user has delegated, ended ones included.
    pub outgoing: Vec<Delegation>,
    /// Delegations to the user that are in effect now.
    pub incoming: Vec<Delegation>,
}

impl BlueprintEngine {
    // -----------------------------------------------------------------------
    // Reassignment
    // -----------------------------------------------------------------------

    /// Hand a pending approval request to `new_approver`.
    ///
    /// # Errors
    /// `PreconditionFailed` if the request is no longer pending, already
    /// belongs to `new_approver`, or its gate is not open.
    #[instrument(skip(self, reason), fields(request_id = %request_id, new_approver = %new_approver))]
    pub async fn reassign(
        &self,
        request_id: Uuid,
        new_approver: Uuid,
        reassigned_by: Uuid,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, EngineError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let request = self.store.approval_request(request_id).await?;
            if request.status != ApprovalRequestStatus::Pending {
                return Err(EngineError::PreconditionFailed(format!(
                    "cannot reassign approval request {request_id}: it is already {}",
                    request.status.as_str()
                )));
            }
            if request.approver_id == new_approver {
                return Err(EngineError::PreconditionFailed(format!(
                    "approval request {request_id} already belongs to {new_approver}"
                )));
            }
            let execution = self.store.execution(request.execution_id).await?;
            if !awaiting_decision(&execution) {
                return Err(EngineError::PreconditionFailed(format!(
                    "execution {} is not awaiting approval",
                    execution.id
                )));
            }

            let mut updated = request;
            updated.hand_to(new_approver);
            let mut write = ExecutionWrite::new(execution.clone(), ExecutionStatus::PendingApproval);
            write.updated_requests.push(updated.clone());
            if !self.commit(write).await? {
                debug!(attempt, "reassignment raced another update, retrying");
                continue;
            }

            info!(
                reassigned_by = %reassigned_by,
                reason = reason.as_deref().unwrap_or(""),
                "approval request reassigned"
            );
            let graph = self.store.load_graph(execution.blueprint_id).await?;
            let message = match reason.as_deref() {
                Some(r) if !r.trim().is_empty() => format!("An approval request has been reassigned to you: {r}"),
                _ => "An approval request has been reassigned to you".to_owned(),
            };
            self.notify(&graph, &execution, &updated, "reassignment", "Approval Request Reassigned", &message)
                .await;
            return Ok(updated);
        }
        Err(EngineError::PreconditionFailed(format!(
            "approval request {request_id} is being updated concurrently, try again"
        )))
    }

    // -----------------------------------------------------------------------
    // Delegation
    // -----------------------------------------------------------------------

    /// Start a delegation. Gates opened while it is in effect address the
    /// delegate instead of the delegator.
    ///
    /// # Errors
    /// `ValidationFailed` for a self-delegation or an end before the start;
    /// `PreconditionFailed` if the delegator already has an active delegation.
    #[instrument(skip(self, delegation), fields(delegator = %delegation.delegator_id, delegate = %delegation.delegate_id))]
    pub async fn create_delegation(&self, delegation: Delegation) -> Result<Delegation, EngineError> {
        if delegation.delegator_id == delegation.delegate_id {
            return Err(EngineError::ValidationFailed("cannot delegate to yourself".into()));
        }
        if delegation.ends_at.is_some_and(|end| end <= delegation.starts_at) {
            return Err(EngineError::ValidationFailed("delegation must end after it starts".into()));
        }
        self.store.insert_delegation(&delegation).await?;
        info!(delegation_id = %delegation.id, "delegation created");
        Ok(delegation)
    }

    /// End a delegation early. Only its delegator may do so.
    pub async fn end_delegation(&self, delegation_id: Uuid, user: Uuid) -> Result<(), EngineError> {
        let delegation = self.store.delegation(delegation_id).await?;
        if delegation.delegator_id != user {
            return Err(EngineError::PreconditionFailed(
                "only the delegator can end this delegation".into(),
            ));
        }
        self.store.deactivate_delegation(delegation_id).await?;
        info!(delegation_id = %delegation_id, "delegation ended");
        Ok(())
    }

    pub async fn delegations(&self, user: Uuid, now: DateTime<Utc>) -> Result<DelegationOverview, EngineError> {
        let (outgoing, incoming) = self
            .store
            .delegations_for(user)
            .await?
            .into_iter()
            .partition::<Vec<_>, _>(|d| d.delegator_id == user);
        Ok(DelegationOverview {
            outgoing,
            incoming: incoming.into_iter().filter(|d| d.in_effect(now)).collect(),
        })
    }

    /// The delegation redirecting `approver`'s requests for `blueprint_id` at `at`.
    pub(crate) async fn delegation_covering(
        &self,
        approver: Uuid,
        blueprint_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Delegation>, EngineError> {
        Ok(self
            .store
            .delegations_for(approver)
            .await?
            .into_iter()
            .find(|d| d.delegator_id == approver && d.covers(blueprint_id, at)))
    }

    // -----------------------------------------------------------------------
    // Reminders and escalation
    // -----------------------------------------------------------------------

    /// Escalate requests that waited past `escalation_hours` and remind
    /// approvers every `reminder_hours`. A request escalated in this pass gets
    /// no reminder in the same pass.
    #[instrument(skip(self))]
    pub async fn follow_up_approvals(&self, now: DateTime<Utc>) -> Result<FollowUpReport, EngineError> {
        let mut report = FollowUpReport::default();
        let mut graphs: HashMap<Uuid, BlueprintGraph> = HashMap::new();

        for execution in self.store.executions_with_status(ExecutionStatus::PendingApproval).await? {
            if !awaiting_decision(&execution) {
                continue;
            }
            if !graphs.contains_key(&execution.blueprint_id) {
                let graph = self.store.load_graph(execution.blueprint_id).await?;
                graphs.insert(execution.blueprint_id, graph);
            }
            let Some(graph) = graphs.get(&execution.blueprint_id) else { continue };
            let Some(config) = graph.transition(execution.transition_id).and_then(|t| t.approval.as_ref()) else {
                continue;
            };

            let mut escalated = Vec::new();
            let mut reminded = Vec::new();
            for request in self.store.approval_requests(execution.id).await? {
                if approval::should_escalate(config, &request, now) {
                    let Some(target) = &config.escalate_to else { continue };
                    match approval::escalation_target(target, &request, self.approvers.as_ref()).await? {
                        Some(to) if to != request.approver_id => {
                            let mut next = request;
                            next.hand_to(to);
                            next.escalated_at = Some(now);
                            escalated.push(next);
                        }
                        _ => {
                            report.escalation_targets_missing += 1;
                            warn!(request_id = %request.id, "no escalation target found for approval request");
                        }
                    }
                } else if approval::should_remind(config, &request, now) {
                    let mut next = request;
                    next.reminder_count += 1;
                    next.last_reminder_at = Some(now);
                    reminded.push(next);
                }
            }
            if escalated.is_empty() && reminded.is_empty() {
                continue;
            }

            let mut write = ExecutionWrite::new(execution.clone(), ExecutionStatus::PendingApproval);
            write.updated_requests = escalated.iter().chain(&reminded).cloned().collect();
            if !self.commit(write).await? {
                info!(execution_id = %execution.id, "skipping follow-up of a changed execution");
                continue;
            }

            let hours = config.escalation_hours.unwrap_or_default();
            for request in &escalated {
                report.escalated += 1;
                info!(request_id = %request.id, escalated_to = %request.approver_id, "approval request escalated");
                let message = format!(
                    "An approval request has been escalated to you. {}",
                    approval::escalation_reason(hours)
                );
                self.notify(graph, &execution, request, "escalation", "Approval Request Escalated to You", &message)
                    .await;
            }
            for request in &reminded {
                report.reminders_sent += 1;
                info!(request_id = %request.id, reminder_count = request.reminder_count, "approval reminder sent");
                self.notify(
                    graph,
                    &execution,
                    request,
                    "reminder",
                    "Approval Reminder",
                    "You have a pending approval request awaiting your action",
                )
                .await;
            }
        }

        Ok(report)
    }

    /// Tell `request`'s current approver about it through the `notify_user`
    /// handler, if one is registered. Failures are logged, never returned.
    async fn notify(
        &self,
        graph: &BlueprintGraph,
        execution: &TransitionExecution,
        request: &ApprovalRequest,
        kind: &str,
        title: &str,
        message: &str,
    ) {
        if !self.dispatcher.is_registered(NOTIFY_ACTION) {
            debug!(kind, "no '{}' handler registered, notification dropped", NOTIFY_ACTION);
            return;
        }

        let config = json!({
            "user_id": request.approver_id,
            "title": title,
            "message": message,
            "data": {
                "type": kind,
                "request_id": request.id,
                "reminder_count": request.reminder_count,
            },
        });
        let ctx = ActionContext {
            blueprint_id: graph.blueprint.id,
            module_id: graph.blueprint.module_id,
            record_id: execution.record_id,
            execution_id: Some(execution.id),
            transition_name: graph.transition(execution.transition_id).map(|t| t.name.clone()),
            from_state: None,
            to_state: None,
            executed_by: Some(execution.executed_by),
            requirements: Value::Null,
            record: Value::Null,
            extra: serde_json::to_value(request).unwrap_or(Value::Null),
        };
        let report = self
            .dispatcher
            .dispatch(
                &PlannedAction {
                    id: request.id,
                    action_type: NOTIFY_ACTION,
                    config: &config,
                    display_order: 0,
                    is_active: true,
                },
                &ctx,
            )
            .await;
        if !report.succeeded() {
            warn!(
                request_id = %request.id,
                "{} notification failed: {}",
                kind,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

/// An execution whose gate is still collecting decisions.
fn awaiting_decision(execution: &TransitionExecution) -> bool {
    execution.status == ExecutionStatus::PendingApproval && execution.gate_status() == Some(GateStatus::Pending)
}
