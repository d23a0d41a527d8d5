//! Transition execution engine.
//!
//! `BlueprintEngine` is the central orchestrator:
//! 1. Resolves where a record sits (initialising its state on first sight).
//! 2. Re-checks transition availability on every command, not only at discovery.
//! 3. Drives an execution through `pending_requirements` → `pending_approval` →
//!    `completed`, or to `cancelled`.
//! 4. Commits the record's new state, the execution and its history row in one
//!    store write, then dispatches the transition's actions best-effort.
//! 5. Scans SLAs for escalations and expires unanswered approval gates.
//!
//! Every write is a compare-and-set on the execution's version. A command whose
//! write loses to a concurrent one re-reads and runs again, so concurrent
//! submissions accumulate and concurrent decisions all count.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use actions::{ActionContext, ActionHandler, ActionRegistry};

use crate::approval::{self, ApproverResolver, Decision, NoDirectory};
use crate::config::EngineConfig;
use crate::dispatch::{ActionDispatcher, ActionOutcome, ActionReport, PlannedAction};
use crate::graph::{AvailableTransition, BlueprintGraph};
use crate::models::{Approval, State, Transition};
use crate::record::{NoRecords, RecordReader, RecordSnapshot};
use crate::requirement::{self, AcceptAll, FieldValidator, FormattedRequirement, RequirementSubmission};
use crate::runtime::{
    ApprovalRequest, ApprovalRequestStatus, ApprovalState, EscalationLog, ExecutionStatus,
    GateStatus, HistoryStatus, RecordState, TransitionExecution, TransitionHistoryItem,
};
use crate::sla::{self, BusinessCalendar, SlaStatus, StandardCalendar};
use crate::store::{BlueprintStore, ExecutionWrite, StoreError};
use crate::EngineError;

/// Attempts per command before giving up on a contended execution.
pub(crate) const MAX_WRITE_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Command results
// ---------------------------------------------------------------------------

/// What the caller should do next with an open execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    AwaitingMoreRequirements,
    /// Waiting on the approval gate.
    ReadyForApproval,
    ReadyToComplete,
}

/// Returned by `start` and `submit_requirements`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionProgress {
    pub execution: TransitionExecution,
    pub requirements: Vec<FormattedRequirement>,
    pub unmet: Vec<Uuid>,
    pub errors: Vec<String>,
    pub next_step: NextStep,
}

/// A field write the execution layer must apply to the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldWrite {
    pub record_id: Uuid,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub execution: TransitionExecution,
    pub record_state: RecordState,
    pub history: TransitionHistoryItem,
    pub field_writes: Vec<FieldWrite>,
    pub actions: Vec<ActionReport>,
}

impl CompletionOutcome {
    pub fn failed_actions(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|a| a.outcome == ActionOutcome::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub request: ApprovalRequest,
    pub gate: GateStatus,
    pub execution: TransitionExecution,
}

/// Current state, available transitions and SLA figures for one record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOverview {
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub current_state: State,
    pub state_entered_at: DateTime<Utc>,
    pub available_transitions: Vec<AvailableTransition>,
    pub sla: Vec<SlaStatus>,
    pub open_executions: Vec<TransitionExecution>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlaScan {
    pub checked: usize,
    pub breaches: usize,
    pub escalations_fired: usize,
    pub escalation_failures: usize,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    store: Arc<dyn BlueprintStore>,
    records: Arc<dyn RecordReader>,
    fields: Arc<dyn FieldValidator>,
    approvers: Arc<dyn ApproverResolver>,
    calendar: Arc<dyn BusinessCalendar>,
    registry: ActionRegistry,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn BlueprintStore>) -> Self {
        Self {
            store,
            records: Arc::new(NoRecords),
            fields: Arc::new(AcceptAll),
            approvers: Arc::new(NoDirectory),
            calendar: Arc::new(StandardCalendar::default()),
            registry: ActionRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn records(mut self, records: Arc<dyn RecordReader>) -> Self {
        self.records = records;
        self
    }

    pub fn field_validator(mut self, fields: Arc<dyn FieldValidator>) -> Self {
        self.fields = fields;
        self
    }

    pub fn approvers(mut self, approvers: Arc<dyn ApproverResolver>) -> Self {
        self.approvers = approvers;
        self
    }

    pub fn calendar(mut self, calendar: Arc<dyn BusinessCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn handler(mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.registry.insert(action_type.into(), handler);
        self
    }

    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> BlueprintEngine {
        BlueprintEngine {
            store: self.store,
            records: self.records,
            fields: self.fields,
            approvers: self.approvers,
            calendar: self.calendar,
            dispatcher: ActionDispatcher::new(self.registry, self.config.clone()),
            config: self.config,
        }
    }
}

// ---------------------------------------------------------------------------
// BlueprintEngine
// ---------------------------------------------------------------------------

pub struct BlueprintEngine {
    pub(crate) store: Arc<dyn BlueprintStore>,
    pub(crate) records: Arc<dyn RecordReader>,
    fields: Arc<dyn FieldValidator>,
    pub(crate) approvers: Arc<dyn ApproverResolver>,
    calendar: Arc<dyn BusinessCalendar>,
    pub(crate) dispatcher: ActionDispatcher,
    config: EngineConfig,
}

impl BlueprintEngine {
    pub fn builder(store: Arc<dyn BlueprintStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlueprintStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Open an execution of `transition_id` for `record_id`.
    ///
    /// # Errors
    /// `NotFound` for an unknown blueprint, transition or record;
    /// `PreconditionFailed` if the transition is not available, the approval
    /// gate resolves no approvers, or an open execution already exists.
    #[instrument(skip(self, initial), fields(blueprint_id = %blueprint_id, record_id = %record_id, transition_id = %transition_id))]
    pub async fn start(
        &self,
        blueprint_id: Uuid,
        record_id: Uuid,
        transition_id: Uuid,
        user: Uuid,
        initial: Option<RequirementSubmission>,
    ) -> Result<ExecutionProgress, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let transition = find_transition(&graph, transition_id)?;
        let snapshot = self.records.snapshot(record_id).await?;
        let state = self.ensure_record_state(&graph, &snapshot).await?;
        guard(&graph, transition, &state, &snapshot)?;

        let now = Utc::now();
        let mut execution = TransitionExecution {
            id: Uuid::new_v4(),
            blueprint_id,
            record_id,
            transition_id,
            from_state: Some(state.current_state_id),
            to_state: transition.to_state,
            executed_by: user,
            status: ExecutionStatus::PendingRequirements,
            submission: initial.unwrap_or_default(),
            approval: None,
            started_at: now,
            completed_at: None,
            cancellation_reason: None,
            version: 0,
        };

        let check = requirement::validate(&transition.requirements, &execution.submission, self.fields.as_ref());
        let mut requests = Vec::new();
        if check.satisfied {
            if let Some(approval) = transition.active_approval() {
                requests = self.open_gate(&mut execution, approval, &snapshot, now).await?;
            }
        }

        self.store.insert_execution(&execution, &requests).await?;
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            "started transition '{}'", transition.name
        );

        Ok(progress(execution, transition, check))
    }

    /// Merge `payload` into the execution's submission and re-validate.
    ///
    /// When the requirements become satisfied and the transition has an
    /// approval gate, the execution moves to `pending_approval`.
    #[instrument(skip(self, payload), fields(execution_id = %execution_id))]
    pub async fn submit_requirements(
        &self,
        execution_id: Uuid,
        payload: RequirementSubmission,
    ) -> Result<ExecutionProgress, EngineError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if let Some(progress) = self.try_submit(execution_id, payload.clone()).await? {
                return Ok(progress);
            }
            debug!(attempt, "submission raced another update, retrying");
        }
        Err(contended(execution_id))
    }

    async fn try_submit(
        &self,
        execution_id: Uuid,
        payload: RequirementSubmission,
    ) -> Result<Option<ExecutionProgress>, EngineError> {
        let current = self.store.execution(execution_id).await?;
        if current.status != ExecutionStatus::PendingRequirements {
            return Err(EngineError::PreconditionFailed(format!(
                "execution {execution_id} is {}, requirements can no longer be submitted",
                current.status
            )));
        }

        let graph = self.store.load_graph(current.blueprint_id).await?;
        let transition = find_transition(&graph, current.transition_id)?;
        let snapshot = self.records.snapshot(current.record_id).await?;
        let state = self.current_record_state(&current).await?;
        guard(&graph, transition, &state, &snapshot)?;

        let mut next = current.clone();
        next.submission.merge(payload);
        let check = requirement::validate(&transition.requirements, &next.submission, self.fields.as_ref());

        let mut new_requests = Vec::new();
        if check.satisfied {
            if let Some(approval) = transition.active_approval() {
                new_requests = self.open_gate(&mut next, approval, &snapshot, Utc::now()).await?;
            }
        }

        let mut write = ExecutionWrite::new(next, ExecutionStatus::PendingRequirements);
        write.new_requests = new_requests;
        let next = write.execution.clone();
        if !self.commit(write).await? {
            return Ok(None);
        }

        info!(
            status = %next.status,
            unmet = check.unmet.len(),
            "requirements submitted"
        );
        Ok(Some(progress(next, transition, check)))
    }

    /// Commit the transition: move the record, close the execution, append
    /// history, then dispatch actions.
    ///
    /// # Errors
    /// `PreconditionFailed` if the execution is not open, a required
    /// requirement is unmet, the approval gate has not approved, the guard no
    /// longer holds, or the record moved concurrently. Nothing is written in
    /// that case. Action failures never error; they are in the outcome.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn complete(&self, execution_id: Uuid) -> Result<CompletionOutcome, EngineError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if let Some(outcome) = self.try_complete(execution_id).await? {
                return Ok(outcome);
            }
            debug!(attempt, "completion raced another update, retrying");
        }
        Err(contended(execution_id))
    }

    async fn try_complete(&self, execution_id: Uuid) -> Result<Option<CompletionOutcome>, EngineError> {
        let execution = self.store.execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::PreconditionFailed(format!(
                "execution {execution_id} is already {}",
                execution.status
            )));
        }

        let graph = self.store.load_graph(execution.blueprint_id).await?;
        let transition = find_transition(&graph, execution.transition_id)?;
        let snapshot = self.records.snapshot(execution.record_id).await?;
        let state = self.current_record_state(&execution).await?;
        guard(&graph, transition, &state, &snapshot)?;

        let check = requirement::validate(&transition.requirements, &execution.submission, self.fields.as_ref());
        if !check.satisfied {
            return Err(EngineError::PreconditionFailed(format!(
                "requirements not met: {}",
                check.errors.join("; ")
            )));
        }
        if transition.requires_approval() || execution.approval.is_some() {
            match execution.gate_status() {
                Some(GateStatus::Approved) => {}
                Some(GateStatus::Rejected) => {
                    return Err(EngineError::PreconditionFailed("approval was rejected".into()));
                }
                _ => {
                    return Err(EngineError::PreconditionFailed("awaiting approval".into()));
                }
            }
        }

        let to_state = graph
            .state(transition.to_state)
            .ok_or_else(|| EngineError::not_found("state", transition.to_state))?;

        // ------------------------------------------------------------------
        // Commit state, execution and history together.
        // ------------------------------------------------------------------
        let now = Utc::now();
        let mut next = execution.clone();
        next.status = ExecutionStatus::Completed;
        next.completed_at = Some(now);

        let next_state = RecordState::enter(graph.blueprint.id, execution.record_id, to_state.id, now);
        let history = TransitionHistoryItem {
            id: Uuid::new_v4(),
            blueprint_id: graph.blueprint.id,
            record_id: execution.record_id,
            execution_id,
            transition_id: transition.id,
            transition_name: transition.name.clone(),
            from_state: Some(state.current_state_id),
            to_state: to_state.id,
            executed_by: execution.executed_by,
            status: HistoryStatus::Completed,
            started_at: execution.started_at,
            completed_at: now,
            reason: None,
        };

        let mut write = ExecutionWrite::new(next, execution.status);
        write.record_state = Some((state.current_state_id, next_state.clone()));
        write.close_pending = Some(ApprovalRequestStatus::Superseded);
        write.history = Some(history.clone());
        let done = write.execution.clone();
        if !self.commit(write).await? {
            return Ok(None);
        }

        let from_name = graph.state(state.current_state_id).map(|s| s.name.clone());
        info!(
            "record {} moved from '{}' to '{}' via '{}'",
            execution.record_id,
            from_name.as_deref().unwrap_or("?"),
            to_state.name,
            transition.name
        );

        // ------------------------------------------------------------------
        // Best-effort side effects.
        // ------------------------------------------------------------------
        let field_writes = to_state
            .field_option_value
            .iter()
            .map(|value| FieldWrite {
                record_id: execution.record_id,
                field: graph.blueprint.field.clone(),
                value: Value::String(value.clone()),
            })
            .collect();

        let ctx = ActionContext {
            blueprint_id: graph.blueprint.id,
            module_id: graph.blueprint.module_id,
            record_id: execution.record_id,
            execution_id: Some(execution_id),
            transition_name: Some(transition.name.clone()),
            from_state: from_name,
            to_state: Some(to_state.name.clone()),
            executed_by: Some(execution.executed_by),
            requirements: serde_json::to_value(&done.submission).unwrap_or(Value::Null),
            record: Value::Object(snapshot.fields.clone()),
            extra: Value::Null,
        };
        let planned: Vec<PlannedAction<'_>> = transition
            .actions
            .iter()
            .map(|a| PlannedAction {
                id: a.id,
                action_type: &a.action_type,
                config: &a.config,
                display_order: a.display_order,
                is_active: a.is_active,
            })
            .collect();
        let actions = self.dispatcher.dispatch_all(&planned, &ctx).await;
        for failed in actions.iter().filter(|r| r.outcome == ActionOutcome::Failed) {
            error!(
                action_id = %failed.action_id,
                "action '{}' failed after commit: {}",
                failed.action_type,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(Some(CompletionOutcome { execution: done, record_state: next_state, history, field_writes, actions }))
    }

    /// Cancel an open execution. The record's state is left alone.
    #[instrument(skip(self, reason), fields(execution_id = %execution_id))]
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        user: Uuid,
        reason: Option<String>,
    ) -> Result<TransitionExecution, EngineError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let execution = self.store.execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Err(EngineError::PreconditionFailed(format!(
                    "execution {execution_id} is already {}",
                    execution.status
                )));
            }
            let graph = self.store.load_graph(execution.blueprint_id).await?;
            let write = cancellation(&graph, execution, user, reason.clone(), ApprovalRequestStatus::Superseded);
            let done = write.execution.clone();
            if self.commit(write).await? {
                info!("execution cancelled");
                return Ok(done);
            }
            debug!(attempt, "cancellation raced another update, retrying");
        }
        Err(contended(execution_id))
    }

    /// Record one approver's decision and fold it into the gate.
    ///
    /// A rejecting gate cancels the execution; an approving gate leaves it in
    /// `pending_approval` until `complete` is called.
    #[instrument(skip(self, comments), fields(request_id = %request_id, user = %user))]
    pub async fn decide(
        &self,
        request_id: Uuid,
        user: Uuid,
        decision: Decision,
        comments: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if let Some(outcome) = self.try_decide(request_id, user, decision, comments.clone()).await? {
                return Ok(outcome);
            }
            debug!(attempt, "decision raced another update, retrying");
        }
        Err(EngineError::PreconditionFailed(format!(
            "approval request {request_id} is being updated concurrently, try again"
        )))
    }

    async fn try_decide(
        &self,
        request_id: Uuid,
        user: Uuid,
        decision: Decision,
        comments: Option<String>,
    ) -> Result<Option<DecisionOutcome>, EngineError> {
        let request = self.store.approval_request(request_id).await?;
        if request.approver_id != user {
            return Err(EngineError::PreconditionFailed(format!(
                "user {user} is not the approver of request {request_id}"
            )));
        }
        if request.status != ApprovalRequestStatus::Pending {
            return Err(EngineError::PreconditionFailed(format!(
                "approval request {request_id} is already {}",
                request.status.as_str()
            )));
        }

        let execution = self.store.execution(request.execution_id).await?;
        let gate = match (&execution.approval, execution.status) {
            (Some(gate), ExecutionStatus::PendingApproval) if gate.status == GateStatus::Pending => gate.clone(),
            _ => {
                return Err(EngineError::PreconditionFailed(format!(
                    "execution {} is not awaiting approval",
                    execution.id
                )));
            }
        };

        let now = Utc::now();
        let mut decided = request.clone();
        decided.status = decision.request_status();
        decided.comments = comments.clone();
        decided.responded_at = Some(now);

        let mut requests = self.store.approval_requests(execution.id).await?;
        for r in requests.iter_mut().filter(|r| r.id == decided.id) {
            *r = decided.clone();
        }
        let outcome = approval::aggregate(gate.require_all, &requests);

        let mut next = execution.clone();
        next.approval = Some(ApprovalState {
            status: outcome,
            decided_at: (outcome != GateStatus::Pending).then_some(now),
            ..gate
        });

        let mut write = match outcome {
            GateStatus::Rejected => {
                let graph = self.store.load_graph(execution.blueprint_id).await?;
                let reason = match comments.as_deref() {
                    Some(c) if !c.trim().is_empty() => format!("Rejected by approver: {c}"),
                    _ => "Rejected by approver".to_owned(),
                };
                cancellation(&graph, next, user, Some(reason), ApprovalRequestStatus::Superseded)
            }
            GateStatus::Approved | GateStatus::Pending => {
                let mut write = ExecutionWrite::new(next, ExecutionStatus::PendingApproval);
                if outcome == GateStatus::Approved {
                    write.close_pending = Some(ApprovalRequestStatus::Superseded);
                }
                write
            }
        };
        write.decided_request = Some(decided.clone());
        let next = write.execution.clone();
        if !self.commit(write).await? {
            return Ok(None);
        }

        match outcome {
            GateStatus::Rejected => warn!("approval rejected by {}", user),
            _ => info!(gate = ?outcome, "approval recorded"),
        }
        Ok(Some(DecisionOutcome { request: decided, gate: outcome, execution: next }))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn available_transitions(
        &self,
        blueprint_id: Uuid,
        record_id: Uuid,
    ) -> Result<Vec<AvailableTransition>, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let snapshot = self.records.snapshot(record_id).await?;
        let state = self.ensure_record_state(&graph, &snapshot).await?;
        Ok(graph.available_transitions(state.current_state_id, &snapshot.fields))
    }

    pub async fn record_overview(
        &self,
        blueprint_id: Uuid,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RecordOverview, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let snapshot = self.records.snapshot(record_id).await?;
        let state = self.ensure_record_state(&graph, &snapshot).await?;
        let current = graph
            .state(state.current_state_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("state", state.current_state_id))?;

        let sla = self.sla_for(&graph, &state, now);
        let open_executions = self
            .store
            .executions_for_record(record_id)
            .await?
            .into_iter()
            .filter(|e| e.blueprint_id == blueprint_id && !e.status.is_terminal())
            .collect();

        Ok(RecordOverview {
            blueprint_id,
            record_id,
            available_transitions: graph.available_transitions(state.current_state_id, &snapshot.fields),
            current_state: current,
            state_entered_at: state.state_entered_at,
            sla,
            open_executions,
        })
    }

    /// SLA status of every active SLA on the record's current state.
    pub async fn sla_status(
        &self,
        blueprint_id: Uuid,
        record_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlaStatus>, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let snapshot = self.records.snapshot(record_id).await?;
        let state = self.ensure_record_state(&graph, &snapshot).await?;
        Ok(self.sla_for(&graph, &state, now))
    }

    pub async fn history(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Vec<TransitionHistoryItem>, EngineError> {
        Ok(self.store.history(blueprint_id, record_id).await?)
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<TransitionExecution, EngineError> {
        Ok(self.store.execution(execution_id).await?)
    }

    pub async fn approval_requests(&self, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.approval_requests(execution_id).await?)
    }

    pub async fn pending_approvals(&self, user: Uuid) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.store.pending_approvals_for(user).await?)
    }

    // -----------------------------------------------------------------------
    // Periodic work
    // -----------------------------------------------------------------------

    /// Check every record sitting in a state with an SLA and fire the
    /// escalations that are due and have not fired for this residency yet.
    #[instrument(skip(self))]
    pub async fn scan_slas(&self, now: DateTime<Utc>) -> Result<SlaScan, EngineError> {
        let mut scan = SlaScan::default();

        for blueprint in self.store.list_blueprints(None).await? {
            if !blueprint.is_active {
                continue;
            }
            let graph = self.store.load_graph(blueprint.id).await?;
            if graph.slas.iter().all(|s| !s.is_active) {
                continue;
            }

            for state in self.store.record_states(blueprint.id).await? {
                let mut snapshot: Option<RecordSnapshot> = None;

                for sla in graph.slas_for_state(state.current_state_id) {
                    scan.checked += 1;
                    let status = sla::status(
                        sla,
                        state.state_entered_at,
                        None,
                        now,
                        self.calendar.as_ref(),
                        self.config.default_approaching_percent,
                    );
                    if status.is_breached {
                        scan.breaches += 1;
                    }

                    let due = sla::due_escalations(
                        sla,
                        state.state_entered_at,
                        now,
                        self.calendar.as_ref(),
                        self.config.default_approaching_percent,
                    );
                    for escalation in due {
                        let log = EscalationLog {
                            residency_id: state.residency_id,
                            escalation_id: escalation.id,
                            record_id: state.record_id,
                            fired_at: now,
                            succeeded: false,
                            result: Value::Null,
                        };
                        if !self.store.mark_escalation_fired(&log).await? {
                            continue;
                        }
                        scan.escalations_fired += 1;

                        if snapshot.is_none() {
                            snapshot = match self.records.snapshot(state.record_id).await {
                                Ok(s) => Some(s),
                                Err(e) => {
                                    warn!(record_id = %state.record_id, "escalating without record snapshot: {}", e);
                                    None
                                }
                            };
                        }

                        let ctx = ActionContext {
                            blueprint_id: graph.blueprint.id,
                            module_id: graph.blueprint.module_id,
                            record_id: state.record_id,
                            execution_id: None,
                            transition_name: None,
                            from_state: None,
                            to_state: graph.state(state.current_state_id).map(|s| s.name.clone()),
                            executed_by: None,
                            requirements: Value::Null,
                            record: snapshot
                                .as_ref()
                                .map(|s| Value::Object(s.fields.clone()))
                                .unwrap_or(Value::Null),
                            extra: json!({
                                "sla": {
                                    "name": sla.name,
                                    "percentage_elapsed": status.percentage_elapsed,
                                    "remaining_seconds": status.remaining_seconds,
                                    "due_at": status.due_at,
                                    "is_breached": status.is_breached,
                                },
                                "escalation_id": escalation.id,
                                "trigger": escalation.trigger,
                            }),
                        };
                        let report = self
                            .dispatcher
                            .dispatch(
                                &PlannedAction {
                                    id: escalation.id,
                                    action_type: &escalation.action_type,
                                    config: &escalation.config,
                                    display_order: escalation.display_order,
                                    is_active: true,
                                },
                                &ctx,
                            )
                            .await;

                        if !report.succeeded() {
                            scan.escalation_failures += 1;
                            error!(
                                record_id = %state.record_id,
                                "escalation '{}' on SLA '{}' failed: {}",
                                escalation.action_type,
                                sla.name,
                                report.error.as_deref().unwrap_or("unknown error")
                            );
                        }
                        let result = serde_json::to_value(&report).unwrap_or(Value::Null);
                        self.store
                            .update_escalation_result(state.residency_id, escalation.id, report.succeeded(), result)
                            .await?;
                    }
                }
            }
        }

        if scan.escalations_fired > 0 {
            info!(
                "SLA scan: {} checked, {} breached, {} escalations fired",
                scan.checked, scan.breaches, scan.escalations_fired
            );
        }
        Ok(scan)
    }

    /// Auto-reject approval gates that outlived `auto_reject_days`.
    #[instrument(skip(self))]
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut graphs: HashMap<Uuid, BlueprintGraph> = HashMap::new();
        let mut expired = 0;

        for execution in self.store.executions_with_status(ExecutionStatus::PendingApproval).await? {
            if !graphs.contains_key(&execution.blueprint_id) {
                let graph = self.store.load_graph(execution.blueprint_id).await?;
                graphs.insert(execution.blueprint_id, graph);
            }
            let Some(graph) = graphs.get(&execution.blueprint_id) else { continue };
            let Some(config) = graph.transition(execution.transition_id).and_then(|t| t.approval.as_ref()) else {
                continue;
            };
            let Some(gate) = execution.approval.clone() else { continue };
            if !approval::is_expired(config, &gate, now) {
                continue;
            }

            let days = config.auto_reject_days.unwrap_or_default();
            let mut next = execution.clone();
            next.approval = Some(ApprovalState { status: GateStatus::Rejected, decided_at: Some(now), ..gate });

            let id = execution.id;
            let write = cancellation(
                graph,
                next,
                execution.executed_by,
                Some(approval::auto_reject_reason(days)),
                ApprovalRequestStatus::Expired,
            );
            if self.commit(write).await? {
                expired += 1;
                warn!(execution_id = %id, "approval auto-rejected after {} days", days);
            } else {
                // Decided, cancelled or followed up since we listed it; the
                // next sweep looks again.
                info!(execution_id = %id, "skipping expiry of a changed execution");
            }
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// The record's state, creating it from the driver field on first sight.
    async fn ensure_record_state(
        &self,
        graph: &BlueprintGraph,
        snapshot: &RecordSnapshot,
    ) -> Result<RecordState, EngineError> {
        if let Some(state) = self.store.record_state(graph.blueprint.id, snapshot.record_id).await? {
            return Ok(state);
        }
        let entry = graph.resolve_entry_state(&snapshot.fields).ok_or_else(|| {
            EngineError::PreconditionFailed(format!("blueprint '{}' has no states", graph.blueprint.name))
        })?;
        let state = RecordState::enter(graph.blueprint.id, snapshot.record_id, entry.id, snapshot.created_at);
        let stored = self.store.init_record_state(&state).await?;
        info!(record_id = %snapshot.record_id, "record enters blueprint in state '{}'", entry.name);
        Ok(stored)
    }

    async fn current_record_state(&self, execution: &TransitionExecution) -> Result<RecordState, EngineError> {
        self.store
            .record_state(execution.blueprint_id, execution.record_id)
            .await?
            .ok_or_else(|| EngineError::not_found("record state", execution.record_id))
    }

    /// Resolve approvers and put `execution` into `pending_approval`.
    async fn open_gate(
        &self,
        execution: &mut TransitionExecution,
        approval: &Approval,
        snapshot: &RecordSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        let approvers = approval::resolve_approvers(approval, snapshot, self.approvers.as_ref()).await?;
        if approvers.is_empty() {
            return Err(EngineError::PreconditionFailed(format!(
                "{} approval resolved no approvers",
                approval.approvers.tag()
            )));
        }

        execution.status = ExecutionStatus::PendingApproval;
        execution.approval = Some(ApprovalState {
            status: GateStatus::Pending,
            require_all: approval.require_all,
            entered_at: now,
            decided_at: None,
        });
        info!(approvers = approvers.len(), "approval requested");

        let mut requests = Vec::with_capacity(approvers.len());
        for approver_id in approvers {
            let mut request = ApprovalRequest::pending(execution, approver_id, now);
            if let Some(delegation) = self.delegation_covering(approver_id, execution.blueprint_id, now).await? {
                info!(
                    delegator = %approver_id,
                    delegate = %delegation.delegate_id,
                    "approval request delegated"
                );
                request.hand_to(delegation.delegate_id);
                request.delegation_id = Some(delegation.id);
            }
            requests.push(request);
        }
        Ok(requests)
    }

    /// Apply `write`. `Ok(false)` means a concurrent write got there first and
    /// nothing was changed.
    pub(crate) async fn commit(&self, write: ExecutionWrite) -> Result<bool, EngineError> {
        match self.store.write_execution(write).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(msg)) => {
                debug!("write lost a race: {}", msg);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sla_for(&self, graph: &BlueprintGraph, state: &RecordState, now: DateTime<Utc>) -> Vec<SlaStatus> {
        graph
            .slas_for_state(state.current_state_id)
            .map(|s| {
                sla::status(
                    s,
                    state.state_entered_at,
                    None,
                    now,
                    self.calendar.as_ref(),
                    self.config.default_approaching_percent,
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn contended(execution_id: Uuid) -> EngineError {
    EngineError::PreconditionFailed(format!(
        "execution {execution_id} is being updated concurrently, try again"
    ))
}

/// The write that closes `execution` as cancelled, with its history row.
fn cancellation(
    graph: &BlueprintGraph,
    execution: TransitionExecution,
    actor: Uuid,
    reason: Option<String>,
    close_as: ApprovalRequestStatus,
) -> ExecutionWrite {
    let expected = execution.status;
    let now = Utc::now();

    let mut done = execution;
    done.status = ExecutionStatus::Cancelled;
    done.completed_at = Some(now);
    done.cancellation_reason = reason.clone();

    let history = TransitionHistoryItem {
        id: Uuid::new_v4(),
        blueprint_id: done.blueprint_id,
        record_id: done.record_id,
        execution_id: done.id,
        transition_id: done.transition_id,
        transition_name: graph
            .transition(done.transition_id)
            .map(|t| t.name.clone())
            .unwrap_or_default(),
        from_state: done.from_state,
        to_state: done.to_state,
        executed_by: actor,
        status: HistoryStatus::Cancelled,
        started_at: done.started_at,
        completed_at: now,
        reason,
    };

    let mut write = ExecutionWrite::new(done, expected);
    write.close_pending = Some(close_as);
    write.history = Some(history);
    write
}

fn find_transition(graph: &BlueprintGraph, id: Uuid) -> Result<&Transition, EngineError> {
    graph
        .transition(id)
        .ok_or_else(|| EngineError::not_found("transition", id))
}

fn guard(
    graph: &BlueprintGraph,
    transition: &Transition,
    state: &RecordState,
    snapshot: &RecordSnapshot,
) -> Result<(), EngineError> {
    graph
        .check_available(transition, state.current_state_id, &snapshot.fields)
        .map_err(EngineError::PreconditionFailed)
}

fn progress(
    execution: TransitionExecution,
    transition: &Transition,
    check: requirement::RequirementCheck,
) -> ExecutionProgress {
    let next_step = match (execution.status, execution.gate_status()) {
        (ExecutionStatus::PendingRequirements, _) if !check.satisfied => NextStep::AwaitingMoreRequirements,
        (ExecutionStatus::PendingApproval, Some(GateStatus::Approved)) => NextStep::ReadyToComplete,
        (ExecutionStatus::PendingApproval, _) => NextStep::ReadyForApproval,
        _ => NextStep::ReadyToComplete,
    };
    ExecutionProgress {
        requirements: requirement::format_requirements(&transition.requirements),
        unmet: check.unmet,
        errors: check.errors,
        next_step,
        execution,
    }
}
