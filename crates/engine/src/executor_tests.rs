//! Orchestrator tests for the blueprint engine.
//!
//! Everything runs against `MemoryStore`, `MemoryRecords` and `MockHandler`,
//! so no database is required. Races are exercised through [`Yielding`],
//! which hands control back to the scheduler before every store call so that
//! commands joined on one task really interleave.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use actions::mock::MockHandler;

use crate::approval::{Decision, StaticDirectory};
use crate::authoring::Authoring;
use crate::dispatch::ActionOutcome;
use crate::executor::{BlueprintEngine, EngineBuilder, NextStep};
use crate::followup::FollowUpReport;
use crate::graph::BlueprintGraph;
use crate::models::{
    Approval, ApproverSource, Blueprint, BlueprintSla, ChecklistItem, Condition, EscalationTarget,
    EscalationTrigger, Requirement, RequirementKind, SlaEscalation, SourceState, State, Transition,
    TransitionAction,
};
use crate::record::{MemoryRecords, RecordSnapshot};
use crate::requirement::{AttachmentDescriptor, RequirementSubmission};
use crate::runtime::{
    ApprovalRequest, ApprovalRequestStatus, Delegation, EscalationLog, ExecutionStatus, GateStatus,
    HistoryStatus, RecordState, TransitionExecution, TransitionHistoryItem,
};
use crate::store::{BlueprintStore, ExecutionWrite, MemoryStore, StoreError};
use crate::sweeper::Sweeper;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// "Deal Pipeline": New → Qualified → Won, plus a global "Reopen" back to New.
struct Pipeline {
    graph: BlueprintGraph,
    new: Uuid,
    qualified: Uuid,
    won: Uuid,
    qualify: Uuid,
    win: Uuid,
    reopen: Uuid,
}

fn pipeline(customize_qualify: impl FnOnce(&mut Transition)) -> Pipeline {
    let bp = Blueprint::new("Deal Pipeline", Uuid::new_v4(), "stage");
    let new = State::new(bp.id, "New").with_option("new").initial();
    let qualified = State::new(bp.id, "Qualified").with_option("qualified");
    let won = State::new(bp.id, "Won").with_option("won").terminal();

    let mut qualify = Transition::new(bp.id, "Qualify", SourceState::State(new.id), qualified.id);
    customize_qualify(&mut qualify);
    let win = Transition::new(bp.id, "Win", SourceState::State(qualified.id), won.id);
    let mut reopen = Transition::new(bp.id, "Reopen", SourceState::Any, new.id);
    reopen.display_order = 99;

    Pipeline {
        new: new.id,
        qualified: qualified.id,
        won: won.id,
        qualify: qualify.id,
        win: win.id,
        reopen: reopen.id,
        graph: BlueprintGraph {
            blueprint: bp,
            states: vec![new, qualified, won],
            transitions: vec![qualify, win, reopen],
            slas: vec![],
        },
    }
}

fn note_required(t: &mut Transition) {
    t.requirements.push(Requirement::new(RequirementKind::Note { min_length: None }));
}

struct Harness {
    engine: Arc<BlueprintEngine>,
    store: Arc<MemoryStore>,
    records: Arc<MemoryRecords>,
    p: Pipeline,
}

impl Harness {
    fn bp(&self) -> Uuid {
        self.p.graph.blueprint.id
    }

    fn record(&self, fields: Value) -> Uuid {
        self.record_created(fields, Utc::now())
    }

    fn record_created(&self, fields: Value, created_at: chrono::DateTime<Utc>) -> Uuid {
        let mut snapshot = RecordSnapshot::new(self.p.graph.blueprint.module_id, fields);
        snapshot.created_at = created_at;
        snapshot.owner_id = Some(Uuid::new_v4());
        let id = snapshot.record_id;
        self.records.insert(snapshot);
        id
    }

    async fn current_state(&self, record: Uuid) -> Uuid {
        self.store
            .record_state(self.bp(), record)
            .await
            .unwrap()
            .expect("record state initialised")
            .current_state_id
    }
}

async fn harness(p: Pipeline, configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Harness {
    build_harness(p, false, configure).await
}

/// Like [`harness`], but the engine talks to the store through [`Yielding`].
async fn racing_harness(p: Pipeline, configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Harness {
    build_harness(p, true, configure).await
}

async fn build_harness(
    p: Pipeline,
    yielding: bool,
    configure: impl FnOnce(EngineBuilder) -> EngineBuilder,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let records = Arc::new(MemoryRecords::new());
    Authoring::new(store.clone())
        .import_graph(p.graph.clone())
        .await
        .expect("fixture graph is valid");

    let engine_store: Arc<dyn BlueprintStore> = if yielding {
        Arc::new(Yielding(store.clone()))
    } else {
        store.clone()
    };
    let builder = BlueprintEngine::builder(engine_store).records(records.clone());
    let engine = Arc::new(configure(builder).build());
    Harness { engine, store, records, p }
}

/// `MemoryStore` that yields to the scheduler before every call.
struct Yielding(Arc<MemoryStore>);

#[async_trait]
impl BlueprintStore for Yielding {
    async fn load_graph(&self, blueprint_id: Uuid) -> Result<BlueprintGraph, StoreError> {
        tokio::task::yield_now().await;
        self.0.load_graph(blueprint_id).await
    }

    async fn list_blueprints(&self, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, StoreError> {
        tokio::task::yield_now().await;
        self.0.list_blueprints(module_id).await
    }

    async fn put_blueprint(&self, blueprint: &Blueprint) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_blueprint(blueprint).await
    }

    async fn delete_blueprint(&self, id: Uuid) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_blueprint(id).await
    }

    async fn put_state(&self, state: &State) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_state(state).await
    }

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_state(id).await
    }

    async fn put_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_transition(transition).await
    }

    async fn delete_transition(&self, id: Uuid) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_transition(id).await
    }

    async fn put_sla(&self, sla: &BlueprintSla) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.put_sla(sla).await
    }

    async fn delete_sla(&self, id: Uuid) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.delete_sla(id).await
    }

    async fn record_state(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Option<RecordState>, StoreError> {
        tokio::task::yield_now().await;
        self.0.record_state(blueprint_id, record_id).await
    }

    async fn init_record_state(&self, state: &RecordState) -> Result<RecordState, StoreError> {
        tokio::task::yield_now().await;
        self.0.init_record_state(state).await
    }

    async fn record_states(&self, blueprint_id: Uuid) -> Result<Vec<RecordState>, StoreError> {
        tokio::task::yield_now().await;
        self.0.record_states(blueprint_id).await
    }

    async fn insert_execution(
        &self,
        execution: &TransitionExecution,
        requests: &[ApprovalRequest],
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.insert_execution(execution, requests).await
    }

    async fn execution(&self, id: Uuid) -> Result<TransitionExecution, StoreError> {
        tokio::task::yield_now().await;
        self.0.execution(id).await
    }

    async fn executions_for_record(&self, record_id: Uuid) -> Result<Vec<TransitionExecution>, StoreError> {
        tokio::task::yield_now().await;
        self.0.executions_for_record(record_id).await
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<TransitionExecution>, StoreError> {
        tokio::task::yield_now().await;
        self.0.executions_with_status(status).await
    }

    async fn write_execution(&self, write: ExecutionWrite) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.write_execution(write).await
    }

    async fn approval_request(&self, id: Uuid) -> Result<ApprovalRequest, StoreError> {
        tokio::task::yield_now().await;
        self.0.approval_request(id).await
    }

    async fn approval_requests(&self, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        tokio::task::yield_now().await;
        self.0.approval_requests(execution_id).await
    }

    async fn pending_approvals_for(&self, approver_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        tokio::task::yield_now().await;
        self.0.pending_approvals_for(approver_id).await
    }

    async fn history(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Vec<TransitionHistoryItem>, StoreError> {
        tokio::task::yield_now().await;
        self.0.history(blueprint_id, record_id).await
    }

    async fn mark_escalation_fired(&self, log: &EscalationLog) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.0.mark_escalation_fired(log).await
    }

    async fn update_escalation_result(
        &self,
        residency_id: Uuid,
        escalation_id: Uuid,
        succeeded: bool,
        result: Value,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.update_escalation_result(residency_id, escalation_id, succeeded, result).await
    }

    async fn escalation_logs(&self, residency_id: Uuid) -> Result<Vec<EscalationLog>, StoreError> {
        tokio::task::yield_now().await;
        self.0.escalation_logs(residency_id).await
    }

    async fn insert_delegation(&self, delegation: &Delegation) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.insert_delegation(delegation).await
    }

    async fn delegation(&self, id: Uuid) -> Result<Delegation, StoreError> {
        tokio::task::yield_now().await;
        self.0.delegation(id).await
    }

    async fn deactivate_delegation(&self, id: Uuid) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.0.deactivate_delegation(id).await
    }

    async fn delegations_for(&self, user_id: Uuid) -> Result<Vec<Delegation>, StoreError> {
        tokio::task::yield_now().await;
        self.0.delegations_for(user_id).await
    }
}

fn precondition<T: std::fmt::Debug>(result: Result<T, EngineError>) -> String {
    match result {
        Err(EngineError::PreconditionFailed(msg)) => msg,
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }
}

// ============================================================
// End-to-end scenario
// ============================================================

#[tokio::test]
async fn deal_pipeline_end_to_end() {
    let h = harness(pipeline(note_required), |b| b).await;
    let user = Uuid::new_v4();
    let record = h.record(json!({ "stage": "new", "name": "ACME" }));

    let started = h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();
    assert_eq!(started.execution.status, ExecutionStatus::PendingRequirements);
    assert_eq!(started.next_step, NextStep::AwaitingMoreRequirements);
    assert_eq!(started.requirements.len(), 1);
    assert_eq!(started.requirements[0].kind, "note");

    let submitted = h
        .engine
        .submit_requirements(started.execution.id, RequirementSubmission::note("called"))
        .await
        .unwrap();
    assert!(submitted.unmet.is_empty());
    assert_eq!(submitted.next_step, NextStep::ReadyToComplete);

    let done = h.engine.complete(started.execution.id).await.unwrap();
    assert_eq!(done.execution.status, ExecutionStatus::Completed);
    assert_eq!(h.current_state(record).await, h.p.qualified);
    assert_eq!(done.field_writes.len(), 1);
    assert_eq!(done.field_writes[0].field, "stage");
    assert_eq!(done.field_writes[0].value, json!("qualified"));

    let history = h.engine.history(h.bp(), record).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_state, Some(h.p.new));
    assert_eq!(history[0].to_state, h.p.qualified);
    assert_eq!(history[0].status, HistoryStatus::Completed);
    assert_eq!(history[0].executed_by, user);
}

// ============================================================
// Start
// ============================================================

#[tokio::test]
async fn concurrent_starts_for_same_pair_only_one_wins() {
    let h = racing_harness(pipeline(note_required), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let user = Uuid::new_v4();

    let (a, b) = tokio::join!(
        h.engine.start(h.bp(), record, h.p.qualify, user, None),
        h.engine.start(h.bp(), record, h.p.qualify, user, None),
    );

    let ok = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(ok, 1);
    let failed = if a.is_err() { a } else { b };
    precondition(failed);
    assert_eq!(h.store.executions_for_record(record).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unavailable_transition_cannot_start() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));

    // Win only leaves Qualified.
    precondition(h.engine.start(h.bp(), record, h.p.win, Uuid::new_v4(), None).await);

    let err = h.engine.start(h.bp(), record, Uuid::new_v4(), Uuid::new_v4(), None).await;
    assert!(matches!(err, Err(EngineError::NotFound { kind: "transition", .. })));
}

#[tokio::test]
async fn record_state_initialised_from_driver_field() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let created = Utc::now() - Duration::hours(3);
    let record = h.record_created(json!({ "stage": "qualified" }), created);

    let available = h.engine.available_transitions(h.bp(), record).await.unwrap();
    let names: Vec<_> = available.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Win", "Reopen"]);

    let state = h.store.record_state(h.bp(), record).await.unwrap().unwrap();
    assert_eq!(state.current_state_id, h.p.qualified);
    assert_eq!(state.state_entered_at, created);
}

#[tokio::test]
async fn terminal_state_offers_no_transitions() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let record = h.record(json!({ "stage": "won" }));
    assert!(h.engine.available_transitions(h.bp(), record).await.unwrap().is_empty());
    precondition(h.engine.start(h.bp(), record, h.p.reopen, Uuid::new_v4(), None).await);
    assert_eq!(h.current_state(record).await, h.p.won);
}

#[tokio::test]
async fn inactive_blueprint_rejects_start() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    Authoring::new(h.store.clone()).set_active(h.bp(), false).await.unwrap();
    let record = h.record(json!({ "stage": "new" }));
    precondition(h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await);
}

// ============================================================
// Requirement gating
// ============================================================

#[tokio::test]
async fn complete_fails_for_every_unmet_requirement_kind() {
    let kinds = vec![
        RequirementKind::MandatoryField { field: "close_reason".into() },
        RequirementKind::Attachment { min_count: Some(1), max_size: None, allowed_types: vec![] },
        RequirementKind::Note { min_length: Some(5) },
        RequirementKind::Checklist {
            items: vec![ChecklistItem { id: "budget".into(), label: "Budget confirmed".into(), required: true }],
        },
    ];

    for kind in kinds {
        let tag = kind.tag();
        let h = harness(pipeline(|t| t.requirements.push(Requirement::new(kind))), |b| b).await;
        let record = h.record(json!({ "stage": "new" }));
        let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

        let msg = precondition(h.engine.complete(started.execution.id).await);
        assert!(msg.contains("requirements not met"), "{tag}: {msg}");
        assert_eq!(h.current_state(record).await, h.p.new, "{tag}");
        assert!(h.engine.history(h.bp(), record).await.unwrap().is_empty(), "{tag}");
    }
}

#[tokio::test]
async fn submissions_accumulate_across_calls() {
    let h = harness(
        pipeline(|t| {
            t.requirements.push(Requirement::new(RequirementKind::Note { min_length: None }));
            t.requirements.push(Requirement::new(RequirementKind::Attachment {
                min_count: None,
                max_size: Some(1024),
                allowed_types: vec!["application/pdf".into()],
            }));
        }),
        |b| b,
    )
    .await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    assert_eq!(started.unmet.len(), 2);

    let step = h
        .engine
        .submit_requirements(started.execution.id, RequirementSubmission::note("met the buyer"))
        .await
        .unwrap();
    assert_eq!(step.unmet.len(), 1);
    assert_eq!(step.next_step, NextStep::AwaitingMoreRequirements);

    let attachment = RequirementSubmission {
        attachments: vec![AttachmentDescriptor {
            name: "quote.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 512,
            requirement_id: None,
        }],
        ..RequirementSubmission::default()
    };
    let step = h.engine.submit_requirements(started.execution.id, attachment).await.unwrap();
    assert!(step.unmet.is_empty());
    assert_eq!(step.execution.submission.note.as_deref(), Some("met the buyer"));

    h.engine.complete(started.execution.id).await.unwrap();
}

#[tokio::test]
async fn concurrent_submissions_are_both_kept() {
    let h = racing_harness(
        pipeline(|t| {
            note_required(t);
            t.requirements.push(Requirement::new(RequirementKind::MandatoryField { field: "budget".into() }));
        }),
        |b| b,
    )
    .await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    let mut fields = serde_json::Map::new();
    fields.insert("budget".into(), json!(50_000));
    let (a, b) = tokio::join!(
        h.engine.submit_requirements(started.execution.id, RequirementSubmission::note("met the buyer")),
        h.engine.submit_requirements(
            started.execution.id,
            RequirementSubmission { fields, ..RequirementSubmission::default() },
        ),
    );
    a.unwrap();
    b.unwrap();

    let execution = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(execution.submission.note.as_deref(), Some("met the buyer"));
    assert_eq!(execution.submission.fields.get("budget"), Some(&json!(50_000)));
    assert_eq!(execution.version, 2);
    h.engine.complete(started.execution.id).await.unwrap();
}

#[tokio::test]
async fn initial_data_can_satisfy_requirements() {
    let h = harness(pipeline(note_required), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h
        .engine
        .start(h.bp(), record, h.p.qualify, Uuid::new_v4(), Some(RequirementSubmission::note("done")))
        .await
        .unwrap();
    assert_eq!(started.next_step, NextStep::ReadyToComplete);
    h.engine.complete(started.execution.id).await.unwrap();
}

// ============================================================
// Guards and atomicity
// ============================================================

#[tokio::test]
async fn guard_is_rechecked_at_completion() {
    let h = harness(
        pipeline(|t| t.conditions.push(Condition::new("amount", "greater_than", json!(1000)))),
        |b| b,
    )
    .await;
    let record = h.record(json!({ "stage": "new", "amount": 5000 }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    h.records.set_field(record, "amount", json!(10));
    precondition(h.engine.complete(started.execution.id).await);
    assert_eq!(h.current_state(record).await, h.p.new);

    let execution = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::PendingRequirements);
}

#[tokio::test]
async fn stale_execution_fails_once_record_has_moved() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let user = Uuid::new_v4();

    let qualify = h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();
    let reopen = h.engine.start(h.bp(), record, h.p.reopen, user, None).await.unwrap();

    // Reopen re-enters New, so Qualify is still legal afterwards.
    h.engine.complete(reopen.execution.id).await.unwrap();
    h.engine.complete(qualify.execution.id).await.unwrap();
    assert_eq!(h.current_state(record).await, h.p.qualified);

    // Both are open from Qualified; once Win lands in a terminal state the
    // global Reopen is no longer available.
    let stale = h.engine.start(h.bp(), record, h.p.reopen, user, None).await.unwrap();
    let win = h.engine.start(h.bp(), record, h.p.win, user, None).await.unwrap();
    h.engine.complete(win.execution.id).await.unwrap();
    precondition(h.engine.complete(stale.execution.id).await);
    assert_eq!(h.current_state(record).await, h.p.won);
    assert_eq!(h.engine.history(h.bp(), record).await.unwrap().len(), 3);
}

#[tokio::test]
async fn completed_execution_is_immutable() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let user = Uuid::new_v4();
    let started = h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();
    let done = h.engine.complete(started.execution.id).await.unwrap();

    precondition(h.engine.complete(started.execution.id).await);
    precondition(h.engine.cancel(started.execution.id, user, None).await);
    precondition(
        h.engine
            .submit_requirements(started.execution.id, RequirementSubmission::note("late"))
            .await,
    );

    let stored = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(stored.to_state, h.p.qualified);
    assert_eq!(stored.completed_at, done.execution.completed_at);
    let history = h.engine.history(h.bp(), record).await.unwrap();
    assert_eq!(history, vec![done.history]);
}

#[tokio::test]
async fn cancel_keeps_state_and_frees_the_slot() {
    let h = harness(pipeline(note_required), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let user = Uuid::new_v4();
    let started = h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();

    let cancelled = h
        .engine
        .cancel(started.execution.id, user, Some("duplicate deal".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(h.current_state(record).await, h.p.new);

    let history = h.engine.history(h.bp(), record).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Cancelled);
    assert_eq!(history[0].reason.as_deref(), Some("duplicate deal"));

    h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();
}

// ============================================================
// Actions
// ============================================================

#[tokio::test]
async fn actions_run_in_order_after_commit_and_failures_are_reported() {
    let journal = Arc::new(std::sync::Mutex::new(Vec::new()));
    let notify = Arc::new(MockHandler::returning("notify_user", json!("sent")).journaled(journal.clone()));
    let webhook = Arc::new(MockHandler::failing_fatal("webhook", "endpoint returned 410").journaled(journal.clone()));
    let tag = Arc::new(MockHandler::returning("add_tag", json!("tagged")).journaled(journal.clone()));

    let p = pipeline(|t| {
        let mut a = TransitionAction::new("notify_user", json!({ "message": "{{record.name}} qualified" }));
        a.display_order = 3;
        let mut b = TransitionAction::new("webhook", json!({ "url": "https://example.invalid" }));
        b.display_order = 1;
        let mut c = TransitionAction::new("add_tag", json!({ "tag": "hot" }));
        c.display_order = 2;
        c.is_active = false;
        let mut d = TransitionAction::new("create_task", json!({}));
        d.display_order = 4;
        t.actions = vec![a, b, c, d];
    });
    let h = harness(p, |b| {
        b.handler("notify_user", notify.clone())
            .handler("webhook", webhook.clone())
            .handler("add_tag", tag.clone())
    })
    .await;

    let record = h.record(json!({ "stage": "new", "name": "ACME" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    let done = h.engine.complete(started.execution.id).await.unwrap();

    assert_eq!(h.current_state(record).await, h.p.qualified);
    assert_eq!(*journal.lock().unwrap(), vec!["webhook", "notify_user"]);

    let outcomes: Vec<_> = done.actions.iter().map(|a| (a.action_type.as_str(), a.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            ("webhook", ActionOutcome::Failed),
            ("add_tag", ActionOutcome::Skipped),
            ("notify_user", ActionOutcome::Succeeded),
            ("create_task", ActionOutcome::Failed),
        ]
    );
    assert_eq!(done.failed_actions().count(), 2);
    assert_eq!(tag.call_count(), 0);
}

// ============================================================
// Approval gate
// ============================================================

fn with_approval(approval: Approval) -> impl FnOnce(&mut Transition) {
    move |t| t.approval = Some(approval)
}

#[tokio::test]
async fn require_all_needs_every_approver() {
    let approvers = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let directory = StaticDirectory::default().with_role("finance", approvers.clone());
    let mut approval = Approval::new(ApproverSource::RoleBased { role_ids: vec!["finance".into()] });
    approval.require_all = true;

    let h = harness(pipeline(with_approval(approval)), |b| b.approvers(Arc::new(directory))).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    assert_eq!(started.execution.status, ExecutionStatus::PendingApproval);
    assert_eq!(started.next_step, NextStep::ReadyForApproval);

    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();
    assert_eq!(requests.len(), 3);

    for (i, request) in requests.iter().enumerate() {
        let outcome = h
            .engine
            .decide(request.id, request.approver_id, Decision::Approve, None)
            .await
            .unwrap();
        if i < 2 {
            assert_eq!(outcome.gate, GateStatus::Pending);
            precondition(h.engine.complete(started.execution.id).await);
        } else {
            assert_eq!(outcome.gate, GateStatus::Approved);
        }
    }

    h.engine.complete(started.execution.id).await.unwrap();
    assert_eq!(h.current_state(record).await, h.p.qualified);
}

#[tokio::test]
async fn single_rejection_rejects_require_all_gate() {
    let approvers = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let mut approval = Approval::new(ApproverSource::SpecificUsers { user_ids: approvers.clone() });
    approval.require_all = true;

    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();

    h.engine.decide(requests[0].id, requests[0].approver_id, Decision::Approve, None).await.unwrap();
    let outcome = h
        .engine
        .decide(requests[1].id, requests[1].approver_id, Decision::Reject, Some("margin too low".into()))
        .await
        .unwrap();
    assert_eq!(outcome.gate, GateStatus::Rejected);
    assert_eq!(outcome.execution.status, ExecutionStatus::Cancelled);

    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();
    let statuses: Vec<_> = requests.iter().map(|r| r.status).collect();
    assert!(statuses.contains(&ApprovalRequestStatus::Approved));
    assert!(statuses.contains(&ApprovalRequestStatus::Rejected));
    assert!(statuses.contains(&ApprovalRequestStatus::Superseded));

    let history = h.engine.history(h.bp(), record).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Cancelled);
    assert!(history[0].reason.as_deref().unwrap().contains("margin too low"));
    assert_eq!(h.current_state(record).await, h.p.new);
}

#[tokio::test]
async fn concurrent_approvals_both_count() {
    let approvers = vec![Uuid::new_v4(), Uuid::new_v4()];
    let mut approval = Approval::new(ApproverSource::SpecificUsers { user_ids: approvers.clone() });
    approval.require_all = true;

    let h = racing_harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();

    let (a, b) = tokio::join!(
        h.engine.decide(requests[0].id, requests[0].approver_id, Decision::Approve, None),
        h.engine.decide(requests[1].id, requests[1].approver_id, Decision::Approve, None),
    );
    let gates = [a.unwrap().gate, b.unwrap().gate];
    assert!(gates.contains(&GateStatus::Approved), "{gates:?}");

    let execution = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(execution.gate_status(), Some(GateStatus::Approved));
    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();
    assert!(requests.iter().all(|r| r.status == ApprovalRequestStatus::Approved));

    h.engine.complete(started.execution.id).await.unwrap();
    assert_eq!(h.current_state(record).await, h.p.qualified);
}

#[tokio::test]
async fn first_decision_wins_without_require_all() {
    let approvers = vec![Uuid::new_v4(), Uuid::new_v4()];
    let approval = Approval::new(ApproverSource::SpecificUsers { user_ids: approvers.clone() });

    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();

    let outcome = h
        .engine
        .decide(requests[0].id, requests[0].approver_id, Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(outcome.gate, GateStatus::Approved);

    // The other approver's slot is closed.
    assert!(h.engine.pending_approvals(requests[1].approver_id).await.unwrap().is_empty());
    precondition(h.engine.decide(requests[1].id, requests[1].approver_id, Decision::Reject, None).await);

    h.engine.complete(started.execution.id).await.unwrap();
}

#[tokio::test]
async fn only_the_assigned_approver_may_decide() {
    let approver = Uuid::new_v4();
    let approval = Approval::new(ApproverSource::SpecificUsers { user_ids: vec![approver] });
    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    let pending = h.engine.pending_approvals(approver).await.unwrap();
    assert_eq!(pending.len(), 1);
    precondition(h.engine.decide(pending[0].id, Uuid::new_v4(), Decision::Approve, None).await);

    let execution = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(execution.gate_status(), Some(GateStatus::Pending));
}

#[tokio::test]
async fn gate_opens_once_requirements_are_met() {
    let approver = Uuid::new_v4();
    let approval = Approval::new(ApproverSource::SpecificUsers { user_ids: vec![approver] });
    let h = harness(
        pipeline(|t| {
            note_required(t);
            t.approval = Some(approval);
        }),
        |b| b,
    )
    .await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    assert_eq!(started.execution.status, ExecutionStatus::PendingRequirements);
    assert!(h.engine.pending_approvals(approver).await.unwrap().is_empty());

    let step = h
        .engine
        .submit_requirements(started.execution.id, RequirementSubmission::note("ok"))
        .await
        .unwrap();
    assert_eq!(step.execution.status, ExecutionStatus::PendingApproval);
    assert_eq!(step.next_step, NextStep::ReadyForApproval);
    assert_eq!(h.engine.pending_approvals(approver).await.unwrap().len(), 1);
}

#[tokio::test]
async fn gate_without_approvers_fails_start() {
    let approval = Approval::new(ApproverSource::Manager { levels: 1 });
    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));

    let msg = precondition(h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await);
    assert!(msg.contains("no approvers"));
    assert!(h.store.executions_for_record(record).await.unwrap().is_empty());
}

#[tokio::test]
async fn unanswered_gate_is_auto_rejected() {
    let approver = Uuid::new_v4();
    let mut approval = Approval::new(ApproverSource::SpecificUsers { user_ids: vec![approver] });
    approval.auto_reject_days = Some(2);
    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    assert_eq!(h.engine.expire_approvals(Utc::now() + Duration::days(1)).await.unwrap(), 0);
    assert_eq!(h.engine.expire_approvals(Utc::now() + Duration::days(3)).await.unwrap(), 1);

    let execution = h.engine.execution(started.execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.gate_status(), Some(GateStatus::Rejected));
    assert_eq!(
        execution.cancellation_reason.as_deref(),
        Some("Automatically rejected after 2 days without response")
    );
    let requests = h.engine.approval_requests(started.execution.id).await.unwrap();
    assert_eq!(requests[0].status, ApprovalRequestStatus::Expired);
    assert_eq!(h.current_state(record).await, h.p.new);
}

// ============================================================
// SLA
// ============================================================

fn with_breach_escalation(p: &mut Pipeline) {
    let mut sla = BlueprintSla::new(p.graph.blueprint.id, p.new, "first contact", 4);
    sla.escalations.push(SlaEscalation::new(EscalationTrigger::Breached, None, "notify_user"));
    p.graph.slas.push(sla);
}

#[tokio::test]
async fn escalation_fires_once_per_residency() {
    let notify = Arc::new(MockHandler::returning("notify_user", json!("paged")));
    let mut p = pipeline(|_| {});
    with_breach_escalation(&mut p);
    let h = harness(p, |b| b.handler("notify_user", notify.clone())).await;

    let record = h.record_created(json!({ "stage": "new" }), Utc::now() - Duration::hours(5));
    let overview = h.engine.record_overview(h.bp(), record, Utc::now()).await.unwrap();
    assert_eq!(overview.current_state.id, h.p.new);
    assert!(overview.sla[0].is_breached);
    assert!(overview.sla[0].percentage_elapsed >= 100.0);

    let first = h.engine.scan_slas(Utc::now()).await.unwrap();
    assert_eq!(first.escalations_fired, 1);
    assert_eq!(first.breaches, 1);
    let second = h.engine.scan_slas(Utc::now()).await.unwrap();
    assert_eq!(second.escalations_fired, 0);
    assert_eq!(notify.call_count(), 1);

    // Leaving and re-entering New starts a new residency.
    let user = Uuid::new_v4();
    let q = h.engine.start(h.bp(), record, h.p.qualify, user, None).await.unwrap();
    h.engine.complete(q.execution.id).await.unwrap();
    let r = h.engine.start(h.bp(), record, h.p.reopen, user, None).await.unwrap();
    h.engine.complete(r.execution.id).await.unwrap();

    assert_eq!(h.engine.scan_slas(Utc::now()).await.unwrap().escalations_fired, 0);
    let later = h.engine.scan_slas(Utc::now() + Duration::hours(5)).await.unwrap();
    assert_eq!(later.escalations_fired, 1);
    assert_eq!(notify.call_count(), 2);
}

#[tokio::test]
async fn failed_escalation_is_logged_not_retried() {
    let mut p = pipeline(|_| {});
    with_breach_escalation(&mut p);
    let h = harness(p, |b| b).await;
    let record = h.record_created(json!({ "stage": "new" }), Utc::now() - Duration::hours(5));
    h.engine.available_transitions(h.bp(), record).await.unwrap();

    let scan = h.engine.scan_slas(Utc::now()).await.unwrap();
    assert_eq!(scan.escalations_fired, 1);
    assert_eq!(scan.escalation_failures, 1);

    let residency = h.store.record_state(h.bp(), record).await.unwrap().unwrap().residency_id;
    let logs = h.store.escalation_logs(residency).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].succeeded);

    assert_eq!(h.engine.scan_slas(Utc::now()).await.unwrap().escalations_fired, 0);
}

#[tokio::test]
async fn sweeper_combines_sla_scan_and_approval_expiry() {
    let notify = Arc::new(MockHandler::returning("notify_user", json!("paged")));
    let approver = Uuid::new_v4();
    let mut approval = Approval::new(ApproverSource::SpecificUsers { user_ids: vec![approver] });
    approval.auto_reject_days = Some(1);
    let mut p = pipeline(with_approval(approval));
    with_breach_escalation(&mut p);
    let h = harness(p, |b| b.handler("notify_user", notify.clone())).await;

    let record = h.record_created(json!({ "stage": "new" }), Utc::now() - Duration::hours(5));
    h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    let report = Sweeper::new(h.engine.clone())
        .sweep_once(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.breaches, 1);
    assert_eq!(report.escalations_fired, 1);
    assert_eq!(report.escalation_failures, 0);
    assert_eq!(report.approvals_expired, 1);
}

// ============================================================
// Delegation, reassignment and follow-up
// ============================================================

fn single_approver(approver: Uuid) -> Approval {
    Approval::new(ApproverSource::SpecificUsers { user_ids: vec![approver] })
}

fn an_hour_ago() -> DateTime<Utc> {
    Utc::now() - Duration::hours(1)
}

#[tokio::test]
async fn delegation_redirects_gates_opened_while_in_effect() {
    let (approver, delegate) = (Uuid::new_v4(), Uuid::new_v4());
    let h = harness(pipeline(with_approval(single_approver(approver))), |b| b).await;

    let delegation = h
        .engine
        .create_delegation(Delegation::new(approver, delegate, an_hour_ago()).because("on leave"))
        .await
        .unwrap();

    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    assert!(h.engine.pending_approvals(approver).await.unwrap().is_empty());
    let pending = h.engine.pending_approvals(delegate).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].original_approver_id, Some(approver));
    assert_eq!(pending[0].delegation_id, Some(delegation.id));

    let overview = h.engine.delegations(delegate, Utc::now()).await.unwrap();
    assert!(overview.outgoing.is_empty());
    assert_eq!(overview.incoming.len(), 1);

    h.engine.decide(pending[0].id, delegate, Decision::Approve, None).await.unwrap();
    h.engine.complete(started.execution.id).await.unwrap();

    // Once ended, new gates go back to the approver.
    precondition(h.engine.end_delegation(delegation.id, delegate).await);
    h.engine.end_delegation(delegation.id, approver).await.unwrap();
    let r = h.engine.start(h.bp(), record, h.p.reopen, Uuid::new_v4(), None).await.unwrap();
    h.engine.complete(r.execution.id).await.unwrap();
    h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    assert_eq!(h.engine.pending_approvals(approver).await.unwrap().len(), 1);
    assert!(h.engine.pending_approvals(delegate).await.unwrap().is_empty());
}

#[tokio::test]
async fn delegation_rules() {
    let h = harness(pipeline(|_| {}), |b| b).await;
    let (user, other) = (Uuid::new_v4(), Uuid::new_v4());

    let own = h.engine.create_delegation(Delegation::new(user, user, Utc::now())).await;
    assert!(matches!(own, Err(EngineError::ValidationFailed(_))), "{own:?}");
    let backwards = h
        .engine
        .create_delegation(Delegation::new(user, other, Utc::now()).until(an_hour_ago()))
        .await;
    assert!(matches!(backwards, Err(EngineError::ValidationFailed(_))), "{backwards:?}");

    h.engine.create_delegation(Delegation::new(user, other, Utc::now())).await.unwrap();
    precondition(h.engine.create_delegation(Delegation::new(user, Uuid::new_v4(), Utc::now())).await);
}

#[tokio::test]
async fn reassigned_request_moves_to_the_new_approver() {
    let (approver, stand_in) = (Uuid::new_v4(), Uuid::new_v4());
    let h = harness(pipeline(with_approval(single_approver(approver))), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();
    let request = h.engine.pending_approvals(approver).await.unwrap().remove(0);

    precondition(h.engine.reassign(request.id, approver, Uuid::new_v4(), None).await);
    let moved = h
        .engine
        .reassign(request.id, stand_in, Uuid::new_v4(), Some("out of office".into()))
        .await
        .unwrap();
    assert_eq!(moved.approver_id, stand_in);
    assert_eq!(moved.original_approver_id, Some(approver));

    precondition(h.engine.decide(request.id, approver, Decision::Approve, None).await);
    h.engine.decide(request.id, stand_in, Decision::Approve, None).await.unwrap();
    precondition(h.engine.reassign(request.id, approver, Uuid::new_v4(), None).await);
    h.engine.complete(started.execution.id).await.unwrap();
}

#[tokio::test]
async fn unanswered_request_is_reminded_then_escalated_once() {
    let notify = Arc::new(MockHandler::returning("notify_user", json!("sent")));
    let (requester, approver, boss) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut approval = single_approver(approver);
    approval.reminder_hours = Some(4);
    approval.max_reminders = 2;
    approval.escalation_hours = Some(24);
    approval.escalate_to = Some(EscalationTarget::Manager);
    let directory = StaticDirectory::default().with_manager(requester, boss);

    let h = harness(pipeline(with_approval(approval)), |b| {
        b.approvers(Arc::new(directory)).handler("notify_user", notify.clone())
    })
    .await;
    let record = h.record(json!({ "stage": "new" }));
    let started = h.engine.start(h.bp(), record, h.p.qualify, requester, None).await.unwrap();
    let t0 = Utc::now();

    let report = Sweeper::new(h.engine.clone()).sweep_once(t0 + Duration::hours(5)).await.unwrap();
    assert_eq!(report.approval_reminders, 1);
    assert_eq!(report.approvals_escalated, 0);

    let again = h.engine.follow_up_approvals(t0 + Duration::hours(6)).await.unwrap();
    assert_eq!(again.reminders_sent, 0);
    assert_eq!(h.engine.follow_up_approvals(t0 + Duration::hours(10)).await.unwrap().reminders_sent, 1);
    assert_eq!(h.engine.follow_up_approvals(t0 + Duration::hours(15)).await.unwrap().reminders_sent, 0);

    let escalation = h.engine.follow_up_approvals(t0 + Duration::hours(25)).await.unwrap();
    assert_eq!(escalation.escalated, 1);
    assert_eq!(escalation.reminders_sent, 0);
    assert!(h.engine.pending_approvals(approver).await.unwrap().is_empty());
    let escalated = h.engine.pending_approvals(boss).await.unwrap();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].original_approver_id, Some(approver));
    assert_eq!(escalated[0].reminder_count, 2);

    assert_eq!(h.engine.follow_up_approvals(t0 + Duration::hours(60)).await.unwrap(), FollowUpReport::default());
    assert_eq!(notify.call_count(), 3);

    h.engine.decide(escalated[0].id, boss, Decision::Approve, None).await.unwrap();
    h.engine.complete(started.execution.id).await.unwrap();
}

#[tokio::test]
async fn escalation_without_a_target_is_counted() {
    let approver = Uuid::new_v4();
    let mut approval = single_approver(approver);
    approval.escalation_hours = Some(1);
    approval.escalate_to = Some(EscalationTarget::Manager);
    let h = harness(pipeline(with_approval(approval)), |b| b).await;
    let record = h.record(json!({ "stage": "new" }));
    h.engine.start(h.bp(), record, h.p.qualify, Uuid::new_v4(), None).await.unwrap();

    let report = h.engine.follow_up_approvals(Utc::now() + Duration::hours(2)).await.unwrap();
    assert_eq!(report.escalated, 0);
    assert_eq!(report.escalation_targets_missing, 1);
    assert_eq!(h.engine.pending_approvals(approver).await.unwrap().len(), 1);
}
