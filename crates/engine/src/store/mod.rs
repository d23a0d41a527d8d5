//! Persistence port for blueprint definitions and runtime records.
//!
//! The engine reads and writes exclusively through [`BlueprintStore`], which
//! lets the same orchestration run over [`MemoryStore`] in tests and over the
//! Postgres store in the `db` crate. Every multi-row runtime change goes
//! through [`BlueprintStore::write_execution`] as one atomic unit so a record's
//! state, its executions and its history can never disagree.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::graph::BlueprintGraph;
use crate::models::{Blueprint, BlueprintSla, State, Transition};
use crate::runtime::{
    ApprovalRequest, ApprovalRequestStatus, Delegation, EscalationLog, ExecutionStatus, RecordState,
    TransitionExecution, TransitionHistoryItem,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A compare-and-set lost: the row changed since it was read, or a unique
    /// slot is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }
}

/// One atomic change to an execution and everything that moves with it.
///
/// The write is rejected with [`StoreError::Conflict`] unless the stored
/// execution still has `expected_status` and `expected_version`, the
/// `decided_request` and every `updated_requests` entry are still pending,
/// and the record still sits in `record_state.0` (if given).
#[derive(Debug, Clone)]
pub struct ExecutionWrite {
    /// The execution as it will be stored, version already bumped.
    pub execution: TransitionExecution,
    pub expected_status: ExecutionStatus,
    pub expected_version: i64,
    /// Requests to create alongside (entering the approval gate).
    pub new_requests: Vec<ApprovalRequest>,
    /// A single approver's answer.
    pub decided_request: Option<ApprovalRequest>,
    /// Pending requests rewritten in place: reassignment, escalation, reminders.
    pub updated_requests: Vec<ApprovalRequest>,
    /// Close every request of this execution that is still pending.
    pub close_pending: Option<ApprovalRequestStatus>,
    /// `(expected current state, new state)`.
    pub record_state: Option<(Uuid, RecordState)>,
    pub history: Option<TransitionHistoryItem>,
}

impl ExecutionWrite {
    /// Write `execution` over the version it was read at.
    pub fn new(mut execution: TransitionExecution, expected_status: ExecutionStatus) -> Self {
        let expected_version = execution.version;
        execution.version += 1;
        Self {
            execution,
            expected_status,
            expected_version,
            new_requests: Vec::new(),
            decided_request: None,
            updated_requests: Vec::new(),
            close_pending: None,
            record_state: None,
            history: None,
        }
    }
}

#[async_trait]
pub trait BlueprintStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// The blueprint with all states, transitions and SLAs.
    async fn load_graph(&self, blueprint_id: Uuid) -> Result<BlueprintGraph, StoreError>;

    async fn list_blueprints(&self, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, StoreError>;

    /// Insert or replace.
    async fn put_blueprint(&self, blueprint: &Blueprint) -> Result<(), StoreError>;

    /// Remove a blueprint and everything that belongs to it.
    async fn delete_blueprint(&self, id: Uuid) -> Result<(), StoreError>;

    async fn put_state(&self, state: &State) -> Result<(), StoreError>;

    /// Remove a state together with the transitions and SLAs touching it.
    ///
    /// Fails with [`StoreError::Conflict`] while any record sits in the state.
    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError>;

    async fn put_transition(&self, transition: &Transition) -> Result<(), StoreError>;

    async fn delete_transition(&self, id: Uuid) -> Result<(), StoreError>;

    async fn put_sla(&self, sla: &BlueprintSla) -> Result<(), StoreError>;

    async fn delete_sla(&self, id: Uuid) -> Result<(), StoreError>;

    // -----------------------------------------------------------------------
    // Record state
    // -----------------------------------------------------------------------

    async fn record_state(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Option<RecordState>, StoreError>;

    /// Insert `state` unless the record already has one; return whichever is stored.
    async fn init_record_state(&self, state: &RecordState) -> Result<RecordState, StoreError>;

    async fn record_states(&self, blueprint_id: Uuid) -> Result<Vec<RecordState>, StoreError>;

    // -----------------------------------------------------------------------
    // Executions and approvals
    // -----------------------------------------------------------------------

    /// Create an execution (and its approval requests).
    ///
    /// Fails with [`StoreError::Conflict`] if the record already has a
    /// non-terminal execution for the same transition.
    async fn insert_execution(
        &self,
        execution: &TransitionExecution,
        requests: &[ApprovalRequest],
    ) -> Result<(), StoreError>;

    async fn execution(&self, id: Uuid) -> Result<TransitionExecution, StoreError>;

    async fn executions_for_record(&self, record_id: Uuid) -> Result<Vec<TransitionExecution>, StoreError>;

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<TransitionExecution>, StoreError>;

    async fn write_execution(&self, write: ExecutionWrite) -> Result<(), StoreError>;

    async fn approval_request(&self, id: Uuid) -> Result<ApprovalRequest, StoreError>;

    async fn approval_requests(&self, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError>;

    async fn pending_approvals_for(&self, approver_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError>;

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Oldest first.
    async fn history(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Vec<TransitionHistoryItem>, StoreError>;

    // -----------------------------------------------------------------------
    // Escalations
    // -----------------------------------------------------------------------

    /// Record that an escalation fired for a residency. Returns `false` if it
    /// had already fired, in which case nothing is written.
    async fn mark_escalation_fired(&self, log: &EscalationLog) -> Result<bool, StoreError>;

    async fn update_escalation_result(
        &self,
        residency_id: Uuid,
        escalation_id: Uuid,
        succeeded: bool,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn escalation_logs(&self, residency_id: Uuid) -> Result<Vec<EscalationLog>, StoreError>;

    // -----------------------------------------------------------------------
    // Delegations
    // -----------------------------------------------------------------------

    /// Store a new delegation, first deactivating the delegator's delegations
    /// that ended by `delegation.starts_at`.
    ///
    /// Fails with [`StoreError::Conflict`] if the delegator still has another
    /// active delegation.
    async fn insert_delegation(&self, delegation: &Delegation) -> Result<(), StoreError>;

    async fn delegation(&self, id: Uuid) -> Result<Delegation, StoreError>;

    async fn deactivate_delegation(&self, id: Uuid) -> Result<(), StoreError>;

    /// Delegations where `user_id` is the delegator or the delegate, oldest first.
    async fn delegations_for(&self, user_id: Uuid) -> Result<Vec<Delegation>, StoreError>;
}
