//! [`BlueprintStore`] backed by Postgres.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use engine::models::{Blueprint, BlueprintSla, State, Transition};
use engine::runtime::{
    ApprovalRequest, Delegation, EscalationLog, ExecutionStatus, RecordState, TransitionExecution, TransitionHistoryItem,
};
use engine::store::{BlueprintStore, ExecutionWrite, StoreError};
use engine::BlueprintGraph;

use crate::repository::{blueprints, delegations, escalations, executions, records};
use crate::DbPool;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl BlueprintStore for PgStore {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn load_graph(&self, blueprint_id: Uuid) -> Result<BlueprintGraph, StoreError> {
        Ok(blueprints::load_graph(&self.pool, blueprint_id).await?)
    }

    async fn list_blueprints(&self, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, StoreError> {
        Ok(blueprints::list_blueprints(&self.pool, module_id).await?)
    }

    async fn put_blueprint(&self, blueprint: &Blueprint) -> Result<(), StoreError> {
        Ok(blueprints::upsert_blueprint(&self.pool, blueprint).await?)
    }

    async fn delete_blueprint(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(blueprints::delete_blueprint(&self.pool, id).await?)
    }

    async fn put_state(&self, state: &State) -> Result<(), StoreError> {
        Ok(blueprints::upsert_state(&self.pool, state).await?)
    }

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(blueprints::delete_state(&self.pool, id).await?)
    }

    async fn put_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        Ok(blueprints::upsert_transition(&self.pool, transition).await?)
    }

    async fn delete_transition(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(blueprints::delete_transition(&self.pool, id).await?)
    }

    async fn put_sla(&self, sla: &BlueprintSla) -> Result<(), StoreError> {
        Ok(blueprints::upsert_sla(&self.pool, sla).await?)
    }

    async fn delete_sla(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(blueprints::delete_sla(&self.pool, id).await?)
    }

    // -----------------------------------------------------------------------
    // Record state
    // -----------------------------------------------------------------------

    async fn record_state(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Option<RecordState>, StoreError> {
        Ok(records::get_record_state(&self.pool, blueprint_id, record_id).await?)
    }

    async fn init_record_state(&self, state: &RecordState) -> Result<RecordState, StoreError> {
        Ok(records::init_record_state(&self.pool, state).await?)
    }

    async fn record_states(&self, blueprint_id: Uuid) -> Result<Vec<RecordState>, StoreError> {
        Ok(records::list_record_states(&self.pool, blueprint_id).await?)
    }

    // -----------------------------------------------------------------------
    // Executions and approvals
    // -----------------------------------------------------------------------

    async fn insert_execution(
        &self,
        execution: &TransitionExecution,
        requests: &[ApprovalRequest],
    ) -> Result<(), StoreError> {
        Ok(executions::insert_execution(&self.pool, execution, requests).await?)
    }

    async fn execution(&self, id: Uuid) -> Result<TransitionExecution, StoreError> {
        Ok(executions::get_execution(&self.pool, id).await?)
    }

    async fn executions_for_record(&self, record_id: Uuid) -> Result<Vec<TransitionExecution>, StoreError> {
        Ok(executions::list_for_record(&self.pool, record_id).await?)
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<TransitionExecution>, StoreError> {
        Ok(executions::list_with_status(&self.pool, status).await?)
    }

    async fn write_execution(&self, write: ExecutionWrite) -> Result<(), StoreError> {
        Ok(executions::apply_write(&self.pool, write).await?)
    }

    async fn approval_request(&self, id: Uuid) -> Result<ApprovalRequest, StoreError> {
        Ok(executions::get_request(&self.pool, id).await?)
    }

    async fn approval_requests(&self, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(executions::list_requests(&self.pool, execution_id).await?)
    }

    async fn pending_approvals_for(&self, approver_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(executions::list_pending_for(&self.pool, approver_id).await?)
    }

    // -----------------------------------------------------------------------
    // Delegations
    // -----------------------------------------------------------------------

    async fn insert_delegation(&self, delegation: &Delegation) -> Result<(), StoreError> {
        Ok(delegations::insert(&self.pool, delegation).await?)
    }

    async fn delegation(&self, id: Uuid) -> Result<Delegation, StoreError> {
        Ok(delegations::get(&self.pool, id).await?)
    }

    async fn deactivate_delegation(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(delegations::deactivate(&self.pool, id).await?)
    }

    async fn delegations_for(&self, user_id: Uuid) -> Result<Vec<Delegation>, StoreError> {
        Ok(delegations::list_for_user(&self.pool, user_id).await?)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    async fn history(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Vec<TransitionHistoryItem>, StoreError> {
        Ok(records::list_history(&self.pool, blueprint_id, record_id).await?)
    }

    // -----------------------------------------------------------------------
    // Escalations
    // -----------------------------------------------------------------------

    async fn mark_escalation_fired(&self, log: &EscalationLog) -> Result<bool, StoreError> {
        Ok(escalations::claim(&self.pool, log).await?)
    }

    async fn update_escalation_result(
        &self,
        residency_id: Uuid,
        escalation_id: Uuid,
        succeeded: bool,
        result: Value,
    ) -> Result<(), StoreError> {
        Ok(escalations::record_result(&self.pool, residency_id, escalation_id, succeeded, result).await?)
    }

    async fn escalation_logs(&self, residency_id: Uuid) -> Result<Vec<EscalationLog>, StoreError> {
        Ok(escalations::list_for_residency(&self.pool, residency_id).await?)
    }
}
