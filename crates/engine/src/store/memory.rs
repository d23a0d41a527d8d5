use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{BlueprintStore, ExecutionWrite, StoreError};
use crate::graph::BlueprintGraph;
use crate::models::{Blueprint, BlueprintSla, SourceState, State, Transition};
use crate::runtime::{
    ApprovalRequest, ApprovalRequestStatus, Delegation, EscalationLog, ExecutionStatus, RecordState,
    TransitionExecution, TransitionHistoryItem,
};

#[derive(Default)]
struct Tables {
    blueprints: HashMap<Uuid, Blueprint>,
    states: HashMap<Uuid, State>,
    transitions: HashMap<Uuid, Transition>,
    slas: HashMap<Uuid, BlueprintSla>,
    record_states: HashMap<(Uuid, Uuid), RecordState>,
    executions: HashMap<Uuid, TransitionExecution>,
    requests: HashMap<Uuid, ApprovalRequest>,
    history: Vec<TransitionHistoryItem>,
    escalations: HashMap<(Uuid, Uuid), EscalationLog>,
    delegations: HashMap<Uuid, Delegation>,
}

/// In-process store. All tables sit behind one lock, so every trait call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sorted<T: Clone, K: Ord>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(key);
    out
}

#[async_trait]
impl BlueprintStore for MemoryStore {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn load_graph(&self, blueprint_id: Uuid) -> Result<BlueprintGraph, StoreError> {
        let t = self.lock();
        let blueprint = t
            .blueprints
            .get(&blueprint_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("blueprint", blueprint_id))?;

        Ok(BlueprintGraph {
            blueprint,
            states: sorted(
                t.states.values().filter(|s| s.blueprint_id == blueprint_id).cloned(),
                |s| s.name.clone(),
            ),
            transitions: sorted(
                t.transitions.values().filter(|x| x.blueprint_id == blueprint_id).cloned(),
                |x| (x.display_order, x.name.clone()),
            ),
            slas: sorted(
                t.slas.values().filter(|s| s.blueprint_id == blueprint_id).cloned(),
                |s| s.name.clone(),
            ),
        })
    }

    async fn list_blueprints(&self, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.blueprints
                .values()
                .filter(|b| module_id.map_or(true, |m| b.module_id == m))
                .cloned(),
            |b| b.created_at,
        ))
    }

    async fn put_blueprint(&self, blueprint: &Blueprint) -> Result<(), StoreError> {
        self.lock().blueprints.insert(blueprint.id, blueprint.clone());
        Ok(())
    }

    async fn delete_blueprint(&self, id: Uuid) -> Result<(), StoreError> {
        let mut t = self.lock();
        if t.blueprints.remove(&id).is_none() {
            return Err(StoreError::not_found("blueprint", id));
        }
        t.states.retain(|_, s| s.blueprint_id != id);
        t.transitions.retain(|_, x| x.blueprint_id != id);
        t.slas.retain(|_, s| s.blueprint_id != id);
        t.record_states.retain(|(bp, _), _| *bp != id);
        Ok(())
    }

    async fn put_state(&self, state: &State) -> Result<(), StoreError> {
        let mut t = self.lock();
        if !t.blueprints.contains_key(&state.blueprint_id) {
            return Err(StoreError::not_found("blueprint", state.blueprint_id));
        }
        t.states.insert(state.id, state.clone());
        Ok(())
    }

    async fn delete_state(&self, id: Uuid) -> Result<(), StoreError> {
        let mut t = self.lock();
        if !t.states.contains_key(&id) {
            return Err(StoreError::not_found("state", id));
        }
        let occupants = t.record_states.values().filter(|r| r.current_state_id == id).count();
        if occupants > 0 {
            return Err(StoreError::Conflict(format!("state {id} still holds {occupants} record(s)")));
        }
        t.states.remove(&id);
        t.transitions
            .retain(|_, x| x.to_state != id && x.from_state != SourceState::State(id));
        t.slas.retain(|_, s| s.state_id != id);
        Ok(())
    }

    async fn put_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        let mut t = self.lock();
        if !t.blueprints.contains_key(&transition.blueprint_id) {
            return Err(StoreError::not_found("blueprint", transition.blueprint_id));
        }
        t.transitions.insert(transition.id, transition.clone());
        Ok(())
    }

    async fn delete_transition(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()
            .transitions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("transition", id))
    }

    async fn put_sla(&self, sla: &BlueprintSla) -> Result<(), StoreError> {
        let mut t = self.lock();
        if !t.states.contains_key(&sla.state_id) {
            return Err(StoreError::not_found("state", sla.state_id));
        }
        t.slas.insert(sla.id, sla.clone());
        Ok(())
    }

    async fn delete_sla(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()
            .slas
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("sla", id))
    }

    // -----------------------------------------------------------------------
    // Record state
    // -----------------------------------------------------------------------

    async fn record_state(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Option<RecordState>, StoreError> {
        Ok(self.lock().record_states.get(&(blueprint_id, record_id)).cloned())
    }

    async fn init_record_state(&self, state: &RecordState) -> Result<RecordState, StoreError> {
        let mut t = self.lock();
        Ok(t.record_states
            .entry((state.blueprint_id, state.record_id))
            .or_insert_with(|| state.clone())
            .clone())
    }

    async fn record_states(&self, blueprint_id: Uuid) -> Result<Vec<RecordState>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.record_states.values().filter(|r| r.blueprint_id == blueprint_id).cloned(),
            |r| r.state_entered_at,
        ))
    }

    // -----------------------------------------------------------------------
    // Executions and approvals
    // -----------------------------------------------------------------------

    async fn insert_execution(
        &self,
        execution: &TransitionExecution,
        requests: &[ApprovalRequest],
    ) -> Result<(), StoreError> {
        let mut t = self.lock();
        let duplicate = t.executions.values().any(|e| {
            e.record_id == execution.record_id
                && e.transition_id == execution.transition_id
                && !e.status.is_terminal()
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "record {} already has an open execution of transition {}",
                execution.record_id, execution.transition_id
            )));
        }
        t.executions.insert(execution.id, execution.clone());
        for request in requests {
            t.requests.insert(request.id, request.clone());
        }
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<TransitionExecution, StoreError> {
        self.lock()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution", id))
    }

    async fn executions_for_record(&self, record_id: Uuid) -> Result<Vec<TransitionExecution>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.executions.values().filter(|e| e.record_id == record_id).cloned(),
            |e| e.started_at,
        ))
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<TransitionExecution>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.executions.values().filter(|e| e.status == status).cloned(),
            |e| e.started_at,
        ))
    }

    async fn write_execution(&self, write: ExecutionWrite) -> Result<(), StoreError> {
        let mut t = self.lock();
        let exec_id = write.execution.id;

        // Check every precondition before touching anything.
        let stored = t
            .executions
            .get(&exec_id)
            .ok_or_else(|| StoreError::not_found("execution", exec_id))?;
        if stored.status != write.expected_status {
            return Err(StoreError::Conflict(format!(
                "execution {exec_id} is {}, expected {}",
                stored.status, write.expected_status
            )));
        }
        if stored.version != write.expected_version {
            return Err(StoreError::Conflict(format!(
                "execution {exec_id} is at version {}, expected {}",
                stored.version, write.expected_version
            )));
        }
        for request in write.decided_request.iter().chain(&write.updated_requests) {
            let current = t
                .requests
                .get(&request.id)
                .filter(|r| r.execution_id == exec_id)
                .ok_or_else(|| StoreError::not_found("approval request", request.id))?;
            if current.status != ApprovalRequestStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "approval request {} is already {}",
                    request.id,
                    current.status.as_str()
                )));
            }
        }
        if let Some((expected, next)) = &write.record_state {
            let key = (next.blueprint_id, next.record_id);
            match t.record_states.get(&key) {
                Some(current) if current.current_state_id == *expected => {}
                Some(current) => {
                    return Err(StoreError::Conflict(format!(
                        "record {} moved to state {} concurrently",
                        next.record_id, current.current_state_id
                    )));
                }
                None => return Err(StoreError::not_found("record state", next.record_id)),
            }
        }

        // Apply.
        for request in write.new_requests {
            t.requests.insert(request.id, request);
        }
        for request in write.updated_requests {
            t.requests.insert(request.id, request);
        }
        if let Some(decided) = write.decided_request {
            t.requests.insert(decided.id, decided);
        }
        if let Some(status) = write.close_pending {
            for request in t.requests.values_mut() {
                if request.execution_id == exec_id && request.status == ApprovalRequestStatus::Pending {
                    request.status = status;
                }
            }
        }
        if let Some((_, next)) = write.record_state {
            t.record_states.insert((next.blueprint_id, next.record_id), next);
        }
        if let Some(item) = write.history {
            t.history.push(item);
        }
        t.executions.insert(exec_id, write.execution);
        Ok(())
    }

    async fn approval_request(&self, id: Uuid) -> Result<ApprovalRequest, StoreError> {
        self.lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("approval request", id))
    }

    async fn approval_requests(&self, execution_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.requests.values().filter(|r| r.execution_id == execution_id).cloned(),
            |r| r.created_at,
        ))
    }

    async fn pending_approvals_for(&self, approver_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.requests
                .values()
                .filter(|r| r.approver_id == approver_id && r.status == ApprovalRequestStatus::Pending)
                .cloned(),
            |r| r.created_at,
        ))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    async fn history(&self, blueprint_id: Uuid, record_id: Uuid) -> Result<Vec<TransitionHistoryItem>, StoreError> {
        let t = self.lock();
        Ok(t.history
            .iter()
            .filter(|h| h.blueprint_id == blueprint_id && h.record_id == record_id)
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Escalations
    // -----------------------------------------------------------------------

    async fn mark_escalation_fired(&self, log: &EscalationLog) -> Result<bool, StoreError> {
        let mut t = self.lock();
        let key = (log.residency_id, log.escalation_id);
        if t.escalations.contains_key(&key) {
            return Ok(false);
        }
        t.escalations.insert(key, log.clone());
        Ok(true)
    }

    async fn update_escalation_result(
        &self,
        residency_id: Uuid,
        escalation_id: Uuid,
        succeeded: bool,
        result: Value,
    ) -> Result<(), StoreError> {
        let mut t = self.lock();
        let log = t
            .escalations
            .get_mut(&(residency_id, escalation_id))
            .ok_or_else(|| StoreError::not_found("escalation log", escalation_id))?;
        log.succeeded = succeeded;
        log.result = result;
        Ok(())
    }

    async fn escalation_logs(&self, residency_id: Uuid) -> Result<Vec<EscalationLog>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.escalations.values().filter(|l| l.residency_id == residency_id).cloned(),
            |l| l.fired_at,
        ))
    }

    // -----------------------------------------------------------------------
    // Delegations
    // -----------------------------------------------------------------------

    async fn insert_delegation(&self, delegation: &Delegation) -> Result<(), StoreError> {
        let mut t = self.lock();
        let mut clash = None;
        for existing in t.delegations.values_mut() {
            if existing.delegator_id != delegation.delegator_id || !existing.is_active {
                continue;
            }
            if existing.has_lapsed(delegation.starts_at) {
                existing.is_active = false;
            } else {
                clash = Some(existing.id);
            }
        }
        if let Some(id) = clash {
            return Err(StoreError::Conflict(format!(
                "user {} already has active delegation {id}",
                delegation.delegator_id
            )));
        }
        t.delegations.insert(delegation.id, delegation.clone());
        Ok(())
    }

    async fn delegation(&self, id: Uuid) -> Result<Delegation, StoreError> {
        self.lock()
            .delegations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("delegation", id))
    }

    async fn deactivate_delegation(&self, id: Uuid) -> Result<(), StoreError> {
        let mut t = self.lock();
        let delegation = t
            .delegations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("delegation", id))?;
        delegation.is_active = false;
        Ok(())
    }

    async fn delegations_for(&self, user_id: Uuid) -> Result<Vec<Delegation>, StoreError> {
        let t = self.lock();
        Ok(sorted(
            t.delegations
                .values()
                .filter(|d| d.delegator_id == user_id || d.delegate_id == user_id)
                .cloned(),
            |d| d.created_at,
        ))
    }
}
