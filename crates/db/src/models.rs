//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models. Each one converts into the matching
//! `engine` type; JSONB columns are decoded with serde on the way out.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use engine::models::{
    Approval, Blueprint, BlueprintSla, LogicalOperator, SourceState, State, Transition,
};
use engine::runtime::{
    ApprovalRequest, Delegation, EscalationLog, RecordState, TransitionExecution, TransitionHistoryItem,
};

use crate::DbError;

fn parse<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DbError> {
    s.parse().map_err(DbError::Decode)
}

pub(crate) fn logic_str(logic: LogicalOperator) -> &'static str {
    match logic {
        LogicalOperator::And => "and",
        LogicalOperator::Or => "or",
    }
}

// ---------------------------------------------------------------------------
// blueprints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct BlueprintRow {
    pub id: Uuid,
    pub name: String,
    pub module_id: Uuid,
    pub field: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub layout: Value,
    pub created_at: DateTime<Utc>,
}

impl From<BlueprintRow> for Blueprint {
    fn from(r: BlueprintRow) -> Self {
        Blueprint {
            id: r.id,
            name: r.name,
            module_id: r.module_id,
            field: r.field,
            description: r.description,
            is_active: r.is_active,
            layout: r.layout,
            created_at: r.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// blueprint_states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct StateRow {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub name: String,
    pub field_option_value: Option<String>,
    pub color: Option<String>,
    pub is_initial: bool,
    pub is_terminal: bool,
    pub metadata: Value,
}

impl From<StateRow> for State {
    fn from(r: StateRow) -> Self {
        State {
            id: r.id,
            blueprint_id: r.blueprint_id,
            name: r.name,
            field_option_value: r.field_option_value,
            color: r.color,
            is_initial: r.is_initial,
            is_terminal: r.is_terminal,
            metadata: r.metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// blueprint_transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct TransitionRow {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub button_label: Option<String>,
    /// `None` for a global transition.
    pub from_state_id: Option<Uuid>,
    pub to_state_id: Uuid,
    pub display_order: i32,
    pub is_active: bool,
    pub condition_logic: String,
    pub conditions: Value,
    pub requirements: Value,
    pub actions: Value,
    pub approval: Option<Value>,
}

impl TryFrom<TransitionRow> for Transition {
    type Error = DbError;

    fn try_from(r: TransitionRow) -> Result<Self, DbError> {
        let condition_logic = match r.condition_logic.as_str() {
            "and" => LogicalOperator::And,
            "or" => LogicalOperator::Or,
            other => return Err(DbError::Decode(format!("unknown condition logic: {other}"))),
        };
        let approval: Option<Approval> = r.approval.map(serde_json::from_value).transpose()?;

        Ok(Transition {
            id: r.id,
            blueprint_id: r.blueprint_id,
            name: r.name,
            description: r.description,
            button_label: r.button_label,
            from_state: r.from_state_id.map_or(SourceState::Any, SourceState::State),
            to_state: r.to_state_id,
            display_order: r.display_order,
            is_active: r.is_active,
            condition_logic,
            conditions: serde_json::from_value(r.conditions)?,
            requirements: serde_json::from_value(r.requirements)?,
            actions: serde_json::from_value(r.actions)?,
            approval,
        })
    }
}

// ---------------------------------------------------------------------------
// blueprint_slas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct SlaRow {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub state_id: Uuid,
    pub name: String,
    pub duration_hours: i32,
    pub business_hours_only: bool,
    pub exclude_weekends: bool,
    pub is_active: bool,
    pub escalations: Value,
}

impl TryFrom<SlaRow> for BlueprintSla {
    type Error = DbError;

    fn try_from(r: SlaRow) -> Result<Self, DbError> {
        let duration_hours = u32::try_from(r.duration_hours)
            .map_err(|_| DbError::Decode(format!("negative SLA duration on {}", r.id)))?;
        Ok(BlueprintSla {
            id: r.id,
            blueprint_id: r.blueprint_id,
            state_id: r.state_id,
            name: r.name,
            duration_hours,
            business_hours_only: r.business_hours_only,
            exclude_weekends: r.exclude_weekends,
            is_active: r.is_active,
            escalations: serde_json::from_value(r.escalations)?,
        })
    }
}

// ---------------------------------------------------------------------------
// blueprint_record_states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct RecordStateRow {
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub current_state_id: Uuid,
    pub state_entered_at: DateTime<Utc>,
    pub residency_id: Uuid,
}

impl From<RecordStateRow> for RecordState {
    fn from(r: RecordStateRow) -> Self {
        RecordState {
            blueprint_id: r.blueprint_id,
            record_id: r.record_id,
            current_state_id: r.current_state_id,
            state_entered_at: r.state_entered_at,
            residency_id: r.residency_id,
        }
    }
}

// ---------------------------------------------------------------------------
// blueprint_executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub transition_id: Uuid,
    pub from_state_id: Option<Uuid>,
    pub to_state_id: Uuid,
    pub executed_by: Uuid,
    pub status: String,
    pub submission: Value,
    pub approval: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub version: i64,
}

impl TryFrom<ExecutionRow> for TransitionExecution {
    type Error = DbError;

    fn try_from(r: ExecutionRow) -> Result<Self, DbError> {
        Ok(TransitionExecution {
            id: r.id,
            blueprint_id: r.blueprint_id,
            record_id: r.record_id,
            transition_id: r.transition_id,
            from_state: r.from_state_id,
            to_state: r.to_state_id,
            executed_by: r.executed_by,
            status: parse(&r.status)?,
            submission: serde_json::from_value(r.submission)?,
            approval: r.approval.map(serde_json::from_value).transpose()?,
            started_at: r.started_at,
            completed_at: r.completed_at,
            cancellation_reason: r.cancellation_reason,
            version: r.version,
        })
    }
}

// ---------------------------------------------------------------------------
// blueprint_approval_requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct ApprovalRequestRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub record_id: Uuid,
    pub approver_id: Uuid,
    pub requested_by: Uuid,
    pub status: String,
    pub comments: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub original_approver_id: Option<Uuid>,
    pub delegation_id: Option<Uuid>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub reminder_count: i32,
    pub last_reminder_at: Option<DateTime<Utc>>,
}

impl TryFrom<ApprovalRequestRow> for ApprovalRequest {
    type Error = DbError;

    fn try_from(r: ApprovalRequestRow) -> Result<Self, DbError> {
        Ok(ApprovalRequest {
            id: r.id,
            execution_id: r.execution_id,
            record_id: r.record_id,
            approver_id: r.approver_id,
            requested_by: r.requested_by,
            status: parse(&r.status)?,
            comments: r.comments,
            responded_at: r.responded_at,
            created_at: r.created_at,
            original_approver_id: r.original_approver_id,
            delegation_id: r.delegation_id,
            escalated_at: r.escalated_at,
            reminder_count: u32::try_from(r.reminder_count)
                .map_err(|_| DbError::Decode(format!("negative reminder_count on request {}", r.id)))?,
            last_reminder_at: r.last_reminder_at,
        })
    }
}

// ---------------------------------------------------------------------------
// blueprint_approval_delegations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct DelegationRow {
    pub id: Uuid,
    pub delegator_id: Uuid,
    pub delegate_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub blueprint_ids: Vec<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DelegationRow> for Delegation {
    fn from(r: DelegationRow) -> Self {
        Delegation {
            id: r.id,
            delegator_id: r.delegator_id,
            delegate_id: r.delegate_id,
            starts_at: r.starts_at,
            ends_at: r.ends_at,
            reason: r.reason,
            blueprint_ids: r.blueprint_ids,
            is_active: r.is_active,
            created_at: r.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// blueprint_transition_history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct HistoryRow {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub execution_id: Uuid,
    pub transition_id: Uuid,
    pub transition_name: String,
    pub from_state_id: Option<Uuid>,
    pub to_state_id: Uuid,
    pub executed_by: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl TryFrom<HistoryRow> for TransitionHistoryItem {
    type Error = DbError;

    fn try_from(r: HistoryRow) -> Result<Self, DbError> {
        Ok(TransitionHistoryItem {
            id: r.id,
            blueprint_id: r.blueprint_id,
            record_id: r.record_id,
            execution_id: r.execution_id,
            transition_id: r.transition_id,
            transition_name: r.transition_name,
            from_state: r.from_state_id,
            to_state: r.to_state_id,
            executed_by: r.executed_by,
            status: parse(&r.status)?,
            started_at: r.started_at,
            completed_at: r.completed_at,
            reason: r.reason,
        })
    }
}

// ---------------------------------------------------------------------------
// blueprint_sla_escalation_logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct EscalationLogRow {
    pub residency_id: Uuid,
    pub escalation_id: Uuid,
    pub record_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub succeeded: bool,
    pub result: Value,
}

impl From<EscalationLogRow> for EscalationLog {
    fn from(r: EscalationLogRow) -> Self {
        EscalationLog {
            residency_id: r.residency_id,
            escalation_id: r.escalation_id,
            record_id: r.record_id,
            fired_at: r.fired_at,
            succeeded: r.succeeded,
            result: r.result,
        }
    }
}

/// Convert a batch of rows, failing on the first one that does not decode.
pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, DbError>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter().map(T::try_from).collect()
}
