//! Runtime records: where a record sits, the in-flight executions against it,
//! approval requests, the immutable transition history and escalation logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::requirement::RequirementSubmission;

// ---------------------------------------------------------------------------
// RecordState
// ---------------------------------------------------------------------------

/// The single state a record is in under one blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub current_state_id: Uuid,
    pub state_entered_at: DateTime<Utc>,
    /// Regenerated on every state entry; keys SLA escalation idempotency.
    pub residency_id: Uuid,
}

impl RecordState {
    pub fn enter(blueprint_id: Uuid, record_id: Uuid, state_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            blueprint_id,
            record_id,
            current_state_id: state_id,
            state_entered_at: at,
            residency_id: Uuid::new_v4(),
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    PendingRequirements,
    PendingApproval,
    Completed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingRequirements => "pending_requirements",
            Self::PendingApproval => "pending_approval",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_requirements" => Ok(Self::PendingRequirements),
            "pending_approval"     => Ok(Self::PendingApproval),
            "completed"            => Ok(Self::Completed),
            "cancelled"            => Ok(Self::Cancelled),
            other                  => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Aggregate decision of an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalState {
    pub status: GateStatus,
    pub require_all: bool,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

/// One runtime attempt to traverse a transition for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionExecution {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub transition_id: Uuid,
    /// The record's state when the execution started.
    pub from_state: Option<Uuid>,
    pub to_state: Uuid,
    pub executed_by: Uuid,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub submission: RequirementSubmission,
    #[serde(default)]
    pub approval: Option<ApprovalState>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    /// Bumped by every store write; a write built from an older read is rejected.
    #[serde(default)]
    pub version: i64,
}

impl TransitionExecution {
    pub fn gate_status(&self) -> Option<GateStatus> {
        self.approval.as_ref().map(|a| a.status)
    }
}

// ---------------------------------------------------------------------------
// ApprovalRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequestStatus {
    Pending,
    Approved,
    Rejected,
    /// Closed by auto-reject.
    Expired,
    /// Closed because the gate was decided by someone else or the execution ended.
    Superseded,
}

impl ApprovalRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Superseded => "superseded",
        }
    }
}

impl std::str::FromStr for ApprovalRequestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"    => Ok(Self::Pending),
            "approved"   => Ok(Self::Approved),
            "rejected"   => Ok(Self::Rejected),
            "expired"    => Ok(Self::Expired),
            "superseded" => Ok(Self::Superseded),
            other        => Err(format!("unknown approval request status: {other}")),
        }
    }
}

/// One approver's slot in an approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub record_id: Uuid,
    pub approver_id: Uuid,
    pub requested_by: Uuid,
    pub status: ApprovalRequestStatus,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Who the request was first addressed to, once delegation, escalation or
    /// reassignment handed it to someone else.
    #[serde(default)]
    pub original_approver_id: Option<Uuid>,
    #[serde(default)]
    pub delegation_id: Option<Uuid>,
    #[serde(default)]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminder_count: u32,
    #[serde(default)]
    pub last_reminder_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn pending(execution: &TransitionExecution, approver_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            record_id: execution.record_id,
            approver_id,
            requested_by: execution.executed_by,
            status: ApprovalRequestStatus::Pending,
            comments: None,
            responded_at: None,
            created_at: at,
            original_approver_id: None,
            delegation_id: None,
            escalated_at: None,
            reminder_count: 0,
            last_reminder_at: None,
        }
    }

    /// Hand the request to `approver_id`, remembering the first addressee.
    pub fn hand_to(&mut self, approver_id: Uuid) {
        self.original_approver_id.get_or_insert(self.approver_id);
        self.approver_id = approver_id;
    }
}

// ---------------------------------------------------------------------------
// Delegation
// ---------------------------------------------------------------------------

/// An approver handing their approvals to someone else for a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub delegator_id: Uuid,
    pub delegate_id: Uuid,
    pub starts_at: DateTime<Utc>,
    /// Open-ended when unset.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Blueprints covered; empty covers every blueprint.
    #[serde(default)]
    pub blueprint_ids: Vec<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    /// An open-ended delegation of every blueprint from `starts_at`.
    pub fn new(delegator_id: Uuid, delegate_id: Uuid, starts_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            delegator_id,
            delegate_id,
            starts_at,
            ends_at: None,
            reason: None,
            blueprint_ids: Vec::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn until(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    pub fn for_blueprints(mut self, blueprint_ids: Vec<Uuid>) -> Self {
        self.blueprint_ids = blueprint_ids;
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn in_effect(&self, at: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= at && self.ends_at.map_or(true, |end| at < end)
    }

    /// Whether this delegation redirects requests of `blueprint_id` at `at`.
    pub fn covers(&self, blueprint_id: Uuid, at: DateTime<Utc>) -> bool {
        self.in_effect(at) && (self.blueprint_ids.is_empty() || self.blueprint_ids.contains(&blueprint_id))
    }

    /// Active but already past its end date.
    pub fn has_lapsed(&self, at: DateTime<Utc>) -> bool {
        self.is_active && self.ends_at.is_some_and(|end| end <= at)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Cancelled,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown history status: {other}")),
        }
    }
}

/// Immutable audit row, appended once per finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionHistoryItem {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub record_id: Uuid,
    pub execution_id: Uuid,
    pub transition_id: Uuid,
    pub transition_name: String,
    pub from_state: Option<Uuid>,
    pub to_state: Uuid,
    pub executed_by: Uuid,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Escalation log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLog {
    pub residency_id: Uuid,
    pub escalation_id: Uuid,
    pub record_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default)]
    pub result: Value,
}
