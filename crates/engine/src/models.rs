//! Blueprint definition models.
//!
//! These types describe the static workflow graph: the blueprint itself, its
//! states, the transitions between them and everything hanging off a
//! transition (conditions, requirements, actions, approval) or a state (SLAs).
//! They are read-only at execution time and change only through
//! [`crate::authoring::Authoring`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Blueprint
// ---------------------------------------------------------------------------

/// A named workflow definition bound to one module and its driver field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: Uuid,
    pub name: String,
    pub module_id: Uuid,
    /// API name of the field whose value encodes the record's current state.
    pub field: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Node positions and other editor state; never interpreted by the engine.
    #[serde(default)]
    pub layout: Value,
    pub created_at: DateTime<Utc>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>, module_id: Uuid, field: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            module_id,
            field: field.into(),
            description: None,
            is_active: true,
            layout: Value::Null,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub name: String,
    /// Driver-field option this state corresponds to, if any.
    #[serde(default)]
    pub field_option_value: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub is_initial: bool,
    /// No outgoing transitions are offered from a terminal state.
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl State {
    pub fn new(blueprint_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            blueprint_id,
            name: name.into(),
            field_option_value: None,
            color: None,
            is_initial: false,
            is_terminal: false,
            metadata: Value::Null,
        }
    }

    pub fn with_option(mut self, value: impl Into<String>) -> Self {
        self.field_option_value = Some(value.into());
        self
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Where a transition may be taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state_id", rename_all = "snake_case")]
pub enum SourceState {
    /// Global transition, available from every non-terminal state.
    Any,
    State(Uuid),
}

impl SourceState {
    pub fn matches(&self, current: Uuid) -> bool {
        match self {
            Self::Any => true,
            Self::State(id) => *id == current,
        }
    }

    pub fn state_id(&self) -> Option<Uuid> {
        match self {
            Self::Any => None,
            Self::State(id) => Some(*id),
        }
    }
}

/// How a transition's conditions are combined. One level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// A directed, optionally guarded edge between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub button_label: Option<String>,
    pub from_state: SourceState,
    pub to_state: Uuid,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub condition_logic: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub actions: Vec<TransitionAction>,
    #[serde(default)]
    pub approval: Option<Approval>,
}

impl Transition {
    pub fn new(blueprint_id: Uuid, name: impl Into<String>, from: SourceState, to: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            blueprint_id,
            name: name.into(),
            description: None,
            button_label: None,
            from_state: from,
            to_state: to,
            display_order: 0,
            is_active: true,
            condition_logic: LogicalOperator::And,
            conditions: Vec::new(),
            requirements: Vec::new(),
            actions: Vec::new(),
            approval: None,
        }
    }

    pub fn button_label(&self) -> &str {
        self.button_label.as_deref().unwrap_or(&self.name)
    }

    pub fn has_requirements(&self) -> bool {
        !self.requirements.is_empty()
    }

    /// The approval config, if one is attached and switched on.
    pub fn active_approval(&self) -> Option<&Approval> {
        self.approval.as_ref().filter(|a| a.is_active)
    }

    pub fn requires_approval(&self) -> bool {
        self.active_approval().is_some()
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Compare against a literal.
    Value(Value),
    /// Compare against another field of the same record.
    FieldValue(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: Uuid,
    pub field: String,
    /// Kept as text so stored definitions with an unknown operator still load;
    /// the evaluator fails such conditions closed.
    pub operator: String,
    #[serde(flatten)]
    pub operand: Operand,
    #[serde(default)]
    pub display_order: i32,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            field: field.into(),
            operator: operator.into(),
            operand: Operand::Value(value),
            display_order: 0,
        }
    }

    pub fn against_field(
        field: impl Into<String>,
        operator: impl Into<String>,
        other: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            field: field.into(),
            operator: operator.into(),
            operand: Operand::FieldValue(other.into()),
            display_order: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Requirement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub label: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// What the user must provide while an execution is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequirementKind {
    /// A record field that must be filled in (and pass the field's own rules).
    MandatoryField { field: String },
    Attachment {
        #[serde(default)]
        min_count: Option<u32>,
        /// Upper bound per file, in bytes.
        #[serde(default)]
        max_size: Option<u64>,
        /// MIME types or extensions (`"application/pdf"`, `".png"`). Empty means any.
        #[serde(default)]
        allowed_types: Vec<String>,
    },
    Note {
        #[serde(default)]
        min_length: Option<usize>,
    },
    Checklist { items: Vec<ChecklistItem> },
}

impl RequirementKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::MandatoryField { .. } => "mandatory_field",
            Self::Attachment { .. } => "attachment",
            Self::Note { .. } => "note",
            Self::Checklist { .. } => "checklist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: Uuid,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Non-required requirements are shown to the user but never block.
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default)]
    pub display_order: i32,
    #[serde(flatten)]
    pub kind: RequirementKind,
}

impl Requirement {
    pub fn new(kind: RequirementKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: None,
            description: None,
            is_required: true,
            display_order: 0,
            kind,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A side effect run after a transition commits. `config` is opaque to the
/// engine and handed to the handler registered for `action_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl TransitionAction {
    pub fn new(action_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: action_type.into(),
            config,
            display_order: 0,
            is_active: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Who is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "approval_type", content = "config", rename_all = "snake_case")]
pub enum ApproverSource {
    SpecificUsers { user_ids: Vec<Uuid> },
    RoleBased { role_ids: Vec<String> },
    /// The record owner's manager chain, `levels` deep.
    Manager {
        #[serde(default = "default_manager_levels")]
        levels: u32,
    },
    /// The user referenced by a lookup field on the record.
    FieldValue { field: String },
}

fn default_manager_levels() -> u32 {
    1
}

impl ApproverSource {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SpecificUsers { .. } => "specific_users",
            Self::RoleBased { .. } => "role_based",
            Self::Manager { .. } => "manager",
            Self::FieldValue { .. } => "field_value",
        }
    }
}

/// Who an unanswered approval request is escalated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "escalation_type", content = "config", rename_all = "snake_case")]
pub enum EscalationTarget {
    /// The manager of the original approver, or of the requester when the
    /// request was never handed on.
    Manager,
    SpecificUser { user_id: Uuid },
    /// The first user holding any of the roles.
    Role { role_ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub approvers: ApproverSource,
    /// `true`: every resolved approver must approve. `false`: first decision wins.
    #[serde(default)]
    pub require_all: bool,
    #[serde(default)]
    pub auto_reject_days: Option<u32>,
    /// Hand a request still pending after this many hours to `escalate_to`, once.
    #[serde(default)]
    pub escalation_hours: Option<u32>,
    #[serde(default)]
    pub escalate_to: Option<EscalationTarget>,
    /// Remind the approver every `reminder_hours`, at most `max_reminders` times.
    #[serde(default)]
    pub reminder_hours: Option<u32>,
    #[serde(default)]
    pub max_reminders: u32,
    /// Advisory flags for the notification collaborator.
    #[serde(default = "default_true")]
    pub notify_on_pending: bool,
    #[serde(default = "default_true")]
    pub notify_on_complete: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Approval {
    pub fn new(approvers: ApproverSource) -> Self {
        Self {
            approvers,
            require_all: false,
            auto_reject_days: None,
            escalation_hours: None,
            escalate_to: None,
            reminder_hours: None,
            max_reminders: 0,
            notify_on_pending: true,
            notify_on_complete: true,
            is_active: true,
        }
    }
}

// ---------------------------------------------------------------------------
// SLA
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// Fires once the elapsed share of the budget reaches `trigger_value` percent.
    Approaching,
    Breached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaEscalation {
    pub id: Uuid,
    #[serde(rename = "trigger_type")]
    pub trigger: EscalationTrigger,
    /// Percentage threshold for `approaching`; ignored for `breached`.
    #[serde(default)]
    pub trigger_value: Option<u32>,
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub display_order: i32,
}

impl SlaEscalation {
    pub fn new(trigger: EscalationTrigger, trigger_value: Option<u32>, action_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            trigger_value,
            action_type: action_type.into(),
            config: Value::Null,
            display_order: 0,
        }
    }
}

/// A time budget for records sitting in one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintSla {
    pub id: Uuid,
    pub blueprint_id: Uuid,
    pub state_id: Uuid,
    pub name: String,
    pub duration_hours: u32,
    #[serde(default)]
    pub business_hours_only: bool,
    #[serde(default)]
    pub exclude_weekends: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub escalations: Vec<SlaEscalation>,
}

impl BlueprintSla {
    pub fn new(blueprint_id: Uuid, state_id: Uuid, name: impl Into<String>, duration_hours: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            blueprint_id,
            state_id,
            name: name.into(),
            duration_hours,
            business_hours_only: false,
            exclude_weekends: false,
            is_active: true,
            escalations: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Field options (input to state sync)
// ---------------------------------------------------------------------------

/// One option of the driver field, as reported by the module/field system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
    #[serde(default)]
    pub metadata: Value,
}
