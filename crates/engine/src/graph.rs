//! The blueprint graph (states and transitions of one blueprint) plus the
//! two queries the runtime needs from it (which transitions are available,
//! which state a record starts in) and structural validation for authoring.
//!
//! Rules enforced by [`validate_graph`]:
//! 1. State and transition IDs are unique and belong to this blueprint.
//! 2. Every transition references existing states on both ends.
//! 3. Conditions use known operators; requirement, approval and SLA configs are well formed.
//!
//! A blueprint without exactly one initial state is reported as a warning.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{self, ConditionOperator};
use crate::models::{
    ApproverSource, Blueprint, BlueprintSla, EscalationTarget, EscalationTrigger, FieldOption,
    RequirementKind, SourceState, State, Transition,
};
use crate::record::FieldSnapshot;
use crate::EngineError;

/// A blueprint together with all of its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintGraph {
    pub blueprint: Blueprint,
    #[serde(default)]
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub slas: Vec<BlueprintSla>,
}

/// What a caller needs to render a transition button.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableTransition {
    pub id: Uuid,
    pub name: String,
    pub button_label: String,
    pub to_state_id: Uuid,
    pub to_state_name: String,
    pub has_requirements: bool,
    pub requires_approval: bool,
}

impl BlueprintGraph {
    pub fn new(blueprint: Blueprint) -> Self {
        Self { blueprint, states: Vec::new(), transitions: Vec::new(), slas: Vec::new() }
    }

    pub fn state(&self, id: Uuid) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn transition(&self, id: Uuid) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    pub fn initial_state(&self) -> Option<&State> {
        self.states.iter().find(|s| s.is_initial)
    }

    pub fn state_for_option(&self, value: &str) -> Option<&State> {
        self.states
            .iter()
            .find(|s| s.field_option_value.as_deref() == Some(value))
    }

    /// State a record starts in when first seen: the state linked to its
    /// driver-field value, else the initial state, else the first state.
    pub fn resolve_entry_state(&self, fields: &FieldSnapshot) -> Option<&State> {
        fields
            .get(&self.blueprint.field)
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .and_then(|value| self.state_for_option(&value))
            .or_else(|| self.initial_state())
            .or_else(|| self.states.first())
    }

    /// Active SLAs attached to `state_id`.
    pub fn slas_for_state(&self, state_id: Uuid) -> impl Iterator<Item = &BlueprintSla> {
        self.slas
            .iter()
            .filter(move |s| s.state_id == state_id && s.is_active)
    }

    /// Whether `transition` may be taken right now by a record in `current`.
    ///
    /// Returns the failure reason so callers can surface it as a precondition error.
    pub fn check_available(
        &self,
        transition: &Transition,
        current: Uuid,
        fields: &FieldSnapshot,
    ) -> Result<(), String> {
        if !self.blueprint.is_active {
            return Err(format!("blueprint '{}' is not active", self.blueprint.name));
        }
        if !transition.is_active {
            return Err(format!("transition '{}' is not active", transition.name));
        }
        let state = self
            .state(current)
            .ok_or_else(|| format!("record is in unknown state {current}"))?;
        if state.is_terminal {
            return Err(format!("state '{}' is terminal", state.name));
        }
        if !transition.from_state.matches(current) {
            return Err(format!(
                "record is in '{}', not the source state of '{}'",
                state.name, transition.name
            ));
        }

        let eval = condition::evaluate(&transition.conditions, transition.condition_logic, fields);
        if !eval.passed {
            return Err(format!(
                "transition conditions not met ({} failed)",
                eval.failed.len()
            ));
        }
        Ok(())
    }

    /// Transitions a record in `current` may take, in display order.
    pub fn available_transitions(&self, current: Uuid, fields: &FieldSnapshot) -> Vec<AvailableTransition> {
        let mut candidates: Vec<&Transition> = self
            .transitions
            .iter()
            .filter(|t| self.check_available(t, current, fields).is_ok())
            .collect();
        candidates.sort_by_key(|t| t.display_order);

        candidates
            .into_iter()
            .map(|t| AvailableTransition {
                id: t.id,
                name: t.name.clone(),
                button_label: t.button_label().to_owned(),
                to_state_id: t.to_state,
                to_state_name: self
                    .state(t.to_state)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                has_requirements: t.has_requirements(),
                requires_approval: t.requires_approval(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Validate the whole graph.
///
/// # Errors
/// [`EngineError::ValidationFailed`] describing the first structural problem found.
pub fn validate_graph(graph: &BlueprintGraph) -> Result<ValidationReport, EngineError> {
    let bp = graph.blueprint.id;
    let mut report = ValidationReport::default();

    if graph.blueprint.field.trim().is_empty() {
        return Err(invalid("blueprint has no driver field"));
    }

    // -----------------------------------------------------------------------
    // 1. States
    // -----------------------------------------------------------------------
    let mut state_ids: HashSet<Uuid> = HashSet::new();
    for state in &graph.states {
        if state.blueprint_id != bp {
            return Err(invalid(format!("state '{}' belongs to another blueprint", state.name)));
        }
        if !state_ids.insert(state.id) {
            return Err(invalid(format!("duplicate state ID: {}", state.id)));
        }
        validate_state(state)?;
    }

    match graph.states.iter().filter(|s| s.is_initial).count() {
        1 => {}
        0 if graph.states.is_empty() => report.warnings.push("blueprint has no states".into()),
        0 => report.warnings.push("no state is marked initial".into()),
        n => report.warnings.push(format!("{n} states are marked initial")),
    }

    // -----------------------------------------------------------------------
    // 2. Transitions
    // -----------------------------------------------------------------------
    let mut transition_ids: HashSet<Uuid> = HashSet::new();
    for transition in &graph.transitions {
        if transition.blueprint_id != bp {
            return Err(invalid(format!("transition '{}' belongs to another blueprint", transition.name)));
        }
        if !transition_ids.insert(transition.id) {
            return Err(invalid(format!("duplicate transition ID: {}", transition.id)));
        }
        if let SourceState::State(from) = transition.from_state {
            if !state_ids.contains(&from) {
                return Err(invalid(format!(
                    "transition '{}' references unknown state {from} (from side)",
                    transition.name
                )));
            }
        }
        if !state_ids.contains(&transition.to_state) {
            return Err(invalid(format!(
                "transition '{}' references unknown state {} (to side)",
                transition.name, transition.to_state
            )));
        }
        validate_transition(transition)?;
    }

    // -----------------------------------------------------------------------
    // 3. SLAs
    // -----------------------------------------------------------------------
    for sla in &graph.slas {
        if sla.blueprint_id != bp || !state_ids.contains(&sla.state_id) {
            return Err(invalid(format!("SLA '{}' references a state outside this blueprint", sla.name)));
        }
        validate_sla(sla)?;
    }
    let mut seen: HashSet<Uuid> = HashSet::new();
    for sla in graph.slas.iter().filter(|s| s.is_active) {
        if !seen.insert(sla.state_id) {
            let name = graph.state(sla.state_id).map(|s| s.name.as_str()).unwrap_or("?");
            report.warnings.push(format!("state '{name}' has more than one active SLA"));
        }
    }

    Ok(report)
}

pub(crate) fn validate_state(state: &State) -> Result<(), EngineError> {
    if state.name.trim().is_empty() {
        return Err(invalid("state name must not be empty"));
    }
    Ok(())
}

/// Validate a transition's own configuration (not its state references).
pub fn validate_transition(transition: &Transition) -> Result<(), EngineError> {
    if transition.name.trim().is_empty() {
        return Err(invalid("transition name must not be empty"));
    }

    for condition in &transition.conditions {
        if condition.field.trim().is_empty() {
            return Err(invalid(format!("condition in '{}' has no field", transition.name)));
        }
        ConditionOperator::from_str(&condition.operator).map_err(invalid)?;
    }

    let mut requirement_ids: HashSet<Uuid> = HashSet::new();
    for requirement in &transition.requirements {
        if !requirement_ids.insert(requirement.id) {
            return Err(invalid(format!("duplicate requirement ID: {}", requirement.id)));
        }
        match &requirement.kind {
            RequirementKind::MandatoryField { field } if field.trim().is_empty() => {
                return Err(invalid("mandatory_field requirement needs a field"));
            }
            RequirementKind::Attachment { max_size: Some(0), .. } => {
                return Err(invalid("attachment max_size must be positive"));
            }
            RequirementKind::Checklist { items } => {
                if items.is_empty() {
                    return Err(invalid("checklist requirement needs at least one item"));
                }
                let mut ids = HashSet::new();
                if items.iter().any(|i| i.id.trim().is_empty() || !ids.insert(i.id.as_str())) {
                    return Err(invalid("checklist item ids must be non-empty and unique"));
                }
            }
            _ => {}
        }
    }

    for action in &transition.actions {
        if action.action_type.trim().is_empty() {
            return Err(invalid(format!("action in '{}' has no type", transition.name)));
        }
    }

    if let Some(approval) = &transition.approval {
        match &approval.approvers {
            ApproverSource::SpecificUsers { user_ids } if user_ids.is_empty() => {
                return Err(invalid("specific_users approval needs at least one user"));
            }
            ApproverSource::RoleBased { role_ids } if role_ids.is_empty() => {
                return Err(invalid("role_based approval needs at least one role"));
            }
            ApproverSource::Manager { levels: 0 } => {
                return Err(invalid("manager approval needs at least one level"));
            }
            ApproverSource::FieldValue { field } if field.trim().is_empty() => {
                return Err(invalid("field_value approval needs a field"));
            }
            _ => {}
        }
        if approval.auto_reject_days == Some(0) {
            return Err(invalid("auto_reject_days must be positive"));
        }
        match (approval.escalation_hours, &approval.escalate_to) {
            (Some(0), _) => return Err(invalid("escalation_hours must be positive")),
            (Some(_), None) => return Err(invalid("escalation_hours needs an escalation target")),
            (_, Some(EscalationTarget::Role { role_ids })) if role_ids.is_empty() => {
                return Err(invalid("role escalation needs at least one role"));
            }
            _ => {}
        }
        if approval.reminder_hours == Some(0) {
            return Err(invalid("reminder_hours must be positive"));
        }
    }

    Ok(())
}

pub fn validate_sla(sla: &BlueprintSla) -> Result<(), EngineError> {
    if sla.duration_hours == 0 {
        return Err(invalid(format!("SLA '{}' needs a positive duration", sla.name)));
    }
    for escalation in &sla.escalations {
        if escalation.action_type.trim().is_empty() {
            return Err(invalid(format!("escalation on SLA '{}' has no action type", sla.name)));
        }
        if escalation.trigger == EscalationTrigger::Approaching {
            if let Some(v) = escalation.trigger_value {
                if v == 0 || v > 100 {
                    return Err(invalid(format!(
                        "approaching trigger_value must be within 1..=100, got {v}"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::ValidationFailed(msg.into())
}

// ---------------------------------------------------------------------------
// State sync from field options
// ---------------------------------------------------------------------------

/// States to create so every option of the driver field has a state.
///
/// One-directional: existing states are never renamed or removed.
pub fn states_for_new_options(graph: &BlueprintGraph, options: &[FieldOption]) -> Vec<State> {
    let existing: HashSet<&str> = graph
        .states
        .iter()
        .filter_map(|s| s.field_option_value.as_deref())
        .collect();

    options
        .iter()
        .filter(|o| !existing.contains(o.value.as_str()))
        .map(|o| {
            let flag = |key: &str| o.metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
            let mut state = State::new(graph.blueprint.id, o.label.clone()).with_option(o.value.clone());
            state.color = o.metadata.get("color").and_then(|v| v.as_str()).map(str::to_owned);
            state.is_initial = flag("is_initial");
            state.is_terminal = match o.metadata.get("is_terminal").and_then(|v| v.as_bool()) {
                Some(explicit) => explicit,
                None => flag("is_won_stage") || flag("is_lost_stage"),
            };
            state
        })
        .collect()
}

/// A transition between every ordered pair of distinct states whose source is
/// not terminal.
pub fn default_transitions(graph: &BlueprintGraph) -> Vec<Transition> {
    let mut out = Vec::new();
    for from in graph.states.iter().filter(|s| !s.is_terminal) {
        for to in graph.states.iter().filter(|s| s.id != from.id) {
            out.push(Transition::new(
                graph.blueprint.id,
                format!("Move to {}", to.name),
                SourceState::State(from.id),
                to.id,
            ));
        }
    }
    out
}
