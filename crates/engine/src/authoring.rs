//! Blueprint authoring: CRUD over definitions with validation before anything
//! is persisted.
//!
//! Transition children (conditions, requirements, actions, approval) and SLA
//! escalations are owned by their parent and saved with it.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::graph::{self, BlueprintGraph, ValidationReport};
use crate::models::{
    Approval, Blueprint, BlueprintSla, Condition, FieldOption, Requirement, SlaEscalation,
    SourceState, State, Transition, TransitionAction,
};
use crate::store::BlueprintStore;
use crate::EngineError;

#[derive(Clone)]
pub struct Authoring {
    store: Arc<dyn BlueprintStore>,
}

impl Authoring {
    pub fn new(store: Arc<dyn BlueprintStore>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Blueprints
    // -----------------------------------------------------------------------

    pub async fn create_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint, EngineError> {
        if blueprint.name.trim().is_empty() {
            return Err(EngineError::ValidationFailed("blueprint name must not be empty".into()));
        }
        if blueprint.field.trim().is_empty() {
            return Err(EngineError::ValidationFailed("blueprint has no driver field".into()));
        }
        self.store.put_blueprint(&blueprint).await?;
        info!(blueprint_id = %blueprint.id, "created blueprint '{}'", blueprint.name);
        Ok(blueprint)
    }

    pub async fn update_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint, EngineError> {
        self.store.load_graph(blueprint.id).await?;
        if blueprint.field.trim().is_empty() {
            return Err(EngineError::ValidationFailed("blueprint has no driver field".into()));
        }
        self.store.put_blueprint(&blueprint).await?;
        Ok(blueprint)
    }

    pub async fn delete_blueprint(&self, id: Uuid) -> Result<(), EngineError> {
        self.store.delete_blueprint(id).await?;
        info!(blueprint_id = %id, "deleted blueprint");
        Ok(())
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<Blueprint, EngineError> {
        let mut blueprint = self.store.load_graph(id).await?.blueprint;
        blueprint.is_active = active;
        self.store.put_blueprint(&blueprint).await?;
        info!(blueprint_id = %id, active, "toggled blueprint");
        Ok(blueprint)
    }

    pub async fn graph(&self, id: Uuid) -> Result<BlueprintGraph, EngineError> {
        Ok(self.store.load_graph(id).await?)
    }

    pub async fn list_blueprints(&self, module_id: Option<Uuid>) -> Result<Vec<Blueprint>, EngineError> {
        Ok(self.store.list_blueprints(module_id).await?)
    }

    pub async fn validate(&self, id: Uuid) -> Result<ValidationReport, EngineError> {
        graph::validate_graph(&self.store.load_graph(id).await?)
    }

    /// Validate a complete graph and persist all of it.
    #[instrument(skip(self, graph), fields(blueprint_id = %graph.blueprint.id))]
    pub async fn import_graph(&self, graph: BlueprintGraph) -> Result<ValidationReport, EngineError> {
        let report = graph::validate_graph(&graph)?;
        for w in &report.warnings {
            warn!("{}", w);
        }

        self.store.put_blueprint(&graph.blueprint).await?;
        for state in &graph.states {
            self.store.put_state(state).await?;
        }
        for transition in &graph.transitions {
            self.store.put_transition(transition).await?;
        }
        for sla in &graph.slas {
            self.store.put_sla(sla).await?;
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // States
    // -----------------------------------------------------------------------

    pub async fn put_state(&self, state: State) -> Result<State, EngineError> {
        graph::validate_state(&state)?;
        self.store.load_graph(state.blueprint_id).await?;
        self.store.put_state(&state).await?;
        Ok(state)
    }

    /// Fails with `PreconditionFailed` while records still sit in the state.
    pub async fn delete_state(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.store.delete_state(id).await?)
    }

    /// Create a state for every driver-field option that has none yet.
    pub async fn sync_states(&self, blueprint_id: Uuid, options: &[FieldOption]) -> Result<Vec<State>, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let created = graph::states_for_new_options(&graph, options);
        for state in &created {
            self.store.put_state(state).await?;
        }
        info!(blueprint_id = %blueprint_id, created = created.len(), "synced states from field options");
        Ok(created)
    }

    /// Build a blueprint from scratch: one state per option, with a transition
    /// between every pair of states (terminal states have none outgoing).
    pub async fn create_default_blueprint(
        &self,
        blueprint: Blueprint,
        options: &[FieldOption],
    ) -> Result<BlueprintGraph, EngineError> {
        let mut graph = BlueprintGraph::new(blueprint);
        graph.states = graph::states_for_new_options(&graph, options);
        if !graph.states.iter().any(|s| s.is_initial) {
            if let Some(first) = graph.states.first_mut() {
                first.is_initial = true;
            }
        }
        graph.transitions = graph::default_transitions(&graph);
        self.import_graph(graph.clone()).await?;
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub async fn put_transition(&self, transition: Transition) -> Result<Transition, EngineError> {
        let graph = self.store.load_graph(transition.blueprint_id).await?;
        check_transition_states(&graph, &transition)?;
        graph::validate_transition(&transition)?;
        self.store.put_transition(&transition).await?;
        Ok(transition)
    }

    pub async fn delete_transition(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.store.delete_transition(id).await?)
    }

    /// Load a transition, apply `edit`, validate and save.
    pub async fn edit_transition(
        &self,
        blueprint_id: Uuid,
        transition_id: Uuid,
        edit: impl FnOnce(&mut Transition),
    ) -> Result<Transition, EngineError> {
        let graph = self.store.load_graph(blueprint_id).await?;
        let mut transition = graph
            .transition(transition_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("transition", transition_id))?;
        edit(&mut transition);
        transition.id = transition_id;
        transition.blueprint_id = blueprint_id;
        check_transition_states(&graph, &transition)?;
        graph::validate_transition(&transition)?;
        self.store.put_transition(&transition).await?;
        Ok(transition)
    }

    pub async fn add_condition(&self, bp: Uuid, transition: Uuid, condition: Condition) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.conditions.push(condition)).await
    }

    pub async fn remove_condition(&self, bp: Uuid, transition: Uuid, condition_id: Uuid) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.conditions.retain(|c| c.id != condition_id)).await
    }

    pub async fn add_requirement(&self, bp: Uuid, transition: Uuid, requirement: Requirement) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.requirements.push(requirement)).await
    }

    pub async fn remove_requirement(&self, bp: Uuid, transition: Uuid, requirement_id: Uuid) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.requirements.retain(|r| r.id != requirement_id)).await
    }

    pub async fn add_action(&self, bp: Uuid, transition: Uuid, action: TransitionAction) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.actions.push(action)).await
    }

    pub async fn remove_action(&self, bp: Uuid, transition: Uuid, action_id: Uuid) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.actions.retain(|a| a.id != action_id)).await
    }

    /// Attach, replace or (with `None`) remove the approval gate.
    pub async fn set_approval(&self, bp: Uuid, transition: Uuid, approval: Option<Approval>) -> Result<Transition, EngineError> {
        self.edit_transition(bp, transition, |t| t.approval = approval).await
    }

    // -----------------------------------------------------------------------
    // SLAs
    // -----------------------------------------------------------------------

    pub async fn put_sla(&self, sla: BlueprintSla) -> Result<BlueprintSla, EngineError> {
        let graph = self.store.load_graph(sla.blueprint_id).await?;
        if graph.state(sla.state_id).is_none() {
            return Err(EngineError::ValidationFailed(format!(
                "SLA '{}' references a state outside this blueprint",
                sla.name
            )));
        }
        graph::validate_sla(&sla)?;
        self.store.put_sla(&sla).await?;
        Ok(sla)
    }

    pub async fn delete_sla(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.store.delete_sla(id).await?)
    }

    pub async fn add_escalation(&self, bp: Uuid, sla_id: Uuid, escalation: SlaEscalation) -> Result<BlueprintSla, EngineError> {
        let mut sla = self.find_sla(bp, sla_id).await?;
        sla.escalations.push(escalation);
        self.put_sla(sla).await
    }

    pub async fn remove_escalation(&self, bp: Uuid, sla_id: Uuid, escalation_id: Uuid) -> Result<BlueprintSla, EngineError> {
        let mut sla = self.find_sla(bp, sla_id).await?;
        sla.escalations.retain(|e| e.id != escalation_id);
        self.put_sla(sla).await
    }

    async fn find_sla(&self, bp: Uuid, sla_id: Uuid) -> Result<BlueprintSla, EngineError> {
        self.store
            .load_graph(bp)
            .await?
            .slas
            .into_iter()
            .find(|s| s.id == sla_id)
            .ok_or_else(|| EngineError::not_found("sla", sla_id))
    }
}

fn check_transition_states(graph: &BlueprintGraph, transition: &Transition) -> Result<(), EngineError> {
    let known = |id: Uuid| graph.state(id).is_some();
    if let SourceState::State(from) = transition.from_state {
        if !known(from) {
            return Err(EngineError::ValidationFailed(format!(
                "transition '{}' starts from a state outside this blueprint",
                transition.name
            )));
        }
    }
    if !known(transition.to_state) {
        return Err(EngineError::ValidationFailed(format!(
            "transition '{}' leads to a state outside this blueprint",
            transition.name
        )));
    }
    Ok(())
}
