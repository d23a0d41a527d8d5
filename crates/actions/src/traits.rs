//! The `ActionHandler` trait — the contract every action type must fulfil.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::ActionError;

/// Context handed to every handler when an action is dispatched.
///
/// Defined here (in the actions crate) so the engine and the concrete handler
/// implementations can share it without depending on each other.
#[derive(Debug, Clone, Serialize)]
pub struct ActionContext {
    pub blueprint_id: Uuid,
    pub module_id: Uuid,
    pub record_id: Uuid,
    /// Execution that triggered the action. `None` for SLA escalations.
    pub execution_id: Option<Uuid>,
    pub transition_name: Option<String>,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub executed_by: Option<Uuid>,
    /// Requirement data the user submitted while the execution was open.
    pub requirements: Value,
    /// Snapshot of the record's field values at dispatch time.
    pub record: Value,
    /// Anything else the dispatcher wants to expose (SLA figures, escalation ids).
    pub extra: Value,
}

impl ActionContext {
    /// JSON view of the context, used for `{{variable}}` substitution.
    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The core action trait.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the side effect described by `config` and return a JSON result
    /// that ends up in the dispatch report.
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}

/// Maps action `type` tags to handler implementations.
pub type ActionRegistry = HashMap<String, Arc<dyn ActionHandler>>;
