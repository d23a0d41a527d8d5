//! `TracingHandler` — records the dispatch in the log and echoes the rendered config.
//!
//! The worker binary registers it for the standard action types so escalations
//! can be observed end to end before real delivery handlers are wired in.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::template::render_value;
use crate::{ActionContext, ActionError, ActionHandler};

/// Action types a blueprint may reference out of the box.
pub const STANDARD_ACTION_TYPES: &[&str] = &[
    "send_email",
    "update_field",
    "create_record",
    "create_task",
    "webhook",
    "notify_user",
    "add_tag",
    "remove_tag",
];

pub struct TracingHandler {
    action_type: String,
}

impl TracingHandler {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self { action_type: action_type.into() }
    }
}

#[async_trait]
impl ActionHandler for TracingHandler {
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        let rendered = render_value(config, &ctx.as_value());
        info!(
            action_type = %self.action_type,
            record_id = %ctx.record_id,
            "dispatching action: {}",
            rendered
        );
        Ok(json!({ "action_type": self.action_type, "config": rendered }))
    }
}
