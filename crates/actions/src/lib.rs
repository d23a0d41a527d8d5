//! `actions` crate — the `ActionHandler` trait and the helpers shared by handlers.
//!
//! Every side effect a blueprint transition or SLA escalation declares (field
//! writes, notifications, webhooks, record creation, ...) is carried out by an
//! [`ActionHandler`] registered under the action's `type` tag. The engine only
//! orders and dispatches; what a handler does is up to the host application.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod template;
pub mod traits;

pub use error::ActionError;
pub use traits::{ActionContext, ActionHandler, ActionRegistry};
