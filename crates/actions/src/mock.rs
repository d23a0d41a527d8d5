//! `MockHandler` — a test double for `ActionHandler`.
//!
//! Records every config it is asked to execute and returns a
//! programmer-specified result.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::{ActionContext, ActionError, ActionHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Retryable` error for the first `n` calls, then succeed.
    FlakyThenSucceed(usize),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

pub struct MockHandler {
    /// Label used in test assertions.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// Every config seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    /// Shared log of handler names, so tests can assert ordering across handlers.
    pub journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockHandler {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            journal: None,
        }
    }

    /// A mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn flaky(name: impl Into<String>, failures: usize) -> Self {
        Self::with(name, MockBehaviour::FlakyThenSucceed(failures))
    }

    /// Append this handler's name to `journal` on every call.
    pub fn journaled(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ActionHandler for MockHandler {
    async fn execute(&self, config: &Value, _ctx: &ActionContext) -> Result<Value, ActionError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(config.clone());
            calls.len()
        };
        if let Some(journal) = &self.journal {
            journal.lock().unwrap_or_else(|e| e.into_inner()).push(self.name.clone());
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(json!({ "handler": self.name, "result": v })),
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg.clone())),
            MockBehaviour::FlakyThenSucceed(failures) if call_number <= *failures => {
                Err(ActionError::Retryable(format!("transient failure #{call_number}")))
            }
            MockBehaviour::FlakyThenSucceed(_) => Ok(json!({ "handler": self.name })),
            MockBehaviour::FailFatal(msg) => Err(ActionError::Fatal(msg.clone())),
        }
    }
}
