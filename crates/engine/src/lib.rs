//! `engine` crate — blueprint models, the transition state machine, approval
//! gates with their reminders, escalation and delegation, SLA tracking, and
//! the persistence port they run against.

pub mod approval;
pub mod authoring;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod followup;
pub mod graph;
pub mod models;
pub mod record;
pub mod requirement;
pub mod runtime;
pub mod sla;
pub mod store;
pub mod sweeper;

pub use approval::{ApproverResolver, Decision};
pub use authoring::Authoring;
pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::{BlueprintEngine, CompletionOutcome, EngineBuilder, ExecutionProgress, NextStep};
pub use followup::{DelegationOverview, FollowUpReport};
pub use graph::{validate_graph, BlueprintGraph};
pub use models::{Blueprint, BlueprintSla, State, Transition};
pub use record::{RecordReader, RecordSnapshot};
pub use requirement::RequirementSubmission;
pub use store::{BlueprintStore, MemoryStore, StoreError};
pub use sweeper::{SweepReport, Sweeper};

#[cfg(test)]
mod executor_tests;
