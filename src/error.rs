//! Crate-wide error taxonomy.
//!
//! Library code returns [`Result<T>`] throughout; the CLI boundary in `main.rs`
//! converts to `anyhow::Result` the way the teacher's `app`/`main.rs` split does.

use crate::agent::TimeoutKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("plan branch '{0}' does not exist")]
    PlanBranchMissing(String),

    #[error("spec.md is missing from the plan branch")]
    SpecMissing,

    #[error("no open tickets available")]
    NoTicketsAvailable,

    #[error("git {args:?} failed:\n{output}")]
    GitCommandFailed { args: Vec<String>, output: String },

    #[error("merge conflict on ticket {ticket_id}: {detail}")]
    MergeConflict { ticket_id: String, detail: String },

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("backend not implemented: {0}")]
    BackendUnimplemented(String),

    #[error("agent run timed out ({0:?})")]
    AgentTimeout(TimeoutKind),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
