//! # Scriptorium
//!
//! An agent-orchestration daemon that drives a fleet of LLM coding agents
//! through a git-native planning and merge workflow. Orchestration state
//! (spec, areas, tickets, merge queue) lives entirely as committed files on
//! a `scriptorium/plan` branch; the daemon assigns tickets to coding agents
//! running in isolated worktrees and serializes their merges back to
//! `master` through a single-flight queue.
//!
//! ## Modules
//!
//! - `error` - crate-wide error taxonomy
//! - `subprocess` - process execution abstraction shared by git and agent calls
//! - `git` - the plan-branch git store (scoped worktrees, commits)
//! - `ticket` - ticket/area/queue file parsing and lifecycle rules
//! - `queue` - merge queue file format
//! - `agent` - coding-agent process supervisor (dual watchdogs, retries)
//! - `harness` - model-string to coding-agent backend dispatch
//! - `mcp` - the `submit_pr` MCP tool HTTP endpoint
//! - `assign` - ticket assignment and merge-request enqueueing
//! - `merge` - the single-flight merge pipeline
//! - `orchestrator` - the tick loop and signal handling
//! - `generators` - default (unimplemented) architect/manager generators
//! - `config` - `scriptorium.json` loading and endpoint parsing
//! - `app` - process entry-point plumbing (logging, app config)
//! - `cli` - the `scriptorium` command-line surface

pub mod agent;
pub mod app;
pub mod assign;
pub mod cli;
pub mod config;
pub mod error;
pub mod generators;
pub mod git;
pub mod harness;
pub mod mcp;
pub mod merge;
pub mod orchestrator;
pub mod queue;
pub mod subprocess;
pub mod ticket;

pub use error::{Error, Result};
