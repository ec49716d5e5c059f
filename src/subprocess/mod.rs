//! Unified subprocess abstraction layer for external tool integration
//!
//! This module provides a clean, testable abstraction over subprocess execution,
//! used by both the git plan store and the agent process supervisor. A trait-based
//! [`ProcessRunner`] lets production code run real child processes while tests swap
//! in [`MockProcessRunner`] without touching the filesystem.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::ProcessCommand;
pub use runner::{ExitStatus, ProcessOutput, ProcessRunner, TokioProcessRunner};

use std::sync::Arc;

/// Central manager for subprocess operations across Scriptorium.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn production() -> Self {
        Self::new(Arc::new(runner::TokioProcessRunner))
    }

    #[cfg(test)]
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}
