//! Process entry-point plumbing (§1.1, §4.8): discovers the repo-local
//! config, wires up logging, and converts library errors to the
//! `anyhow`-based exit path `main.rs` uses — grounded on the teacher's
//! `initialize_app`/`handle_fatal_error` split between library `Result<T,
//! Error>` and the CLI boundary.

pub mod logging;

use crate::config::ScriptoriumConfig;
use std::path::PathBuf;

pub struct AppConfig {
    pub repo_path: PathBuf,
    pub project_name: String,
    pub config: ScriptoriumConfig,
}

impl AppConfig {
    /// Loads `scriptorium.json` (if present) from `repo_path` and derives a
    /// project name from the directory's file name, for log-path scoping.
    pub fn discover(repo_path: PathBuf) -> anyhow::Result<Self> {
        let config = ScriptoriumConfig::load(&repo_path)?;
        let project_name = repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "scriptorium".to_string());
        Ok(Self {
            repo_path,
            project_name,
            config,
        })
    }
}

/// Logs a fatal startup error at `ERROR` and exits non-zero — the boundary
/// where library `Result<T, Error>` becomes a process exit code.
pub fn handle_fatal_error(err: anyhow::Error) -> ! {
    tracing::error!(error = %err, "fatal error, exiting");
    eprintln!("scriptorium: {err}");
    std::process::exit(1);
}
