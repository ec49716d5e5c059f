//! Git Plan Store (C1).
//!
//! All orchestration state lives as committed files on the `scriptorium/plan`
//! branch. This module is the only place that touches that branch: it opens a
//! short-lived worktree, hands the caller a path to read/write files under,
//! and commits the result — mirroring the teacher's subprocess-backed git
//! abstraction (`subprocess::git::GitRunnerImpl`) but scoped to the one
//! "scoped plan worktree" operation the orchestrator actually needs.

use crate::error::{Error, Result};
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Runs `git <args>` in `dir`, returning combined stdout+stderr on failure as
/// [`Error::GitCommandFailed`].
pub async fn run_git(
    subprocess: &SubprocessManager,
    dir: &Path,
    args: &[&str],
) -> Result<String> {
    let command = ProcessCommandBuilder::new("git")
        .current_dir(dir)
        .args(args)
        .build();

    let output = subprocess
        .runner()
        .run(command)
        .await
        .map_err(|e| Error::GitCommandFailed {
            args: args.iter().map(|s| s.to_string()).collect(),
            output: e.to_string(),
        })?;

    if !output.status.success() {
        let mut combined = output.stdout;
        combined.push_str(&output.stderr);
        return Err(Error::GitCommandFailed {
            args: args.iter().map(|s| s.to_string()).collect(),
            output: combined,
        });
    }

    Ok(output.stdout)
}

/// Best-effort `git <args>`; logs a warning on failure instead of propagating.
/// Used for cleanup paths (worktree removal) where failing to clean up must
/// never mask the caller's real result.
async fn run_git_best_effort(subprocess: &SubprocessManager, dir: &Path, args: &[&str]) {
    if let Err(e) = run_git(subprocess, dir, args).await {
        warn!(?args, error = %e, "cleanup git command failed");
    }
}

pub struct PlanStore {
    repo_path: PathBuf,
    subprocess: SubprocessManager,
    branch: String,
}

impl PlanStore {
    pub fn new(repo_path: impl Into<PathBuf>, subprocess: SubprocessManager) -> Self {
        Self {
            repo_path: repo_path.into(),
            subprocess,
            branch: "scriptorium/plan".to_string(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    async fn ensure_branch_exists(&self) -> Result<()> {
        let verify = format!("refs/heads/{}", self.branch);
        run_git(
            &self.subprocess,
            &self.repo_path,
            &["rev-parse", "--verify", &verify],
        )
        .await
        .map_err(|_| Error::PlanBranchMissing(self.branch.clone()))?;
        Ok(())
    }

    /// Acquires a fresh worktree for `scriptorium/plan`, runs `op` with its
    /// path, and force-removes the worktree on every exit path (success,
    /// error, or panic-unwind via the `Drop` guard).
    pub async fn scoped<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.ensure_branch_exists().await?;

        let temp_dir = tempfile::Builder::new()
            .prefix("scriptorium-plan-")
            .tempdir()
            .map_err(Error::Io)?;
        let worktree_path = temp_dir.path().to_path_buf();
        // git worktree add refuses to create the target directory itself
        // when it already exists (tempdir creates it); remove it first.
        std::fs::remove_dir(&worktree_path).ok();

        debug!(path = %worktree_path.display(), "adding plan worktree");
        run_git(
            &self.subprocess,
            &self.repo_path,
            &[
                "worktree",
                "add",
                "--force",
                worktree_path.to_str().unwrap_or_default(),
                &self.branch,
            ],
        )
        .await?;

        let result = op(worktree_path.clone()).await;

        run_git_best_effort(
            &self.subprocess,
            &self.repo_path,
            &[
                "worktree",
                "remove",
                "--force",
                worktree_path.to_str().unwrap_or_default(),
            ],
        )
        .await;
        // The tempdir may already be gone (worktree remove deletes it); drop
        // silently either way.
        let _ = temp_dir.close();

        result
    }

    /// Reads a file at `relpath` from within a plan worktree. Relative to the
    /// worktree root handed to the caller's `scoped` closure.
    pub fn read_file(worktree: &Path, relpath: &str) -> Result<String> {
        std::fs::read_to_string(worktree.join(relpath)).map_err(Error::Io)
    }

    pub fn write_file(worktree: &Path, relpath: &str, contents: &str) -> Result<()> {
        let path = worktree.join(relpath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents).map_err(Error::Io)
    }

    /// Lists markdown files under `subdir` (relative to the worktree root),
    /// sorted lexicographically by full relative path for determinism.
    pub fn list_markdown_files(worktree: &Path, subdir: &str) -> Result<Vec<PathBuf>> {
        let root = worktree.join(subdir);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        collect_markdown(&root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// `git add -A` then `git commit -m <message>`, but only when there is
    /// something staged — empty commits are never produced (Q2/Q3, §4.1).
    pub async fn commit_if_changed(&self, worktree: &Path, message: &str) -> Result<bool> {
        run_git(&self.subprocess, worktree, &["add", "-A"]).await?;

        let diff = ProcessCommandBuilder::new("git")
            .current_dir(worktree)
            .args(["diff", "--cached", "--quiet"])
            .build();
        let output = self
            .subprocess
            .runner()
            .run(diff)
            .await
            .map_err(|e| Error::GitCommandFailed {
                args: vec!["diff".into(), "--cached".into(), "--quiet".into()],
                output: e.to_string(),
            })?;

        if output.status.success() {
            // No staged changes.
            return Ok(false);
        }

        run_git(&self.subprocess, worktree, &["commit", "-m", message]).await?;
        Ok(true)
    }
}

fn collect_markdown(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_markdown(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}
