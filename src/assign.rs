//! Assignment (C6).
//!
//! Picks the oldest open ticket, materializes a ticket branch and worktree in
//! the main repository, and records the worktree path onto the plan branch.
//! Grounded on the teacher's worktree-creation flow in `src/worktree/manager.rs`
//! (branch-then-worktree-add, deterministic path under a dotdir) generalized
//! from session ids to ticket ids.

use crate::error::{Error, Result};
use crate::git::{run_git, PlanStore};
use crate::queue::PendingEntry;
use crate::subprocess::SubprocessManager;
use crate::ticket::{self, TicketState};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Assignment {
    pub ticket_id: u32,
    pub slug: String,
    pub branch: String,
    pub worktree: PathBuf,
}

impl Assignment {
    pub fn branch_for(ticket_id: u32) -> String {
        format!("scriptorium/ticket-{ticket_id:04}")
    }

    pub fn worktree_path_for(repo_path: &std::path::Path, ticket_id: u32) -> PathBuf {
        repo_path
            .join(".scriptorium")
            .join("worktrees")
            .join(format!("{ticket_id:04}"))
    }
}

/// Picks the lexicographically smallest file in `tickets/open/`, branches a
/// ticket branch off `master`, adds a worktree for it, and moves the ticket
/// to `in-progress` with `**Worktree:**` recorded — all on the plan branch in
/// one commit. Fails with [`Error::NoTicketsAvailable`] if `open/` is empty.
pub async fn assign_oldest_open_ticket(
    plan: &PlanStore,
    subprocess: &SubprocessManager,
) -> Result<Assignment> {
    let repo_path = plan.repo_path().to_path_buf();

    plan.scoped(|worktree| {
        let repo_path = repo_path.clone();
        let subprocess = subprocess.clone();
        async move {
            let tickets = ticket::load_all_tickets(&worktree)?;
            let mut open: Vec<_> = tickets
                .into_iter()
                .filter(|t| t.state == TicketState::Open)
                .collect();
            open.sort_by_key(|t| t.file_name());
            let mut chosen = open.into_iter().next().ok_or(Error::NoTicketsAvailable)?;

            let branch = Assignment::branch_for(chosen.id);
            let worktree_path = Assignment::worktree_path_for(&repo_path, chosen.id);

            // A ticket can be reassigned after a failed merge (conflict,
            // red health, or NO-SUBMIT), which reuses this same
            // deterministic branch name. `merge.rs` tears its worktree and
            // branch down on reopen, but force-create here too so a branch
            // left over from a crash before that teardown ran doesn't wedge
            // assignment with "branch already exists".
            run_git(&subprocess, &repo_path, &["branch", "-f", &branch, "master"]).await?;
            if let Some(parent) = worktree_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let _ = run_git(&subprocess, &repo_path, &["worktree", "prune"]).await;
            run_git(
                &subprocess,
                &repo_path,
                &[
                    "worktree",
                    "add",
                    "--force",
                    worktree_path.to_str().ok_or_else(|| {
                        Error::InvalidInput("worktree path is not valid UTF-8".to_string())
                    })?,
                    &branch,
                ],
            )
            .await?;

            let old_relpath = chosen.relpath();
            chosen.state = TicketState::InProgress;
            chosen.set_worktree(&worktree_path.to_string_lossy());

            std::fs::remove_file(worktree.join(old_relpath))?;
            PlanStore::write_file(&worktree, &chosen.relpath(), &chosen.body)?;

            let plan_subprocess = subprocess.clone();
            commit(&worktree, &plan_subprocess, &format!("scriptorium: assign ticket {:04}", chosen.id)).await?;

            Ok(Assignment {
                ticket_id: chosen.id,
                slug: chosen.slug,
                branch,
                worktree: worktree_path,
            })
        }
    })
    .await
}

/// Writes `queue/merge/pending/<id>-<id>.md` for a just-completed assignment
/// and commits. Called once the agent's `submit_pr` summary is known.
pub async fn enqueue_merge_request(
    plan: &PlanStore,
    assignment: &Assignment,
    summary: &str,
) -> Result<()> {
    let entry = PendingEntry {
        ticket_id: assignment.ticket_id,
        branch: assignment.branch.clone(),
        worktree: assignment.worktree.to_string_lossy().to_string(),
        summary: summary.to_string(),
    };

    plan.scoped(|worktree| {
        let entry = entry.clone();
        async move {
            PlanStore::write_file(&worktree, &entry.relpath(), &entry.to_body())?;
            let subprocess = SubprocessManager::production();
            commit(
                &worktree,
                &subprocess,
                &format!("scriptorium: enqueue ticket {:04}", entry.ticket_id),
            )
            .await
        }
    })
    .await
}

async fn commit(worktree: &std::path::Path, subprocess: &SubprocessManager, message: &str) -> Result<()> {
    run_git(subprocess, worktree, &["add", "-A"]).await?;
    let diff = crate::subprocess::ProcessCommandBuilder::new("git")
        .current_dir(worktree)
        .args(["diff", "--cached", "--quiet"])
        .build();
    let output = subprocess
        .runner()
        .run(diff)
        .await
        .map_err(|e| Error::GitCommandFailed {
            args: vec!["diff".into(), "--cached".into(), "--quiet".into()],
            output: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    run_git(subprocess, worktree, &["commit", "-m", message]).await?;
    Ok(())
}

/// A fresh ticket body, used by tests and by the architect/manager
/// generators' call sites when materializing new tickets.
pub fn new_ticket_body(area_id: &str) -> String {
    format!("**Area:** {area_id}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(dir: &std::path::Path, args: &[&str]) {
        let subprocess = SubprocessManager::production();
        run_git(&subprocess, dir, args).await.unwrap();
    }

    async fn init_repo_with_open_ticket() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-q"]).await;
        run(dir.path(), &["config", "user.email", "test@example.com"]).await;
        run(dir.path(), &["config", "user.name", "Test"]).await;
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(dir.path(), &["add", "-A"]).await;
        run(dir.path(), &["commit", "-q", "-m", "init"]).await;
        run(dir.path(), &["branch", "scriptorium/plan"]).await;

        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        plan.scoped(|path| async move {
            PlanStore::write_file(&path, "tickets/open/0001-first.md", &new_ticket_body("core"))?;
            let subprocess = SubprocessManager::production();
            commit(&path, &subprocess, "seed ticket").await
        })
        .await
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn assigns_oldest_open_ticket_and_records_worktree() {
        let dir = init_repo_with_open_ticket().await;
        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();

        let assignment = assign_oldest_open_ticket(&plan, &subprocess).await.unwrap();
        assert_eq!(assignment.ticket_id, 1);
        assert_eq!(assignment.branch, "scriptorium/ticket-0001");
        assert!(assignment.worktree.exists());

        let tickets = plan
            .scoped(|path| async move { ticket::load_all_tickets(&path) })
            .await
            .unwrap();
        let found = tickets.iter().find(|t| t.id == 1).unwrap();
        assert_eq!(found.state, TicketState::InProgress);
        assert_eq!(
            found.worktree_path().as_deref(),
            Some(assignment.worktree.to_string_lossy().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn assign_fails_when_no_open_tickets() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-q"]).await;
        run(dir.path(), &["config", "user.email", "test@example.com"]).await;
        run(dir.path(), &["config", "user.name", "Test"]).await;
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(dir.path(), &["add", "-A"]).await;
        run(dir.path(), &["commit", "-q", "-m", "init"]).await;
        run(dir.path(), &["branch", "scriptorium/plan"]).await;

        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let result = assign_oldest_open_ticket(&plan, &subprocess).await;
        assert!(matches!(result, Err(Error::NoTicketsAvailable)));
    }

    #[tokio::test]
    async fn branch_creation_uses_force_flag_for_idempotent_reassignment() {
        // Pins §ownership: a ticket can be reassigned after a failed merge
        // reuses the same deterministic branch name, so the create must be
        // `-f` rather than failing with "branch already exists".
        let (subprocess, mut mock) = SubprocessManager::mock();
        let branch = Assignment::branch_for(7);
        let matcher_branch = branch.clone();
        mock.expect_command("git")
            .with_args(move |args| args == ["branch", "-f", &matcher_branch, "master"])
            .returns_success()
            .finish();

        run_git(&subprocess, std::path::Path::new("/repo"), &["branch", "-f", &branch, "master"])
            .await
            .unwrap();
        assert!(mock.verify_called("git", 1));
    }

    #[tokio::test]
    async fn enqueue_writes_pending_entry() {
        let dir = init_repo_with_open_ticket().await;
        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let assignment = assign_oldest_open_ticket(&plan, &subprocess).await.unwrap();

        enqueue_merge_request(&plan, &assignment, "merge me").await.unwrap();

        let pending = plan
            .scoped(|path| async move { crate::queue::list_pending(&path) })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.summary, "merge me");
        assert_eq!(pending[0].1.ticket_id, 1);
    }
}
