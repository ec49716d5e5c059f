//! Merge Pipeline (C5).
//!
//! Single-flight consumer of the pending queue: merges `master` into the
//! ticket branch, then the ticket branch into `master`, gated by project
//! health checks before and after, tearing down the per-ticket worktree and
//! branch once the ticket leaves in-progress either way. Grounded on the
//! teacher's git-subprocess discipline in `src/git` (every mutation is a
//! `git` invocation through the shared [`crate::subprocess::SubprocessManager`],
//! captured and wrapped as [`crate::error::Error::GitCommandFailed`] on
//! failure), on [`crate::git::PlanStore`] for the plan-branch half of the
//! transaction, and on the teacher's `cleanup_session`/
//! `cleanup_session_after_merge` in `src/worktree/manager.rs` for the
//! worktree/branch teardown.

use crate::error::Result;
use crate::git::{run_git, PlanStore};
use crate::queue::{self, PendingEntry};
use crate::subprocess::SubprocessManager;
use crate::ticket::{self, TicketState};
use std::path::Path;
use tracing::{info, warn};

/// The project health command(s): non-zero exit on any of them means "red
/// master" (§6's "make test" and, when configured, "make integration-test").
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub commands: Vec<Vec<String>>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            commands: vec![vec!["make".to_string(), "test".to_string()]],
        }
    }
}

impl HealthCheck {
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self { commands }
    }

    /// Runs every configured command in `dir` in order; stops and reports red
    /// at the first non-zero exit.
    pub async fn run(&self, subprocess: &SubprocessManager, dir: &Path) -> Result<bool> {
        for command in &self.commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            let built = crate::subprocess::ProcessCommandBuilder::new(program)
                .current_dir(dir)
                .args(args)
                .build();
            let output = subprocess.runner().run(built).await.map_err(|e| {
                crate::error::Error::HealthCheckFailed(format!("{command:?}: {e}"))
            })?;
            if !output.status.success() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Drains exactly one pending queue entry if there is work, or returns
/// `Ok(false)` when idle. Returning `Ok(true)` means "this tick consumed
/// work", not necessarily "a ticket advanced to done" (a red master or an
/// unblocking of stale lock state also return `true`).
pub async fn process_merge_queue(
    plan: &PlanStore,
    subprocess: &SubprocessManager,
    health: &HealthCheck,
) -> Result<bool> {
    let repo_path = plan.repo_path().to_path_buf();
    plan.scoped(|worktree| {
        let repo_path = repo_path.clone();
        let subprocess = subprocess.clone();
        let health = health.clone();
        async move { run_once(&worktree, &repo_path, &subprocess, &health).await }
    })
    .await
}

async fn run_once(
    worktree: &Path,
    repo_path: &Path,
    subprocess: &SubprocessManager,
    health: &HealthCheck,
) -> Result<bool> {
    let active = queue::read_active(worktree)?;
    let pending = queue::list_pending(worktree)?;

    let chosen = match &active {
        Some(relpath) => {
            let matching = pending
                .iter()
                .find(|(path, _)| path_matches_relpath(path, worktree, relpath));
            match matching {
                Some((_, entry)) => Some(entry.clone()),
                None => {
                    // Stale lock: the named entry is already gone (a prior
                    // tick finished the transaction but crashed before
                    // clearing active.md). Converge and stop.
                    warn!(relpath, "clearing stale merge queue lock");
                    queue::clear_active(worktree)?;
                    PlanStore::write_file(worktree, "queue/merge/active.md", "")?;
                    return commit_and_return(worktree, "scriptorium: clear stale merge queue lock", true).await;
                }
            }
        }
        None => pending.first().map(|(_, entry)| entry.clone()),
    };

    let Some(entry) = chosen else {
        return Ok(false);
    };

    if active.is_none() {
        queue::write_active(worktree, &entry.relpath())?;
        commit_if_changed(worktree, "scriptorium: lock merge queue entry").await?;
    }

    if !health.run(subprocess, repo_path).await? {
        info!(ticket = entry.ticket_id, "red master, leaving queue entry locked");
        return Ok(true);
    }

    let ticket_worktree = Path::new(&entry.worktree);
    if run_git(subprocess, ticket_worktree, &["merge", "master", "--no-edit"])
        .await
        .is_err()
    {
        let _ = run_git(subprocess, ticket_worktree, &["merge", "--abort"]).await;
        reopen_with_failure(worktree, repo_path, subprocess, &entry, "CONFLICT").await?;
        return Ok(true);
    }

    let pre_merge_sha = run_git(subprocess, repo_path, &["rev-parse", "HEAD"])
        .await?
        .trim()
        .to_string();

    if run_git(
        subprocess,
        repo_path,
        &["merge", &entry.branch, "--no-ff", "--no-edit"],
    )
    .await
    .is_err()
    {
        let _ = run_git(subprocess, repo_path, &["merge", "--abort"]).await;
        reopen_with_failure(worktree, repo_path, subprocess, &entry, "CONFLICT").await?;
        return Ok(true);
    }

    if !health.run(subprocess, repo_path).await? {
        run_git(subprocess, repo_path, &["reset", "--hard", &pre_merge_sha]).await?;
        reopen_with_failure(worktree, repo_path, subprocess, &entry, "FAIL").await?;
        return Ok(true);
    }

    complete_success(worktree, repo_path, subprocess, &entry).await
}

/// Removes the per-ticket worktree and branch once a ticket leaves
/// in-progress, whichever way it leaves (merged or reopened). Best-effort:
/// a teardown failure must never mask the caller's real result, mirroring
/// [`crate::git::PlanStore::scoped`]'s worktree cleanup.
async fn teardown_ticket_worktree(repo_path: &Path, subprocess: &SubprocessManager, entry: &PendingEntry) {
    if run_git(
        subprocess,
        repo_path,
        &["worktree", "remove", "--force", &entry.worktree],
    )
    .await
    .is_err()
    {
        warn!(ticket = entry.ticket_id, worktree = %entry.worktree, "worktree remove failed, pruning stale entries");
        let _ = run_git(subprocess, repo_path, &["worktree", "prune"]).await;
    }
    if let Err(e) = run_git(subprocess, repo_path, &["branch", "-D", &entry.branch]).await {
        warn!(ticket = entry.ticket_id, branch = %entry.branch, error = %e, "branch delete failed");
    }
}

fn path_matches_relpath(path: &Path, worktree: &Path, relpath: &str) -> bool {
    path.strip_prefix(worktree)
        .map(|rel| rel.to_string_lossy() == relpath)
        .unwrap_or(false)
}

async fn commit_if_changed(worktree: &Path, message: &str) -> Result<bool> {
    // A standalone commit helper mirroring PlanStore::commit_if_changed but
    // callable without holding a PlanStore reference inside `scoped`.
    let subprocess = SubprocessManager::production();
    run_git(&subprocess, worktree, &["add", "-A"]).await?;
    let diff = crate::subprocess::ProcessCommandBuilder::new("git")
        .current_dir(worktree)
        .args(["diff", "--cached", "--quiet"])
        .build();
    let output = subprocess
        .runner()
        .run(diff)
        .await
        .map_err(|e| crate::error::Error::GitCommandFailed {
            args: vec!["diff".into(), "--cached".into(), "--quiet".into()],
            output: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(false);
    }
    run_git(&subprocess, worktree, &["commit", "-m", message]).await?;
    Ok(true)
}

async fn commit_and_return(worktree: &Path, message: &str, result: bool) -> Result<bool> {
    commit_if_changed(worktree, message).await?;
    Ok(result)
}

/// Moves the in-progress ticket named by `entry` back to `open`, strips its
/// worktree line, appends a failure note, deletes the pending file, clears
/// the lock, and commits once (§4.5 steps 4-6's shared reopen flow).
async fn reopen_with_failure(
    worktree: &Path,
    repo_path: &Path,
    subprocess: &SubprocessManager,
    entry: &PendingEntry,
    tag: &str,
) -> Result<()> {
    let tickets = ticket::load_all_tickets(worktree)?;
    let Some(mut found) = tickets
        .into_iter()
        .find(|t| t.id == entry.ticket_id && t.state == TicketState::InProgress)
    else {
        warn!(ticket = entry.ticket_id, "reopen requested but ticket is not in-progress");
        queue::clear_active(worktree)?;
        std::fs::remove_file(worktree.join(entry.relpath())).ok();
        teardown_ticket_worktree(repo_path, subprocess, entry).await;
        return commit_if_changed(worktree, "scriptorium: dequeue failed entry")
            .await
            .map(|_| ());
    };

    let old_relpath = found.relpath();
    found.strip_worktree();
    found.append_failure(tag, &entry.summary);
    found.state = TicketState::Open;

    std::fs::remove_file(worktree.join(old_relpath))?;
    PlanStore::write_file(worktree, &found.relpath(), &found.body)?;
    std::fs::remove_file(worktree.join(entry.relpath())).ok();
    queue::clear_active(worktree)?;
    teardown_ticket_worktree(repo_path, subprocess, entry).await;

    commit_if_changed(worktree, &format!("scriptorium: dequeue ticket {:04} ({tag})", entry.ticket_id))
        .await?;
    Ok(())
}

async fn complete_success(
    worktree: &Path,
    repo_path: &Path,
    subprocess: &SubprocessManager,
    entry: &PendingEntry,
) -> Result<bool> {
    let tickets = ticket::load_all_tickets(worktree)?;
    let Some(mut found) = tickets
        .into_iter()
        .find(|t| t.id == entry.ticket_id && t.state == TicketState::InProgress)
    else {
        return Err(crate::error::Error::InvalidInput(format!(
            "ticket {} is not in-progress at merge completion",
            entry.ticket_id
        )));
    };

    let old_relpath = found.relpath();
    found.state = TicketState::Done;

    std::fs::remove_file(worktree.join(old_relpath))?;
    PlanStore::write_file(worktree, &found.relpath(), &found.body)?;
    std::fs::remove_file(worktree.join(entry.relpath())).ok();
    queue::clear_active(worktree)?;
    teardown_ticket_worktree(repo_path, subprocess, entry).await;

    commit_if_changed(worktree, &format!("scriptorium: complete ticket {:04}", entry.ticket_id)).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Ticket;

    async fn run(dir: &Path, args: &[&str]) {
        let subprocess = SubprocessManager::production();
        run_git(&subprocess, dir, args).await.unwrap();
    }

    async fn write_commit(dir: &Path, path: &str, contents: &str, message: &str) {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, contents).unwrap();
        run(dir, &["add", "-A"]).await;
        run(dir, &["commit", "-q", "-m", message]).await;
    }

    /// Sets up a main repo with `master` + `scriptorium/plan` branches, one
    /// ticket worktree/branch simulating a completed assignment, a pending
    /// queue entry, and the matching in-progress ticket file.
    async fn setup_scenario(ticket_line: &str) -> (tempfile::TempDir, tempfile::TempDir, PendingEntry) {
        let repo = tempfile::tempdir().unwrap();
        run(repo.path(), &["init", "-q"]).await;
        run(repo.path(), &["config", "user.email", "test@example.com"]).await;
        run(repo.path(), &["config", "user.name", "Test"]).await;
        write_commit(repo.path(), "conflict.txt", "line=base\n", "init").await;
        run(repo.path(), &["branch", "scriptorium/plan"]).await;
        run(repo.path(), &["branch", "scriptorium/ticket-0001"]).await;

        let ticket_worktree = tempfile::tempdir().unwrap();
        std::fs::remove_dir(ticket_worktree.path()).ok();
        run(
            repo.path(),
            &[
                "worktree",
                "add",
                ticket_worktree.path().to_str().unwrap(),
                "scriptorium/ticket-0001",
            ],
        )
        .await;
        write_commit(
            ticket_worktree.path(),
            "conflict.txt",
            ticket_line,
            "ticket work",
        )
        .await;

        let plan_store = PlanStore::new(repo.path(), SubprocessManager::production());
        let entry = PendingEntry {
            ticket_id: 1,
            branch: "scriptorium/ticket-0001".to_string(),
            worktree: ticket_worktree.path().to_string_lossy().to_string(),
            summary: "merge me".to_string(),
        };
        plan_store
            .scoped(|path| {
                let entry = entry.clone();
                async move {
                    let mut ticket = Ticket {
                        id: 1,
                        slug: "first".to_string(),
                        state: TicketState::InProgress,
                        body: "**Area:** core\n".to_string(),
                    };
                    ticket.set_worktree(&entry.worktree);
                    PlanStore::write_file(&path, &ticket.relpath(), &ticket.body)?;
                    PlanStore::write_file(&path, &entry.relpath(), &entry.to_body())?;
                    PlanStore::write_file(&path, "queue/merge/active.md", "")?;
                    commit_if_changed(&path, "seed scenario").await?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        (repo, ticket_worktree, entry)
    }

    #[tokio::test]
    async fn queue_success_drains_and_merges() {
        let (repo, ticket_wt, _entry) = setup_scenario("line=base\nfrom-ticket\n").await;
        let ticket_wt_path = ticket_wt.path().to_path_buf();
        let plan = PlanStore::new(repo.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let health = HealthCheck::new(vec![vec!["true".to_string()]]);

        let drained = process_merge_queue(&plan, &subprocess, &health).await.unwrap();
        assert!(drained);

        run(repo.path(), &["checkout", "-q", "master"]).await;
        let contents = std::fs::read_to_string(repo.path().join("conflict.txt")).unwrap();
        assert_eq!(contents, "line=base\nfrom-ticket\n");

        let tickets = plan
            .scoped(|path| async move { ticket::load_all_tickets(&path) })
            .await
            .unwrap();
        assert!(tickets.iter().any(|t| t.id == 1 && t.state == TicketState::Done));
        assert!(!tickets.iter().any(|t| t.state == TicketState::InProgress));

        assert!(!ticket_wt_path.exists(), "ticket worktree should be torn down on success");
        let branch_check = run_git(
            &subprocess,
            repo.path(),
            &["rev-parse", "--verify", "refs/heads/scriptorium/ticket-0001"],
        )
        .await;
        assert!(branch_check.is_err(), "ticket branch should be deleted on success");
    }

    #[tokio::test]
    async fn queue_failure_reopens_ticket() {
        // The health command passes against current master (the pre-merge
        // gate), but the ticket branch deletes the marker file the command
        // checks for, so the post-merge gate goes red and the merge rolls
        // back via `git reset --hard`.
        let repo = tempfile::tempdir().unwrap();
        run(repo.path(), &["init", "-q"]).await;
        run(repo.path(), &["config", "user.email", "test@example.com"]).await;
        run(repo.path(), &["config", "user.name", "Test"]).await;
        write_commit(repo.path(), "PASS_MARKER", "ok\n", "init").await;
        run(repo.path(), &["branch", "scriptorium/plan"]).await;
        run(repo.path(), &["branch", "scriptorium/ticket-0001"]).await;

        let ticket_worktree = tempfile::tempdir().unwrap();
        std::fs::remove_dir(ticket_worktree.path()).ok();
        run(
            repo.path(),
            &[
                "worktree",
                "add",
                ticket_worktree.path().to_str().unwrap(),
                "scriptorium/ticket-0001",
            ],
        )
        .await;
        std::fs::remove_file(ticket_worktree.path().join("PASS_MARKER")).unwrap();
        run(ticket_worktree.path(), &["add", "-A"]).await;
        run(ticket_worktree.path(), &["commit", "-q", "-m", "breaks the build"]).await;

        let plan_store = PlanStore::new(repo.path(), SubprocessManager::production());
        let entry = PendingEntry {
            ticket_id: 1,
            branch: "scriptorium/ticket-0001".to_string(),
            worktree: ticket_worktree.path().to_string_lossy().to_string(),
            summary: "expected failure".to_string(),
        };
        plan_store
            .scoped(|path| {
                let entry = entry.clone();
                async move {
                    let mut ticket = Ticket {
                        id: 1,
                        slug: "first".to_string(),
                        state: TicketState::InProgress,
                        body: "**Area:** core\n".to_string(),
                    };
                    ticket.set_worktree(&entry.worktree);
                    PlanStore::write_file(&path, &ticket.relpath(), &ticket.body)?;
                    PlanStore::write_file(&path, &entry.relpath(), &entry.to_body())?;
                    PlanStore::write_file(&path, "queue/merge/active.md", "")?;
                    commit_if_changed(&path, "seed scenario").await?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        let plan = PlanStore::new(repo.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let health = HealthCheck::new(vec![vec![
            "test".to_string(),
            "-f".to_string(),
            "PASS_MARKER".to_string(),
        ]]);

        let drained = process_merge_queue(&plan, &subprocess, &health).await.unwrap();
        assert!(drained);

        run(repo.path(), &["checkout", "-q", "master"]).await;
        assert!(repo.path().join("PASS_MARKER").exists(), "master should have rolled back");

        let tickets = plan
            .scoped(|path| async move { ticket::load_all_tickets(&path) })
            .await
            .unwrap();
        let reopened = tickets.iter().find(|t| t.id == 1).unwrap();
        assert_eq!(reopened.state, TicketState::Open);
        assert!(reopened.body.contains("## Merge Queue Failure"));
        assert!(reopened.body.contains("FAIL"));
        assert!(reopened.body.contains("expected failure"));
        assert!(reopened.worktree_path().is_none());

        assert!(
            !ticket_worktree.path().exists(),
            "ticket worktree should be torn down after a red post-merge health gate"
        );
        let branch_check = run_git(
            &subprocess,
            repo.path(),
            &["rev-parse", "--verify", "refs/heads/scriptorium/ticket-0001"],
        )
        .await;
        assert!(branch_check.is_err(), "ticket branch should be deleted after reopen");
    }

    #[tokio::test]
    async fn merge_conflict_reopens_with_conflict_tag() {
        let (repo, ticket_wt, _entry) = setup_scenario("line=ticket\n").await;
        let ticket_wt_path = ticket_wt.path().to_path_buf();
        // Make master diverge so the ticket-branch merge of master conflicts.
        write_commit(repo.path(), "conflict.txt", "line=master\n", "master diverges").await;

        let plan = PlanStore::new(repo.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let health = HealthCheck::new(vec![vec!["true".to_string()]]);

        let drained = process_merge_queue(&plan, &subprocess, &health).await.unwrap();
        assert!(drained);

        let tickets = plan
            .scoped(|path| async move { ticket::load_all_tickets(&path) })
            .await
            .unwrap();
        let reopened = tickets.iter().find(|t| t.id == 1).unwrap();
        assert_eq!(reopened.state, TicketState::Open);
        assert!(reopened.body.contains("CONFLICT"));
        assert!(reopened.body.contains("merge me"));

        assert!(
            !ticket_wt_path.exists(),
            "ticket worktree should be torn down after a merge conflict"
        );
        let branch_check = run_git(
            &subprocess,
            repo.path(),
            &["rev-parse", "--verify", "refs/heads/scriptorium/ticket-0001"],
        )
        .await;
        assert!(branch_check.is_err(), "ticket branch should be deleted after reopen");
    }

    #[tokio::test]
    async fn teardown_removes_worktree_and_deletes_branch() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree"))
            .returns_success()
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("branch"))
            .returns_success()
            .finish();

        let entry = PendingEntry {
            ticket_id: 7,
            branch: "scriptorium/ticket-0007".to_string(),
            worktree: "/tmp/scriptorium-ticket-0007".to_string(),
            summary: "done".to_string(),
        };
        teardown_ticket_worktree(Path::new("/repo"), &subprocess, &entry).await;

        let history = mock.get_call_history();
        assert!(history
            .iter()
            .any(|c| c.args == vec!["worktree", "remove", "--force", &entry.worktree]));
        assert!(history
            .iter()
            .any(|c| c.args == vec!["branch", "-D", &entry.branch]));
    }

    #[tokio::test]
    async fn teardown_prunes_stale_worktrees_when_remove_fails() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("worktree") && args.get(1).map(String::as_str) != Some("prune"))
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args == ["worktree", "prune"])
            .returns_success()
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.first().map(String::as_str) == Some("branch"))
            .returns_success()
            .finish();

        let entry = PendingEntry {
            ticket_id: 7,
            branch: "scriptorium/ticket-0007".to_string(),
            worktree: "/tmp/gone-already".to_string(),
            summary: "done".to_string(),
        };
        teardown_ticket_worktree(Path::new("/repo"), &subprocess, &entry).await;

        let history = mock.get_call_history();
        assert!(history.iter().any(|c| c.args == vec!["worktree", "prune"]));
    }

    #[tokio::test]
    async fn idle_queue_returns_false() {
        let repo = tempfile::tempdir().unwrap();
        run(repo.path(), &["init", "-q"]).await;
        run(repo.path(), &["config", "user.email", "test@example.com"]).await;
        run(repo.path(), &["config", "user.name", "Test"]).await;
        write_commit(repo.path(), "README.md", "hi\n", "init").await;
        run(repo.path(), &["branch", "scriptorium/plan"]).await;

        let plan = PlanStore::new(repo.path(), SubprocessManager::production());
        let subprocess = SubprocessManager::production();
        let health = HealthCheck::new(vec![vec!["true".to_string()]]);

        let drained = process_merge_queue(&plan, &subprocess, &health).await.unwrap();
        assert!(!drained);
    }
}
