//! Tick Loop & Signals (C7).
//!
//! Drives every other component in the fixed order health → plan sync →
//! assign → execute → drain, once per tick, sleeping an idle interval
//! between ticks until asked to stop. Grounded on the teacher's top-level
//! cooperative-shutdown loop (`Arc<AtomicBool>` flipped from a
//! `tokio::signal::unix::signal` task, checked between sleeps) generalized
//! from a single long-running command to a repeating tick.

use crate::agent::AgentRunConfig;
use crate::config::ScriptoriumConfig;
use crate::error::{Error, Result};
use crate::git::PlanStore;
use crate::harness;
use crate::mcp::SubmitPrSlot;
use crate::merge::{self, HealthCheck};
use crate::ticket::{self, Ticket, TicketState};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// A generated area document, ready to be written to `areas/<id>.md`.
#[derive(Debug, Clone)]
pub struct AreaDoc {
    pub id: String,
    pub content: String,
}

/// A generated ticket document, ready to be written under `tickets/open/`.
#[derive(Debug, Clone)]
pub struct TicketDoc {
    pub slug: String,
    pub body: String,
}

/// The architect capability: `(model, spec) -> [AreaDoc]` (§9).
#[async_trait]
pub trait ArchitectGenerator: Send + Sync {
    async fn generate_areas(&self, model: &str, spec: &str) -> Result<Vec<AreaDoc>>;
}

/// The manager capability: `(model, area_path, area_content) -> [TicketDoc]` (§9).
#[async_trait]
pub trait ManagerGenerator: Send + Sync {
    async fn generate_tickets(&self, model: &str, area_path: &str, area_content: &str) -> Result<Vec<TicketDoc>>;
}

pub struct Orchestrator {
    plan: PlanStore,
    subprocess: crate::subprocess::SubprocessManager,
    health: HealthCheck,
    config: ScriptoriumConfig,
    mcp_slot: SubmitPrSlot,
    mcp_endpoint: String,
    architect: Arc<dyn ArchitectGenerator>,
    manager: Arc<dyn ManagerGenerator>,
    pub should_run: Arc<AtomicBool>,
    no_output_timeout_ms: u64,
    hard_timeout_ms: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: PlanStore,
        subprocess: crate::subprocess::SubprocessManager,
        health: HealthCheck,
        config: ScriptoriumConfig,
        mcp_slot: SubmitPrSlot,
        mcp_endpoint: String,
        architect: Arc<dyn ArchitectGenerator>,
        manager: Arc<dyn ManagerGenerator>,
    ) -> Self {
        Self {
            plan,
            subprocess,
            health,
            config,
            mcp_slot,
            mcp_endpoint,
            architect,
            manager,
            should_run: Arc::new(AtomicBool::new(true)),
            no_output_timeout_ms: 120_000,
            hard_timeout_ms: 1_800_000,
        }
    }

    /// Installs `SIGINT`/`SIGTERM` handlers that flip `should_run` to false.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> Result<()> {
        let flag = Arc::clone(&self.should_run);
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(Error::Io)?;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(Error::Io)?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            flag.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Runs ticks until `should_run` is cleared.
    pub async fn run(&self) -> Result<()> {
        while self.should_run.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed");
            }
            tokio::time::sleep(IDLE_INTERVAL).await;
        }
        Ok(())
    }

    /// Runs at most `n` ticks, for test bounding.
    pub async fn run_for_ticks(&self, n: u32) -> Result<()> {
        for _ in 0..n {
            if !self.should_run.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed");
            }
        }
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        let master_green = self.health.run(&self.subprocess, self.plan.repo_path()).await?;

        self.sync_plan().await?;

        if master_green {
            let in_progress_exists = self.find_in_progress().await?.is_some();
            if !in_progress_exists {
                match crate::assign::assign_oldest_open_ticket(&self.plan, &self.subprocess).await {
                    Ok(assignment) => info!(ticket = assignment.ticket_id, "assigned ticket"),
                    Err(Error::NoTicketsAvailable) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(ticket) = self.find_in_progress().await? {
            self.execute(ticket).await?;
        }

        merge::process_merge_queue(&self.plan, &self.subprocess, &self.health).await?;

        Ok(())
    }

    async fn find_in_progress(&self) -> Result<Option<Ticket>> {
        self.plan
            .scoped(|worktree| async move {
                let tickets = ticket::load_all_tickets(&worktree)?;
                Ok(tickets.into_iter().find(|t| t.state == TicketState::InProgress))
            })
            .await
    }

    async fn sync_plan(&self) -> Result<()> {
        let architect = Arc::clone(&self.architect);
        let manager = Arc::clone(&self.manager);
        let model_architect = self.config.models.architect.clone();
        let model_manager = self.config.models.manager.clone();

        self.plan
            .scoped(|worktree| async move {
                let areas = PlanStore::list_markdown_files(&worktree, "areas")?;
                if areas.is_empty() {
                    let spec_path = worktree.join("spec.md");
                    if !spec_path.exists() {
                        return Err(Error::SpecMissing);
                    }
                    let spec = PlanStore::read_file(&worktree, "spec.md")?;
                    let generated = architect.generate_areas(&model_architect, &spec).await?;
                    for area in &generated {
                        PlanStore::write_file(&worktree, &format!("areas/{}.md", area.id), &area.content)?;
                    }
                    commit(&worktree, "scriptorium: update areas from spec").await?;
                }

                let tickets = ticket::load_all_tickets(&worktree)?;
                let active = ticket::collect_active_areas(&tickets);
                let area_files = PlanStore::list_markdown_files(&worktree, "areas")?;
                let needing = ticket::areas_needing_tickets(&area_files, &active);

                if !needing.is_empty() {
                    let mut next_id = ticket::next_ticket_id(&worktree)?;
                    for area_path in needing {
                        let relpath = area_path
                            .strip_prefix(&worktree)
                            .unwrap_or(&area_path)
                            .to_string_lossy()
                            .to_string();
                        let content = std::fs::read_to_string(&area_path)?;
                        let docs = manager
                            .generate_tickets(&model_manager, &relpath, &content)
                            .await?;
                        for doc in docs {
                            let slug = ticket::normalize_slug(&doc.slug)?;
                            let file_name = format!("{next_id:04}-{slug}.md");
                            PlanStore::write_file(&worktree, &format!("tickets/open/{file_name}"), &doc.body)?;
                            next_id += 1;
                        }
                    }
                    commit(&worktree, "scriptorium: create tickets from areas").await?;
                }

                Ok(())
            })
            .await
    }

    async fn execute(&self, ticket: Ticket) -> Result<()> {
        let Some(worktree) = ticket.worktree_path() else {
            return Err(Error::InvalidInput(format!(
                "ticket {} is in-progress without a worktree",
                ticket.id
            )));
        };

        self.mcp_slot.clear();

        let config = AgentRunConfig {
            prompt: format!("Complete the following ticket:\n\n{}", ticket.body),
            working_dir: PathBuf::from(&worktree),
            model: self.config.models.coding.clone(),
            ticket_id: format!("{:04}", ticket.id),
            mcp_endpoint: Some(self.mcp_endpoint.clone()),
            no_output_timeout_ms: self.no_output_timeout_ms,
            hard_timeout_ms: self.hard_timeout_ms,
            ..Default::default()
        };

        let run_result = harness::run(&config).await;
        let summary = self.mcp_slot.consume();

        match run_result {
            Ok(_) if !summary.is_empty() => {
                let assignment = crate::assign::Assignment {
                    ticket_id: ticket.id,
                    slug: ticket.slug.clone(),
                    branch: crate::assign::Assignment::branch_for(ticket.id),
                    worktree: PathBuf::from(&worktree),
                };
                crate::assign::enqueue_merge_request(&self.plan, &assignment, &summary).await?;
            }
            _ => {
                self.reopen_without_submission(ticket.id).await?;
            }
        }
        Ok(())
    }

    /// §9's resolved open question: an agent run that returns without calling
    /// `submit_pr` reopens the ticket rather than leaving it wedged.
    async fn reopen_without_submission(&self, ticket_id: u32) -> Result<()> {
        self.plan
            .scoped(|worktree| async move {
                let tickets = ticket::load_all_tickets(&worktree)?;
                let Some(mut found) = tickets
                    .into_iter()
                    .find(|t| t.id == ticket_id && t.state == TicketState::InProgress)
                else {
                    return Ok(());
                };
                let old_relpath = found.relpath();
                found.strip_worktree();
                found.append_failure("NO-SUBMIT", "agent run ended without calling submit_pr");
                found.state = TicketState::Open;

                std::fs::remove_file(worktree.join(old_relpath))?;
                PlanStore::write_file(&worktree, &found.relpath(), &found.body)?;
                commit(&worktree, &format!("scriptorium: reopen ticket {ticket_id:04} (no submission)")).await?;
                Ok(())
            })
            .await
    }
}

async fn commit(worktree: &std::path::Path, message: &str) -> Result<()> {
    let subprocess = crate::subprocess::SubprocessManager::production();
    crate::git::run_git(&subprocess, worktree, &["add", "-A"]).await?;
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
    crate::git::run_git(&subprocess, worktree, &["commit", "-m", message]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::SubprocessManager;

    struct EmptyArchitect;
    #[async_trait]
    impl ArchitectGenerator for EmptyArchitect {
        async fn generate_areas(&self, _model: &str, _spec: &str) -> Result<Vec<AreaDoc>> {
            Ok(vec![])
        }
    }

    struct EmptyManager;
    #[async_trait]
    impl ManagerGenerator for EmptyManager {
        async fn generate_tickets(&self, _model: &str, _path: &str, _content: &str) -> Result<Vec<TicketDoc>> {
            Ok(vec![])
        }
    }

    async fn run(dir: &std::path::Path, args: &[&str]) {
        let subprocess = SubprocessManager::production();
        crate::git::run_git(&subprocess, dir, args).await.unwrap();
    }

    #[tokio::test]
    async fn tick_with_no_tickets_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-q"]).await;
        run(dir.path(), &["config", "user.email", "test@example.com"]).await;
        run(dir.path(), &["config", "user.name", "Test"]).await;
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        run(dir.path(), &["add", "-A"]).await;
        run(dir.path(), &["commit", "-q", "-m", "init"]).await;
        run(dir.path(), &["branch", "scriptorium/plan"]).await;

        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        plan.scoped(|path| async move {
            PlanStore::write_file(&path, "spec.md", "# spec\n")?;
            commit(&path, "seed spec").await
        })
        .await
        .unwrap();

        let orchestrator = Orchestrator::new(
            PlanStore::new(dir.path(), SubprocessManager::production()),
            SubprocessManager::production(),
            HealthCheck::new(vec![vec!["true".to_string()]]),
            ScriptoriumConfig::default(),
            SubmitPrSlot::new(),
            "http://127.0.0.1:0".to_string(),
            Arc::new(EmptyArchitect),
            Arc::new(EmptyManager),
        );

        orchestrator.run_for_ticks(1).await.unwrap();
        assert!(orchestrator.find_in_progress().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_for_ticks_stops_when_should_run_cleared() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-q"]).await;
        run(dir.path(), &["config", "user.email", "test@example.com"]).await;
        run(dir.path(), &["config", "user.name", "Test"]).await;
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();
        run(dir.path(), &["add", "-A"]).await;
        run(dir.path(), &["commit", "-q", "-m", "init"]).await;
        run(dir.path(), &["branch", "scriptorium/plan"]).await;
        let plan = PlanStore::new(dir.path(), SubprocessManager::production());
        plan.scoped(|path| async move {
            PlanStore::write_file(&path, "spec.md", "# spec\n")?;
            commit(&path, "seed spec").await
        })
        .await
        .unwrap();

        let orchestrator = Orchestrator::new(
            PlanStore::new(dir.path(), SubprocessManager::production()),
            SubprocessManager::production(),
            HealthCheck::new(vec![vec!["true".to_string()]]),
            ScriptoriumConfig::default(),
            SubmitPrSlot::new(),
            "http://127.0.0.1:0".to_string(),
            Arc::new(EmptyArchitect),
            Arc::new(EmptyManager),
        );
        orchestrator.should_run.store(false, Ordering::SeqCst);
        orchestrator.run_for_ticks(5).await.unwrap();
    }
}
