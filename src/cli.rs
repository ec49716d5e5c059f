//! CLI surface (§4.8, §6): `scriptorium run|status|worktrees` plus global
//! `-v`/`-vv`/`-vvv` verbosity, grounded on the teacher's `clap`-derive
//! `Cli`/`execute_command` split.

use crate::app::AppConfig;
use crate::config::parse_endpoint;
use crate::git::PlanStore;
use crate::merge::HealthCheck;
use crate::subprocess::SubprocessManager;
use crate::ticket::{self, TicketState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scriptorium", about = "Agent-orchestration daemon")]
pub struct Cli {
    /// Repository root containing both `master` and `scriptorium/plan`.
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Raise log verbosity: -v, -vv, -vvv.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the tick loop until shutdown, or for a bounded number of ticks.
    Run {
        #[arg(long)]
        ticks: Option<u32>,
    },
    /// Prints area/ticket/queue counts from the plan branch.
    Status,
    /// Lists ticket worktrees and their state.
    Worktrees,
}

pub async fn execute_command(cli: Cli) -> anyhow::Result<()> {
    let app = AppConfig::discover(cli.repo.clone())?;
    let subprocess = SubprocessManager::production();
    let plan = PlanStore::new(&app.repo_path, subprocess.clone());

    match cli.command {
        Command::Run { ticks } => run(app, plan, subprocess, ticks).await,
        Command::Status => status(&plan).await,
        Command::Worktrees => worktrees(&plan).await,
    }
}

async fn run(
    app: AppConfig,
    plan: PlanStore,
    subprocess: SubprocessManager,
    ticks: Option<u32>,
) -> anyhow::Result<()> {
    let endpoint = parse_endpoint(&app.config.endpoints.local)?;
    let addr: std::net::SocketAddr = format!("{}:{}", endpoint.host, endpoint.port).parse()?;

    let slot = crate::mcp::SubmitPrSlot::new();
    let mcp_handle = crate::mcp::spawn(addr, slot.clone()).await?;
    println!("scriptorium: listening on {addr}");

    let orchestrator = crate::orchestrator::Orchestrator::new(
        plan,
        subprocess,
        HealthCheck::default(),
        app.config,
        slot,
        format!("http://{addr}"),
        std::sync::Arc::new(crate::generators::UnimplementedArchitect),
        std::sync::Arc::new(crate::generators::UnimplementedManager),
    );

    #[cfg(unix)]
    orchestrator.install_signal_handlers()?;

    match ticks {
        Some(n) => orchestrator.run_for_ticks(n).await?,
        None => orchestrator.run().await?,
    }

    mcp_handle.shutdown().await;
    Ok(())
}

async fn status(plan: &PlanStore) -> anyhow::Result<()> {
    let (areas, tickets, pending) = plan
        .scoped(|worktree| async move {
            let areas = PlanStore::list_markdown_files(&worktree, "areas")?;
            let tickets = ticket::load_all_tickets(&worktree)?;
            let pending = crate::queue::list_pending(&worktree)?;
            Ok((areas.len(), tickets, pending.len()))
        })
        .await?;

    let open = tickets.iter().filter(|t| t.state == TicketState::Open).count();
    let in_progress = tickets
        .iter()
        .filter(|t| t.state == TicketState::InProgress)
        .count();
    let done = tickets.iter().filter(|t| t.state == TicketState::Done).count();

    println!("areas: {areas}");
    println!("tickets: open={open} in-progress={in_progress} done={done}");
    println!("queue pending: {pending}");
    Ok(())
}

async fn worktrees(plan: &PlanStore) -> anyhow::Result<()> {
    let tickets = plan
        .scoped(|worktree| async move { ticket::load_all_tickets(&worktree) })
        .await?;

    for t in tickets.iter().filter(|t| t.state == TicketState::InProgress) {
        println!(
            "{:04} {} -> {}",
            t.id,
            t.slug,
            t.worktree_path().unwrap_or_default()
        );
    }
    Ok(())
}
