use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autobuild::build::AgentCli;
use autobuild::config::Config;
use autobuild::orchestrator::SpecOrchestrator;
use autobuild::store::{Store, StoreHandle};

mod cmd;

#[derive(Parser)]
#[command(name = "autobuild")]
#[command(version, about = "Autonomous build lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project repository to operate on. Defaults to the current directory.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a spec without starting a build
    Register {
        spec_id: String,
        /// Human-readable title (defaults to the spec id)
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Build a spec in an isolated worktree and wait for the result
    Build {
        spec_id: String,
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Run the agent again in the existing worktree with extra instructions
    Followup {
        spec_id: String,
        instructions: String,
    },
    /// Cancel a spec's running build
    Cancel { spec_id: String },
    /// Run QA validation against a spec's worktree
    Qa { spec_id: String },
    /// Show the latest QA report
    QaStatus { spec_id: String },
    /// Put a QA-passed spec up for human review
    RequestReview { spec_id: String },
    /// Show what a spec changed, for review
    Review { spec_id: String },
    /// Approve the spec under review
    Approve {
        spec_id: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Reject the spec under review
    Reject {
        spec_id: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Show the latest review decision
    ReviewStatus { spec_id: String },
    /// Preview merge conflicts without changing anything
    Preview {
        spec_id: String,
        #[arg(long, default_value = "main")]
        target: String,
    },
    /// Merge an approved spec into the target branch
    Merge {
        spec_id: String,
        #[arg(long, default_value = "main")]
        target: String,
    },
    /// Abandon a spec and tear down its worktree
    Discard { spec_id: String },
    /// List registered specs
    List,
    /// List live worktrees
    Worktrees,
    /// Show status for one spec, or all of them
    Status { spec_id: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "autobuild=debug" } else { "autobuild=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;
    config.ensure_directories()?;

    let store = StoreHandle::new(Store::open(&config.db_path)?);
    let launcher = Arc::new(AgentCli::new(config.agent_cmd.clone(), config.agent_flags()));
    let orchestrator = SpecOrchestrator::new(&config, store, launcher);

    let recovery = orchestrator.recover()?;
    if recovery.orphaned_builds > 0 || recovery.reset_specs > 0 {
        eprintln!(
            "Recovered from restart: {} orphaned build(s) closed, {} spec(s) reset",
            recovery.orphaned_builds, recovery.reset_specs
        );
    }

    match &cli.command {
        Commands::Register { spec_id, title } => {
            cmd::cmd_register(&orchestrator, spec_id, title.as_deref()).await?;
        }
        Commands::Build { spec_id, title } => {
            cmd::cmd_build(&orchestrator, spec_id, title.as_deref()).await?;
        }
        Commands::Followup {
            spec_id,
            instructions,
        } => {
            cmd::cmd_followup(&orchestrator, spec_id, instructions).await?;
        }
        Commands::Cancel { spec_id } => cmd::cmd_cancel(&orchestrator, spec_id).await?,
        Commands::Qa { spec_id } => cmd::cmd_qa(&orchestrator, spec_id).await?,
        Commands::QaStatus { spec_id } => cmd::cmd_qa_status(&orchestrator, spec_id).await?,
        Commands::RequestReview { spec_id } => {
            cmd::cmd_request_review(&orchestrator, spec_id).await?;
        }
        Commands::Review { spec_id } => cmd::cmd_review(&orchestrator, spec_id).await?,
        Commands::Approve { spec_id, comment } => {
            cmd::cmd_decide(&orchestrator, spec_id, true, comment.as_deref()).await?;
        }
        Commands::Reject { spec_id, comment } => {
            cmd::cmd_decide(&orchestrator, spec_id, false, comment.as_deref()).await?;
        }
        Commands::ReviewStatus { spec_id } => {
            cmd::cmd_review_status(&orchestrator, spec_id).await?;
        }
        Commands::Preview { spec_id, target } => {
            cmd::cmd_preview(&orchestrator, spec_id, target).await?;
        }
        Commands::Merge { spec_id, target } => {
            cmd::cmd_merge(&orchestrator, spec_id, target).await?;
        }
        Commands::Discard { spec_id } => cmd::cmd_discard(&orchestrator, spec_id).await?,
        Commands::List => cmd::cmd_list(&orchestrator).await?,
        Commands::Worktrees => cmd::cmd_worktrees(&orchestrator).await?,
        Commands::Status { spec_id } => {
            cmd::cmd_status(&orchestrator, spec_id.as_deref()).await?;
        }
    }

    Ok(())
}
