//! Spec registration and status commands.

use anyhow::Result;
use console::style;

use autobuild::models::{SpecOverview, SpecStatus};
use autobuild::orchestrator::SpecOrchestrator;

pub async fn cmd_register(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    title: Option<&str>,
) -> Result<()> {
    let spec = orchestrator
        .register_spec(spec_id, title.unwrap_or(spec_id))
        .await?;
    println!("Registered {} ({})", spec.id, spec.status);
    Ok(())
}

pub async fn cmd_list(orchestrator: &SpecOrchestrator) -> Result<()> {
    let specs = orchestrator.list_specs().await?;
    if specs.is_empty() {
        println!("No specs registered.");
        return Ok(());
    }

    println!();
    println!("{:<20} {:<16} Title", "Spec", "Status");
    println!("{:<20} {:<16} -----", "----", "------");
    for spec in specs {
        println!(
            "{:<20} {:<16} {}",
            spec.id,
            styled_status(spec.status),
            spec.title
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_worktrees(orchestrator: &SpecOrchestrator) -> Result<()> {
    let worktrees = orchestrator.list_worktrees().await?;
    if worktrees.is_empty() {
        println!("No live worktrees.");
        return Ok(());
    }

    println!();
    println!("{:<20} {:<30} Path", "Spec", "Branch");
    println!("{:<20} {:<30} ----", "----", "------");
    for wt in worktrees {
        println!("{:<20} {:<30} {}", wt.spec_id, wt.branch, wt.path);
    }
    println!();
    Ok(())
}

pub async fn cmd_status(orchestrator: &SpecOrchestrator, spec_id: Option<&str>) -> Result<()> {
    let overviews = match spec_id {
        Some(id) => vec![orchestrator.spec_status(id).await?],
        None => orchestrator.batch_status().await?,
    };
    if overviews.is_empty() {
        println!("No specs registered.");
        return Ok(());
    }
    for overview in overviews {
        print_overview(&overview);
    }
    Ok(())
}

fn print_overview(overview: &SpecOverview) {
    println!();
    println!(
        "{} {} [{}]",
        style(&overview.spec.id).bold(),
        overview.spec.title,
        styled_status(overview.spec.status)
    );
    match &overview.worktree {
        Some(wt) => println!("  worktree: {} ({})", wt.path, wt.branch),
        None => println!("  worktree: none"),
    }
    match &overview.last_build {
        Some(build) => {
            let detail = build
                .error
                .as_deref()
                .map(|e| format!(" - {}", e))
                .unwrap_or_default();
            println!("  build #{}: {}{}", build.id, build.status_str(), detail);
        }
        None => println!("  build: none"),
    }
    match &overview.last_qa {
        Some(report) => println!(
            "  qa: {} ({} finding(s), {} blocking)",
            report.verdict,
            report.findings.len(),
            report.blocking_findings().len()
        ),
        None => println!("  qa: not run"),
    }
    match &overview.last_review {
        Some(decision) => println!(
            "  review: {}{}",
            decision.verdict,
            decision
                .comment
                .as_deref()
                .map(|c| format!(" - {}", c))
                .unwrap_or_default()
        ),
        None => println!("  review: none"),
    }
}

fn styled_status(status: SpecStatus) -> String {
    let styled = match status {
        SpecStatus::Merged | SpecStatus::QaPassed | SpecStatus::Approved => {
            style(status.as_str()).green()
        }
        SpecStatus::QaFailed | SpecStatus::Rejected => style(status.as_str()).red(),
        SpecStatus::Building => style(status.as_str()).yellow(),
        SpecStatus::Discarded => style(status.as_str()).dim(),
        _ => style(status.as_str()),
    };
    styled.to_string()
}
