//! Merge preview, merge and discard commands.

use anyhow::Result;
use console::style;

use autobuild::errors::OrchestratorError;
use autobuild::models::MergeStrategy;
use autobuild::orchestrator::SpecOrchestrator;

pub async fn cmd_preview(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    target: &str,
) -> Result<()> {
    let preview = orchestrator.merge_preview(spec_id, target).await?;
    println!();
    if preview.mergeable {
        println!(
            "{} merges cleanly into {}",
            spec_id,
            style(target).bold()
        );
    } else {
        println!(
            "{} {} conflicting path(s) against {}",
            style("CONFLICT:").red(),
            preview.conflicting_paths.len(),
            target
        );
        for path in &preview.conflicting_paths {
            println!("  {} {}", style("!").red(), path);
        }
    }
    if !preview.changed_paths.is_empty() {
        println!("Changed paths:");
        for path in &preview.changed_paths {
            println!("  {}", path);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_merge(orchestrator: &SpecOrchestrator, spec_id: &str, target: &str) -> Result<()> {
    let merged = orchestrator
        .merge_worktree(spec_id, target, MergeStrategy::AbortOnConflict)
        .await;
    match merged {
        Ok(result) => {
            let kind = if result.fast_forward {
                "fast-forward"
            } else {
                "merge commit"
            };
            println!(
                "{} {} into {} ({} {})",
                style("Merged").green(),
                spec_id,
                target,
                kind,
                result.merge_commit
            );
            Ok(())
        }
        Err(OrchestratorError::MergeConflicts { paths }) => {
            println!(
                "{} merge aborted, {} conflicting path(s):",
                style("CONFLICT:").red(),
                paths.len()
            );
            for path in &paths {
                println!("  {}", path);
            }
            println!("Run a follow-up build to resolve, then merge again.");
            Err(OrchestratorError::MergeConflicts { paths }.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn cmd_discard(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    let spec = orchestrator.discard_worktree(spec_id).await?;
    println!("{} is now {}", spec.id, spec.status);
    Ok(())
}
