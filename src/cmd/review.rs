//! Review workflow commands.

use anyhow::Result;
use console::style;

use autobuild::models::ReviewVerdict;
use autobuild::orchestrator::SpecOrchestrator;

pub async fn cmd_request_review(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    let spec = orchestrator.request_review(spec_id).await?;
    println!("{} is now {}", spec.id, spec.status);
    Ok(())
}

pub async fn cmd_review(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    let review = orchestrator.review_spec(spec_id).await?;
    let summary = &review.summary;
    println!();
    println!(
        "{} file(s) changed, +{} -{}",
        summary.total_files(),
        summary.lines_added,
        summary.lines_removed
    );
    for path in &summary.files_added {
        println!("  {} {}", style("A").green(), path);
    }
    for path in &summary.files_modified {
        println!("  {} {}", style("M").yellow(), path);
    }
    for path in &summary.files_deleted {
        println!("  {} {}", style("D").red(), path);
    }
    println!();
    print!("{}", review.diff);
    Ok(())
}

pub async fn cmd_decide(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    approve: bool,
    comment: Option<&str>,
) -> Result<()> {
    let verdict = if approve {
        ReviewVerdict::Approved
    } else {
        ReviewVerdict::Rejected
    };
    let decision = orchestrator.record_review(spec_id, verdict, comment).await?;
    println!("Recorded {} for {}", decision.verdict, spec_id);
    Ok(())
}

pub async fn cmd_review_status(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    match orchestrator.review_status(spec_id).await? {
        Some(decision) => {
            println!(
                "{} at {}{}",
                decision.verdict,
                decision.created_at.to_rfc3339(),
                decision
                    .comment
                    .as_deref()
                    .map(|c| format!(": {}", c))
                    .unwrap_or_default()
            );
        }
        None => println!("No review decisions recorded for {}", spec_id),
    }
    Ok(())
}
