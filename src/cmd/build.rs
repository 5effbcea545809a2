//! Build and QA commands.

use std::time::Duration;

use anyhow::Result;
use console::style;

use autobuild::models::{Build, QaVerdict};
use autobuild::orchestrator::SpecOrchestrator;

pub async fn cmd_build(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    title: Option<&str>,
) -> Result<()> {
    let build = orchestrator
        .run_build(spec_id, title.unwrap_or(spec_id))
        .await?;
    println!("Build #{} started for {}", build.id, spec_id);
    wait_for_build(orchestrator, spec_id, build.id).await
}

pub async fn cmd_followup(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    instructions: &str,
) -> Result<()> {
    let build = orchestrator.run_followup(spec_id, instructions).await?;
    println!("Follow-up build #{} started for {}", build.id, spec_id);
    wait_for_build(orchestrator, spec_id, build.id).await
}

pub async fn cmd_cancel(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    let build = orchestrator.cancel_build(spec_id).await?;
    println!("Build #{}: {}", build.id, build.status_str());
    if build.forced {
        println!("{}", style("Process was killed after the grace period").yellow());
    }
    Ok(())
}

pub async fn cmd_qa(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    let report = orchestrator.run_qa(spec_id).await?;
    print_report(&report.verdict, &report.findings);
    Ok(())
}

pub async fn cmd_qa_status(orchestrator: &SpecOrchestrator, spec_id: &str) -> Result<()> {
    match orchestrator.qa_status(spec_id).await? {
        Some(report) => {
            println!("Latest QA run at {}", report.created_at.to_rfc3339());
            print_report(&report.verdict, &report.findings);
        }
        None => println!("No QA runs recorded for {}", spec_id),
    }
    Ok(())
}

/// Block until the spec's build reaches a terminal outcome, then report it.
async fn wait_for_build(
    orchestrator: &SpecOrchestrator,
    spec_id: &str,
    build_id: i64,
) -> Result<()> {
    let build = loop {
        let overview = orchestrator.spec_status(spec_id).await?;
        match overview.last_build {
            Some(b) if b.id == build_id && !b.is_running() => break b,
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    };
    print_outcome(&build);
    Ok(())
}

fn print_outcome(build: &Build) {
    match build.status_str() {
        "succeeded" => println!("{}", style("Build succeeded").green()),
        other => {
            println!("{}", style(format!("Build {}", other)).red());
            if let Some(error) = &build.error {
                println!("  {}", error);
            }
        }
    }
}

fn print_report(verdict: &QaVerdict, findings: &[autobuild::models::Finding]) {
    let label = match verdict {
        QaVerdict::Pass => style("QA passed").green(),
        QaVerdict::Fail => style("QA failed").red(),
        QaVerdict::Errored => style("QA tooling errored").yellow(),
    };
    println!("{}", label);
    for finding in findings {
        println!(
            "  [{}] {} {}",
            finding.severity,
            finding.location(),
            finding.message
        );
    }
}
