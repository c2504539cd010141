//! Commands that move the workflow.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use phaseflow::config::Config;
use phaseflow::orchestrator::{DoneOutcome, NextOutcome, Workflow};
use phaseflow::routing::RouteAction;

pub fn cmd_start(config: &Config, flow: &str, json: bool) -> Result<()> {
    config.ensure_directories()?;
    let workflow = Workflow::new(config)?;
    let session = workflow.start(flow)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!();
    println!(
        "{} session {} for flow '{}'",
        style("Started").green().bold(),
        session.session_id,
        flow
    );
    println!("Phases:        {}", session.phase_order.join(" → "));
    println!("Current phase: {}", style(&session.current_phase).cyan());
    println!();
    println!("Run 'phaseflow next' to begin.");
    println!();
    Ok(())
}

pub async fn cmd_next(config: &Config, json: bool) -> Result<()> {
    let outcome = Workflow::new(config)?.next().await?;
    print_outcome(&outcome, json)
}

pub async fn cmd_resume(config: &Config, json: bool) -> Result<()> {
    let outcome = Workflow::new(config)?.resume().await?;
    print_outcome(&outcome, json)
}

pub async fn cmd_done(
    config: &Config,
    phase: &str,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let text = match output {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read output file: {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?,
    };

    let outcome = Workflow::new(config)?.done(phase, &text).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_done(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &NextOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!();
    match outcome {
        NextOutcome::WaitingForInput {
            phase_id,
            attempt,
            prompt_file,
            message,
        } => {
            println!(
                "{} {} (attempt {})",
                style("Waiting for input:").yellow().bold(),
                phase_id,
                attempt
            );
            if let Some(message) = message {
                println!("Worker failed: {}", style(message).red());
            }
            println!("Prompt: {}", prompt_file.display());
            println!();
            println!(
                "Submit output with 'phaseflow done {} --output <file>'.",
                phase_id
            );
        }
        NextOutcome::Escalated { phase_id, category } => {
            println!("{} {}", style("Escalated:").red().bold(), phase_id);
            if let Some(category) = category {
                println!("Last failure: {}", category);
            }
            println!("Run 'phaseflow resume' after intervening.");
        }
        NextOutcome::Advanced { from, to } => {
            println!(
                "{} {} → {}",
                style("Advanced:").green().bold(),
                from,
                style(to).cyan()
            );
        }
        NextOutcome::FlowComplete { phase_id } => {
            println!(
                "{} last phase {} has passed",
                style("Flow complete:").green().bold(),
                phase_id
            );
        }
        NextOutcome::ReadyForRetry { phase_id } => {
            println!("{} {}", style("Ready for retry:").yellow(), phase_id);
        }
        NextOutcome::Evaluated(done) => print_done(done),
    }
    println!();
    Ok(())
}

fn print_done(outcome: &DoneOutcome) {
    println!();
    println!(
        "Gates for {} (attempt {}):",
        style(&outcome.phase_id).bold(),
        outcome.attempt
    );
    if outcome.results.is_empty() {
        println!("  (none required)");
    }
    for result in &outcome.results {
        if result.is_failed() {
            let category = result
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            println!(
                "  {} {} [{}] {}",
                style("✗").red(),
                result.gate_id,
                category,
                result.reason
            );
        } else {
            println!("  {} {}", style("✓").green(), result.gate_id);
        }
    }

    let decision = &outcome.decision;
    let action = match decision.action {
        RouteAction::Advance => style(decision.action.as_str()).green().bold(),
        RouteAction::Retry | RouteAction::Reroute => style(decision.action.as_str()).yellow().bold(),
        RouteAction::Escalate => style(decision.action.as_str()).red().bold(),
    };
    println!();
    match &decision.target_phase {
        Some(target) => println!("Decision: {} → {} ({})", action, target, decision.reason),
        None => println!("Decision: {} ({})", action, decision.reason),
    }
    println!(
        "Iterations: {}  Current phase: {}",
        decision.total_iterations, outcome.current_phase
    );
    if outcome.flow_complete {
        println!("{}", style("Flow complete.").green().bold());
    }
}
