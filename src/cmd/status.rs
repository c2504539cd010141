//! Read-only commands: session status, event log and configuration.

use anyhow::Result;
use console::style;

use phaseflow::agents::WorkerKind;
use phaseflow::audit::EventType;
use phaseflow::config::Config;
use phaseflow::orchestrator::Workflow;
use phaseflow::phase::FlowsFile;
use phaseflow::session::PhaseStatus;

fn styled_status(status: PhaseStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        PhaseStatus::Passed => style(text).green(),
        PhaseStatus::Failed => style(text).red(),
        PhaseStatus::Escalated => style(text).red().bold(),
        PhaseStatus::WaitingForInput => style(text).yellow(),
        PhaseStatus::Running => style(text).blue(),
        PhaseStatus::Ready => style(text).cyan(),
        PhaseStatus::Blocked => style(text).dim(),
    }
}

pub fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let session = Workflow::new(config)?.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!();
    println!("Session:    {}", session.session_id);
    println!("Flow:       {}", session.flow_key);
    println!(
        "Started:    {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("Iterations: {}", session.total_iterations);
    println!();
    println!(
        "  {:<12} {:<18} {:<8} {:<8} Last failure",
        "Phase", "Status", "Retries", "Reroutes"
    );
    println!(
        "  {:<12} {:<18} {:<8} {:<8} ------------",
        "-----", "------", "-------", "--------"
    );

    for id in &session.phase_order {
        let Some(state) = session.phase(id) else {
            continue;
        };
        let marker = if *id == session.current_phase { ">" } else { " " };
        println!(
            "{} {:<12} {:<18} {:<8} {:<8} {}",
            marker,
            id,
            styled_status(state.status),
            format!("{}/{}", state.retries, state.max_retries),
            state.reroute_count,
            state
                .last_failure_category
                .map(|c| c.to_string())
                .unwrap_or_default()
        );
    }
    println!();
    Ok(())
}

pub fn cmd_events(config: &Config, event_type: Option<&str>, json: bool) -> Result<()> {
    let workflow = Workflow::new(config)?;
    let events = match event_type {
        Some(t) => {
            let event_type: EventType =
                serde_json::from_value(serde_json::Value::String(t.to_string()))
                    .map_err(|_| anyhow::anyhow!("Unknown event type '{}'", t))?;
            workflow.events_by_type(event_type)?
        }
        None => workflow.events()?,
    };

    if json {
        for event in &events {
            println!("{}", serde_json::to_string(event)?);
        }
        return Ok(());
    }

    if events.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }
    for event in &events {
        println!(
            "{}  {:<20} {}",
            style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            style(event.event_type.as_str()).bold(),
            event.data
        );
    }
    Ok(())
}

pub fn cmd_config(config: &Config) -> Result<()> {
    let settings = &config.settings;

    println!();
    println!("Project:        {}", config.project_dir.display());
    println!("Flows file:     {}", config.flows_file.display());
    println!("Max iterations: {}", settings.max_iterations());
    println!("File logging:   {}", settings.orchestrator.log_to_file);

    let mut gates: Vec<_> = settings.gates.keys().collect();
    gates.sort();
    println!(
        "Gates:          {}",
        if gates.is_empty() {
            "(none)".to_string()
        } else {
            gates
                .iter()
                .map(|g| g.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    let resolver = settings.agent_resolver(&config.project_dir);
    for kind in WorkerKind::ALL {
        let command = match resolver.command_for(kind) {
            Some((command, args)) if args.is_empty() => command.clone(),
            Some((command, args)) => format!("{} {}", command, args.join(" ")),
            None => "(prompt files only)".to_string(),
        };
        println!("Worker {:<8} {}", format!("{}:", kind), command);
    }

    let mut warnings = settings.validate();
    if config.flows_file.exists() {
        match FlowsFile::load(&config.flows_file) {
            Ok(flows) => {
                let keys: Vec<&str> = flows.flows.keys().map(String::as_str).collect();
                println!("Flows:          {}", keys.join(", "));
                warnings.extend(flows.validate());
            }
            Err(e) => warnings.push(format!("{:#}", e)),
        }
    } else {
        warnings.push(format!(
            "Flows file not found: {}",
            config.flows_file.display()
        ));
    }

    println!();
    if warnings.is_empty() {
        println!("{}", style("Configuration OK").green());
    } else {
        for warning in &warnings {
            println!("{} {}", style("warning:").yellow().bold(), warning);
        }
    }
    println!();
    Ok(())
}
