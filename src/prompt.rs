//! Worker instruction assembly.
//!
//! `assemble` is pure: it reads nothing from disk and never fails. Anything
//! the caller could not supply shows up as an inline `[WARNING: ...]` line.

use crate::gates::GateResult;
use crate::phase::PhaseDefinition;
use crate::session::Session;
use std::collections::HashMap;
use std::fmt::Write;

/// Output of an earlier phase, as found by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorOutput {
    pub phase_id: String,
    /// `None` when the phase has no recorded output
    pub content: Option<String>,
}

/// Everything a prompt is built from.
pub struct PromptInputs<'a> {
    pub phase: &'a PhaseDefinition,
    pub session: &'a Session,
    pub prior_outputs: &'a [PriorOutput],
    /// Gate key → stated purpose
    pub gate_catalog: &'a HashMap<String, String>,
    /// Failed results of the attempt that sent work to this phase
    pub feedback: &'a [GateResult],
    /// Phase whose gates produced `feedback`, when it is not this one
    pub feedback_from: Option<&'a str>,
}

pub fn assemble(inputs: &PromptInputs<'_>) -> String {
    let phase = inputs.phase;
    let session = inputs.session;
    let state = session.phase(&phase.id);
    let mut out = String::new();

    let _ = writeln!(out, "# Task: {}", phase.id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Flow: {}", session.flow_key);
    let _ = writeln!(out, "- Session: {}", session.session_id);
    let _ = writeln!(out, "- Prompt: {}", phase.prompt_key);
    let _ = writeln!(out, "- Iteration: {}", session.next_attempt());
    match state {
        Some(state) => {
            let _ = writeln!(
                out,
                "- Retries: {}/{} (reroutes: {})",
                state.retries, state.max_retries, state.reroute_count
            );
        }
        None => {
            let _ = writeln!(
                out,
                "[WARNING: phase '{}' has no state in this session]",
                phase.id
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Prior outputs");
    if inputs.prior_outputs.is_empty() {
        let _ = writeln!(out, "None; this is the first phase.");
    }
    for prior in inputs.prior_outputs {
        match &prior.content {
            Some(content) => {
                let _ = writeln!(out, "### {}", prior.phase_id);
                let _ = writeln!(out, "{}", content.trim_end());
            }
            None => {
                let _ = writeln!(
                    out,
                    "[WARNING: no output recorded for phase '{}']",
                    prior.phase_id
                );
            }
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Required gates");
    if phase.required_gates.is_empty() {
        let _ = writeln!(out, "None.");
    }
    for gate in &phase.required_gates {
        match inputs.gate_catalog.get(gate) {
            Some(purpose) => {
                let _ = writeln!(out, "- {}: {}", gate, purpose);
            }
            None => {
                let _ = writeln!(out, "- {}", gate);
                let _ = writeln!(out, "[WARNING: gate '{}' has no description]", gate);
            }
        }
    }
    let _ = writeln!(out);

    let failures: Vec<&GateResult> = inputs.feedback.iter().filter(|r| r.is_failed()).collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "## Previous attempt feedback");
        if let Some(source) = inputs.feedback_from.filter(|s| *s != phase.id) {
            let _ = writeln!(out, "Rerouted here after gates of phase '{}' failed:", source);
        }
        for result in failures {
            let category = result
                .category
                .map(|c| c.as_str())
                .unwrap_or("UNKNOWN");
            let _ = writeln!(out, "- {} [{}]: {}", result.gate_id, category, result.reason);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Constraints");
    let _ = writeln!(out, "{}", rule_or_none(&phase.constraint_rule));
    let _ = writeln!(out);
    let _ = writeln!(out, "## Iteration rule");
    let _ = writeln!(out, "{}", rule_or_none(&phase.iteration_rule));

    out
}

fn rule_or_none(rule: &str) -> &str {
    if rule.trim().is_empty() { "None." } else { rule.trim() }
}
