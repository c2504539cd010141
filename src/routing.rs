//! Routing policy: decides what happens after a gate batch.
//!
//! `RoutingPolicy::decide` is a pure function of the batch and the counters.
//! It never mutates the session; the caller applies the returned decision via
//! `Session::apply_decision`.

use crate::gates::{DefectCategory, GateResult};
use crate::session::PhaseState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Global cap on routing decisions per session.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Advance,
    Retry,
    Reroute,
    Escalate,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::Advance => "advance",
            RouteAction::Retry => "retry",
            RouteAction::Reroute => "reroute",
            RouteAction::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    AllGatesPassed,
    MaxIterationsExceeded,
    NoValidRoute,
    MaxRetriesExceeded,
    RetryWithinBudget,
    CategoryRoute,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::AllGatesPassed => "all_gates_passed",
            RouteReason::MaxIterationsExceeded => "max_iterations_exceeded",
            RouteReason::NoValidRoute => "no_valid_route",
            RouteReason::MaxRetriesExceeded => "max_retries_exceeded",
            RouteReason::RetryWithinBudget => "retry_within_budget",
            RouteReason::CategoryRoute => "category_route",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub action: RouteAction,
    /// Phase to enter next for retry/reroute
    pub target_phase: Option<String>,
    pub reason: RouteReason,
    /// Category that selected the target (first failed category otherwise)
    pub category: Option<DefectCategory>,
    pub failed_gates: Vec<String>,
    pub categories: Vec<DefectCategory>,
    /// Session iteration count after this decision
    pub total_iterations: u32,
}

/// Category → phase id. `None` means the category has no route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTable {
    routes: HashMap<DefectCategory, Option<String>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        let routes = [
            (DefectCategory::GoalDefect, Some("Phase0A")),
            (DefectCategory::RequirementDefect, Some("Phase0B")),
            (DefectCategory::StructureDefect, Some("Phase1")),
            (DefectCategory::ContentDefect, Some("Phase2")),
            (DefectCategory::EvidenceDefect, Some("Phase2")),
            (DefectCategory::StyleDefect, Some("Phase3")),
            (DefectCategory::Unknown, None),
        ]
        .into_iter()
        .map(|(c, p)| (c, p.map(str::to_string)))
        .collect();
        Self { routes }
    }
}

impl RouteTable {
    /// Default table with `[routing.categories]` entries applied on top.
    /// An empty value or `"none"` removes the route.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self> {
        let mut table = Self::default();
        for (category, phase) in overrides {
            let category: DefectCategory = category.parse()?;
            let phase = phase.trim();
            let target = if phase.is_empty() || phase.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(phase.to_string())
            };
            table.routes.insert(category, target);
        }
        Ok(table)
    }

    pub fn target(&self, category: DefectCategory) -> Option<&str> {
        self.routes.get(&category).and_then(|p| p.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub max_iterations: u32,
    pub table: RouteTable,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            table: RouteTable::default(),
        }
    }
}

impl RoutingPolicy {
    pub fn new(max_iterations: u32, table: RouteTable) -> Self {
        Self {
            max_iterations,
            table,
        }
    }

    /// Decide the transition for `phase_id` given its latest gate batch.
    ///
    /// `phase_order` is the flow's canonical order; when several failed
    /// categories route to different phases, the earliest one wins.
    pub fn decide(
        &self,
        phase_id: &str,
        state: &PhaseState,
        results: &[GateResult],
        phase_order: &[String],
        total_iterations: u32,
    ) -> RoutingDecision {
        let iterations = total_iterations + 1;

        let failed: Vec<&GateResult> = results.iter().filter(|r| r.is_failed()).collect();
        let failed_gates: Vec<String> = failed.iter().map(|r| r.gate_id.clone()).collect();
        let mut categories: Vec<DefectCategory> = Vec::new();
        for result in &failed {
            let category = result.category.unwrap_or(DefectCategory::Unknown);
            if !categories.contains(&category) {
                categories.push(category);
            }
        }

        let decision = |action, target_phase: Option<&str>, reason, category| RoutingDecision {
            action,
            target_phase: target_phase.map(str::to_string),
            reason,
            category,
            failed_gates: failed_gates.clone(),
            categories: categories.clone(),
            total_iterations: iterations,
        };

        if iterations > self.max_iterations {
            return decision(
                RouteAction::Escalate,
                None,
                RouteReason::MaxIterationsExceeded,
                categories.first().copied(),
            );
        }

        if failed.is_empty() {
            return decision(RouteAction::Advance, None, RouteReason::AllGatesPassed, None);
        }

        // (position in canonical order, target id, category that chose it)
        let best = categories
            .iter()
            .filter_map(|&category| {
                let target = self.table.target(category)?;
                let position = phase_order.iter().position(|p| p == target)?;
                Some((position, target, category))
            })
            .min_by_key(|(position, _, _)| *position);

        let Some((_, target, category)) = best else {
            return decision(
                RouteAction::Escalate,
                None,
                RouteReason::NoValidRoute,
                categories.first().copied(),
            );
        };

        if target == phase_id {
            if state.retries < state.max_retries {
                decision(
                    RouteAction::Retry,
                    Some(target),
                    RouteReason::RetryWithinBudget,
                    Some(category),
                )
            } else {
                decision(
                    RouteAction::Escalate,
                    None,
                    RouteReason::MaxRetriesExceeded,
                    Some(category),
                )
            }
        } else {
            decision(
                RouteAction::Reroute,
                Some(target),
                RouteReason::CategoryRoute,
                Some(category),
            )
        }
    }
}
