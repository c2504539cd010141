//! Workflow session aggregate.
//!
//! A `Session` is one stateful run of a flow. All liveness counters
//! (`total_iterations`, per-phase `retries` and `reroute_count`) live here and
//! change only through [`Session::apply_decision`].

use crate::gates::DefectCategory;
use crate::phase::PhaseDefinition;
use crate::routing::{RouteAction, RoutingDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub mod store;
pub use store::SessionStore;

/// Lifecycle status of one phase within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Blocked,
    Ready,
    Running,
    WaitingForInput,
    Passed,
    Failed,
    Escalated,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::Ready => "ready",
            PhaseStatus::Running => "running",
            PhaseStatus::WaitingForInput => "waiting_for_input",
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Escalated => "escalated",
        }
    }

    /// Only an explicit resume leaves these states.
    pub fn is_suspended(&self) -> bool {
        matches!(self, PhaseStatus::WaitingForInput | PhaseStatus::Escalated)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    /// Same-phase retries since the phase was last entered via reroute
    pub retries: u32,
    pub max_retries: u32,
    /// Times this phase was re-entered via reroute
    pub reroute_count: u32,
    #[serde(default)]
    pub last_failure_category: Option<DefectCategory>,
}

impl PhaseState {
    fn new(status: PhaseStatus, max_retries: u32) -> Self {
        Self {
            status,
            retries: 0,
            max_retries,
            reroute_count: 0,
            last_failure_category: None,
        }
    }
}

/// Reference to the definition set a session was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionsRef {
    pub path: PathBuf,
    /// SHA-256 of the definition file at session creation
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub flow_key: String,
    pub definitions: DefinitionsRef,
    pub started_at: DateTime<Utc>,
    pub current_phase: String,
    pub total_iterations: u32,
    /// Optimistic concurrency stamp, bumped on every save
    #[serde(default)]
    pub version: u64,
    /// Canonical phase order captured at creation
    pub phase_order: Vec<String>,
    pub phases: BTreeMap<String, PhaseState>,
}

impl Session {
    /// Create a session with the first phase `ready` and the rest `blocked`.
    /// Callers reject empty phase lists before getting here.
    pub fn new(flow_key: &str, phases: &[PhaseDefinition], definitions: DefinitionsRef) -> Self {
        let phase_order: Vec<String> = phases.iter().map(|p| p.id.clone()).collect();
        let states = phases
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let status = if i == 0 {
                    PhaseStatus::Ready
                } else {
                    PhaseStatus::Blocked
                };
                (p.id.clone(), PhaseState::new(status, p.max_retries))
            })
            .collect();

        Self {
            session_id: Uuid::new_v4(),
            flow_key: flow_key.to_string(),
            definitions,
            started_at: Utc::now(),
            current_phase: phase_order.first().cloned().unwrap_or_default(),
            total_iterations: 0,
            version: 0,
            phase_order,
            phases: states,
        }
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseState> {
        self.phases.get(phase_id)
    }

    pub fn current_state(&self) -> Option<&PhaseState> {
        self.phases.get(&self.current_phase)
    }

    /// Set a phase's status. Unknown ids are ignored; the orchestrator
    /// validates ids before mutating.
    pub fn set_status(&mut self, phase_id: &str, status: PhaseStatus) {
        if let Some(state) = self.phases.get_mut(phase_id) {
            state.status = status;
        }
    }

    /// The phase after `phase_id` in canonical order.
    pub fn next_phase_id(&self, phase_id: &str) -> Option<&str> {
        let idx = self.phase_order.iter().position(|p| p == phase_id)?;
        self.phase_order.get(idx + 1).map(String::as_str)
    }

    /// Attempt number the next gate evaluation will carry.
    pub fn next_attempt(&self) -> u32 {
        self.total_iterations + 1
    }

    /// Move `current_phase` to the phase after it, marking that phase ready.
    /// Returns the new current phase, or `None` at the last phase.
    pub fn advance(&mut self) -> Option<String> {
        let next = self.next_phase_id(&self.current_phase)?.to_string();
        self.set_status(&next, PhaseStatus::Ready);
        self.current_phase = next.clone();
        Some(next)
    }

    /// Apply a routing decision taken for `phase_id`.
    ///
    /// This is the only place liveness counters change.
    pub fn apply_decision(&mut self, phase_id: &str, decision: &RoutingDecision) {
        self.total_iterations = decision.total_iterations;

        match decision.action {
            RouteAction::Advance => {
                if let Some(state) = self.phases.get_mut(phase_id) {
                    state.status = PhaseStatus::Passed;
                    state.last_failure_category = None;
                }
                if self.current_phase == phase_id {
                    self.advance();
                }
            }
            RouteAction::Retry => {
                if let Some(state) = self.phases.get_mut(phase_id) {
                    state.status = PhaseStatus::Failed;
                    state.retries += 1;
                    state.last_failure_category = decision.category;
                }
            }
            RouteAction::Reroute => {
                if let Some(state) = self.phases.get_mut(phase_id) {
                    state.status = PhaseStatus::Failed;
                    state.last_failure_category = decision.category;
                }
                if let Some(target) = decision.target_phase.as_deref()
                    && let Some(state) = self.phases.get_mut(target)
                {
                    state.status = PhaseStatus::Ready;
                    state.retries = 0;
                    state.reroute_count += 1;
                    self.current_phase = target.to_string();
                }
            }
            RouteAction::Escalate => {
                if let Some(state) = self.phases.get_mut(phase_id) {
                    state.status = PhaseStatus::Escalated;
                    if decision.category.is_some() {
                        state.last_failure_category = decision.category;
                    }
                }
            }
        }
    }
}
