//! The workflow state machine.
//!
//! Every public operation is load → mutate → save against the session store.
//! Nothing is cached between calls, so any operation may follow a process
//! restart. `waiting_for_input` is the only point where the machine stops and
//! waits for an external `done` or `resume`.

use crate::agents::{AgentResolver, WorkerContext, WorkerKind, WorkerStatus};
use crate::audit::{Event, EventType};
use crate::config::Config;
use crate::errors::{Result, WorkflowError};
use crate::gates::{DefectCategory, GateContext, GateExecutor, GateRegistry, GateResult};
use crate::phase::{FlowsFile, PhaseDefinition, definitions_hash};
use crate::prompt::{self, PriorOutput, PromptInputs};
use crate::routing::{RouteAction, RoutingDecision, RoutingPolicy};
use crate::session::{DefinitionsRef, PhaseStatus, Session, SessionStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod artifacts;
pub use artifacts::ArtifactStore;

/// Result of one `next()` or `resume()` call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NextOutcome {
    /// The phase is parked until `done` or `resume`.
    WaitingForInput {
        phase_id: String,
        attempt: u32,
        prompt_file: PathBuf,
        /// Set when the worker itself failed
        message: Option<String>,
    },
    Escalated {
        phase_id: String,
        category: Option<DefectCategory>,
    },
    Advanced {
        from: String,
        to: String,
    },
    /// The last phase has passed.
    FlowComplete { phase_id: String },
    /// A failed phase was put back to `ready`.
    ReadyForRetry { phase_id: String },
    /// The worker completed and its output was evaluated.
    Evaluated(DoneOutcome),
}

/// Result of evaluating one phase attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DoneOutcome {
    pub phase_id: String,
    pub attempt: u32,
    /// Status of `phase_id` after the decision
    pub status: PhaseStatus,
    pub decision: RoutingDecision,
    pub results: Vec<GateResult>,
    pub current_phase: String,
    pub flow_complete: bool,
}

pub struct Workflow {
    project_dir: PathBuf,
    flows_file: PathBuf,
    gates_dir: PathBuf,
    store: SessionStore,
    executor: GateExecutor,
    policy: RoutingPolicy,
    resolver: AgentResolver,
    artifacts: ArtifactStore,
}

impl Workflow {
    /// Build a workflow from runtime configuration: command gates and worker
    /// commands come from `phaseflow.toml`.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let registry = GateRegistry::from_settings(&config.settings.gates, &config.project_dir);
        Ok(Self {
            project_dir: config.project_dir.clone(),
            flows_file: config.flows_file.clone(),
            gates_dir: config.gates_dir.clone(),
            store: SessionStore::new(&config.state_dir),
            executor: GateExecutor::new(registry, &config.gates_dir),
            policy: config.settings.routing_policy()?,
            resolver: config.settings.agent_resolver(&config.project_dir),
            artifacts: ArtifactStore::new(&config.artifacts_dir),
        })
    }

    pub fn with_gates(mut self, registry: GateRegistry) -> Self {
        self.executor = GateExecutor::new(registry, &self.gates_dir);
        self
    }

    pub fn with_resolver(mut self, resolver: AgentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Create a session for `flow_key` from the flow definition file.
    pub fn start(&self, flow_key: &str) -> Result<Session> {
        let flows = FlowsFile::load(&self.flows_file)?;
        let phases = flows
            .phases(flow_key)
            .ok_or_else(|| WorkflowError::UnknownFlow {
                flow_key: flow_key.to_string(),
            })?;
        if phases.is_empty() {
            return Err(WorkflowError::EmptyFlow {
                flow_key: flow_key.to_string(),
            });
        }
        for warning in flows.validate() {
            warn!(%warning, "flow definition warning");
        }

        let definitions = DefinitionsRef {
            path: self.flows_file.clone(),
            hash: Some(definitions_hash(&self.flows_file)?),
        };
        let session = self.store.init(flow_key, phases, definitions)?;

        info!(
            session_id = %session.session_id,
            flow = flow_key,
            phases = session.phase_order.len(),
            "session started"
        );
        Ok(session)
    }

    /// Drive the current phase one step.
    ///
    /// Suspended phases return unchanged, so polling is idempotent. A
    /// `passed` or `failed` phase gets its pending transition applied. Any
    /// other phase is run: prompt assembled and persisted, worker invoked.
    pub async fn next(&self) -> Result<NextOutcome> {
        let mut session = self.store.load_required()?;
        let phase_id = session.current_phase.clone();
        let state = session
            .current_state()
            .cloned()
            .ok_or_else(|| unknown_phase(&session.flow_key, &phase_id))?;

        match state.status {
            PhaseStatus::WaitingForInput => {
                let attempt = self.fresh_attempt(&session, &phase_id);
                Ok(NextOutcome::WaitingForInput {
                    prompt_file: self.artifacts.prompt_path(&phase_id, attempt),
                    phase_id,
                    attempt,
                    message: None,
                })
            }
            PhaseStatus::Escalated => Ok(NextOutcome::Escalated {
                phase_id,
                category: state.last_failure_category,
            }),
            PhaseStatus::Passed => match session.advance() {
                Some(to) => {
                    self.store.save(&mut session)?;
                    self.store.append_event(
                        EventType::PhaseAdvanced,
                        json!({ "from": phase_id, "to": to }),
                    )?;
                    info!(from = %phase_id, to = %to, "phase advanced");
                    Ok(NextOutcome::Advanced { from: phase_id, to })
                }
                None => Ok(NextOutcome::FlowComplete { phase_id }),
            },
            PhaseStatus::Failed => {
                session.set_status(&phase_id, PhaseStatus::Ready);
                self.store.save(&mut session)?;
                self.store.append_event(
                    EventType::StateTransition,
                    json!({
                        "phase": phase_id,
                        "from": PhaseStatus::Failed,
                        "to": PhaseStatus::Ready,
                        "action": RouteAction::Retry,
                        "retries": state.retries,
                    }),
                )?;
                Ok(NextOutcome::ReadyForRetry { phase_id })
            }
            PhaseStatus::Blocked | PhaseStatus::Ready | PhaseStatus::Running => {
                self.run_phase(session, &phase_id).await
            }
        }
    }

    async fn run_phase(&self, mut session: Session, phase_id: &str) -> Result<NextOutcome> {
        let definition = self.load_definition(&session, phase_id)?;
        let attempt = self.fresh_attempt(&session, phase_id);

        let prompt = self.build_prompt(&session, &definition)?;
        let prompt_file = self.artifacts.write_prompt(phase_id, attempt, &prompt)?;
        let worker = self.resolver.resolve(&definition.worker).await;

        session.set_status(phase_id, PhaseStatus::Running);
        self.store.save(&mut session)?;
        self.store.append_event(
            EventType::PhaseStarted,
            json!({
                "phase": phase_id,
                "attempt": attempt,
                "selector": definition.worker,
                "worker": worker.kind(),
                "prompt_file": prompt_file,
            }),
        )?;
        info!(phase = phase_id, attempt, worker = %worker.kind(), "phase started");

        let ctx = WorkerContext {
            session_id: session.session_id,
            phase_id: phase_id.to_string(),
            attempt,
        };
        match worker.execute(&prompt, &ctx).await {
            WorkerStatus::Completed { output } => {
                Ok(NextOutcome::Evaluated(self.done(phase_id, &output).await?))
            }
            WorkerStatus::ManualRequired => {
                self.suspend(session, phase_id, attempt, prompt_file, worker.kind(), None)
            }
            WorkerStatus::Failed { message } => {
                warn!(phase = phase_id, attempt, error = %message, "worker failed");
                self.store.append_event(
                    EventType::WorkerFailed,
                    json!({
                        "phase": phase_id,
                        "attempt": attempt,
                        "worker": worker.kind(),
                        "message": message,
                    }),
                )?;
                self.suspend(
                    session,
                    phase_id,
                    attempt,
                    prompt_file,
                    worker.kind(),
                    Some(message),
                )
            }
        }
    }

    fn suspend(
        &self,
        mut session: Session,
        phase_id: &str,
        attempt: u32,
        prompt_file: PathBuf,
        worker: WorkerKind,
        message: Option<String>,
    ) -> Result<NextOutcome> {
        let reason = match message {
            Some(_) => "worker_failed",
            None => "manual_required",
        };
        session.set_status(phase_id, PhaseStatus::WaitingForInput);
        self.store.save(&mut session)?;
        self.store.append_event(
            EventType::WaitingForInput,
            json!({
                "phase": phase_id,
                "attempt": attempt,
                "worker": worker,
                "prompt_file": prompt_file,
                "reason": reason,
            }),
        )?;
        info!(phase = phase_id, prompt = %prompt_file.display(), "waiting for input");

        Ok(NextOutcome::WaitingForInput {
            phase_id: phase_id.to_string(),
            attempt,
            prompt_file,
            message,
        })
    }

    /// Record `output` for the current phase, run its gates and apply the
    /// routing decision.
    pub async fn done(&self, phase_id: &str, output: &str) -> Result<DoneOutcome> {
        let mut session = self.store.load_required()?;
        let state = session
            .phase(phase_id)
            .cloned()
            .ok_or_else(|| unknown_phase(&session.flow_key, phase_id))?;
        if session.current_phase != phase_id {
            return Err(WorkflowError::NotCurrentPhase {
                requested: phase_id.to_string(),
                current: session.current_phase.clone(),
            });
        }
        match state.status {
            PhaseStatus::Ready
            | PhaseStatus::Running
            | PhaseStatus::WaitingForInput
            | PhaseStatus::Failed => {}
            status => {
                return Err(WorkflowError::InvalidTransition {
                    operation: "complete",
                    phase: phase_id.to_string(),
                    status,
                });
            }
        }

        let definition = self.load_definition(&session, phase_id)?;
        let attempt = self.fresh_attempt(&session, phase_id);
        let output_file = self.artifacts.write_output(phase_id, attempt, output)?;

        let ctx = GateContext {
            session_id: session.session_id,
            phase_id: phase_id.to_string(),
            attempt,
            project_dir: self.project_dir.clone(),
            output_file: Some(output_file.clone()),
        };
        let results = self
            .executor
            .run_all(&definition.required_gates, &ctx)
            .await?;
        let failed: Vec<&str> = results
            .iter()
            .filter(|r| r.is_failed())
            .map(|r| r.gate_id.as_str())
            .collect();
        self.store.append_event(
            EventType::GatesEvaluated,
            json!({
                "phase": phase_id,
                "attempt": attempt,
                "output_file": output_file,
                "batch_file": self.executor.batch_path(phase_id, attempt),
                "total": results.len(),
                "failed": failed,
            }),
        )?;

        let decision = self.policy.decide(
            phase_id,
            &state,
            &results,
            &session.phase_order,
            session.total_iterations,
        );
        session.apply_decision(phase_id, &decision);

        let status = session
            .phase(phase_id)
            .map(|s| s.status)
            .unwrap_or(state.status);
        let flow_complete =
            decision.action == RouteAction::Advance && session.current_phase == phase_id;
        self.store.save(&mut session)?;

        let after = session.phase(phase_id);
        self.store.append_event(
            EventType::StateTransition,
            json!({
                "phase": phase_id,
                "attempt": attempt,
                "from": state.status,
                "to": status,
                "action": decision.action,
                "target_phase": decision.target_phase,
                "reason": decision.reason,
                "category": decision.category,
                "categories": decision.categories,
                "failed_gates": decision.failed_gates,
                "total_iterations": decision.total_iterations,
                "current_phase": session.current_phase,
                "retries": after.map(|s| s.retries),
                "reroute_count": decision
                    .target_phase
                    .as_deref()
                    .and_then(|t| session.phase(t))
                    .map(|s| s.reroute_count),
            }),
        )?;

        match decision.action {
            RouteAction::Advance if flow_complete => {
                self.store.append_event(
                    EventType::FlowCompleted,
                    json!({
                        "phase": phase_id,
                        "total_iterations": session.total_iterations,
                    }),
                )?;
                info!(phase = phase_id, iterations = session.total_iterations, "flow complete");
            }
            RouteAction::Advance => {
                self.store.append_event(
                    EventType::PhaseAdvanced,
                    json!({ "from": phase_id, "to": session.current_phase }),
                )?;
                info!(from = phase_id, to = %session.current_phase, "phase advanced");
            }
            RouteAction::Retry => {
                info!(phase = phase_id, reason = %decision.reason, "phase will retry");
            }
            RouteAction::Reroute => {
                info!(
                    from = phase_id,
                    to = %session.current_phase,
                    category = ?decision.category,
                    "phase rerouted"
                );
            }
            RouteAction::Escalate => {
                warn!(phase = phase_id, reason = %decision.reason, "phase escalated");
            }
        }

        Ok(DoneOutcome {
            phase_id: phase_id.to_string(),
            attempt,
            status,
            decision,
            results,
            current_phase: session.current_phase.clone(),
            flow_complete,
        })
    }

    /// Release a suspended phase back to `ready` and run it.
    pub async fn resume(&self) -> Result<NextOutcome> {
        let mut session = self.store.load_required()?;
        let phase_id = session.current_phase.clone();
        let status = session
            .current_state()
            .map(|s| s.status)
            .ok_or_else(|| unknown_phase(&session.flow_key, &phase_id))?;
        if !status.is_suspended() {
            return Err(WorkflowError::InvalidTransition {
                operation: "resume",
                phase: phase_id,
                status,
            });
        }

        session.set_status(&phase_id, PhaseStatus::Ready);
        self.store.save(&mut session)?;
        self.store.append_event(
            EventType::PhaseResumed,
            json!({ "phase": phase_id, "from": status }),
        )?;
        info!(phase = %phase_id, from = %status, "phase resumed");

        self.next().await
    }

    pub fn status(&self) -> Result<Session> {
        self.store.load_required()
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        Ok(self.store.events()?)
    }

    pub fn events_by_type(&self, event_type: EventType) -> Result<Vec<Event>> {
        Ok(self.store.events_by_type(event_type)?)
    }

    /// The session's next attempt number, skipped past any attempt that
    /// already has an output or gate batch on disk. An evaluation that
    /// failed after writing those leaves them untouched, and the rerun is
    /// recorded under the following number.
    fn fresh_attempt(&self, session: &Session, phase_id: &str) -> u32 {
        let mut attempt = session.next_attempt();
        while self.artifacts.output_path(phase_id, attempt).exists()
            || self.executor.batch_path(phase_id, attempt).exists()
        {
            attempt += 1;
        }
        attempt
    }

    /// Current definition of `phase_id` from the session's flow file.
    fn load_definition(&self, session: &Session, phase_id: &str) -> Result<PhaseDefinition> {
        let path = &session.definitions.path;
        let flows = FlowsFile::load(path)?;
        if let Some(expected) = &session.definitions.hash {
            let actual = definitions_hash(path)?;
            if &actual != expected {
                warn!(
                    path = %path.display(),
                    "flow definitions changed since the session started"
                );
            }
        }
        if flows.phases(&session.flow_key).is_none() {
            return Err(WorkflowError::UnknownFlow {
                flow_key: session.flow_key.clone(),
            });
        }
        flows
            .get_phase(&session.flow_key, phase_id)
            .cloned()
            .ok_or_else(|| unknown_phase(&session.flow_key, phase_id))
    }

    fn build_prompt(&self, session: &Session, definition: &PhaseDefinition) -> Result<String> {
        let mut prior_outputs = Vec::new();
        for id in session
            .phase_order
            .iter()
            .take_while(|id| **id != definition.id)
        {
            let content = self.artifacts.latest_output(id)?.map(|(_, c)| c);
            prior_outputs.push(PriorOutput {
                phase_id: id.clone(),
                content,
            });
        }

        let gate_catalog: HashMap<String, String> = definition
            .required_gates
            .iter()
            .filter_map(|key| {
                self.executor
                    .registry()
                    .describe(key)
                    .map(|d| (key.clone(), d))
            })
            .collect();

        let (feedback, feedback_from) = self.feedback_for(&definition.id)?;

        Ok(prompt::assemble(&PromptInputs {
            phase: definition,
            session,
            prior_outputs: &prior_outputs,
            gate_catalog: &gate_catalog,
            feedback: &feedback,
            feedback_from: feedback_from.as_deref(),
        }))
    }

    /// Gate results that sent work to `phase_id`: its own latest batch, or
    /// the source phase's batch when a reroute into this phase is newer.
    fn feedback_for(&self, phase_id: &str) -> Result<(Vec<GateResult>, Option<String>)> {
        let own = self.executor.latest_batch(phase_id)?;
        let own_attempt = own.as_ref().map_or(0, |(attempt, _)| *attempt);

        let reroute = self
            .store
            .events_by_type(EventType::StateTransition)?
            .into_iter()
            .rev()
            .find_map(|event| {
                let data = &event.data;
                let rerouted_here = data["action"].as_str() == Some(RouteAction::Reroute.as_str())
                    && data["target_phase"].as_str() == Some(phase_id);
                if !rerouted_here {
                    return None;
                }
                let source = data["phase"].as_str()?.to_string();
                let attempt = u32::try_from(data["attempt"].as_u64()?).ok()?;
                Some((source, attempt))
            });

        if let Some((source, attempt)) = reroute
            && attempt > own_attempt
            && let Some(results) = self.executor.load_batch(&source, attempt)?
        {
            return Ok((results, Some(source)));
        }
        Ok((own.map(|(_, results)| results).unwrap_or_default(), None))
    }
}

fn unknown_phase(flow_key: &str, phase_id: &str) -> WorkflowError {
    WorkflowError::UnknownPhase {
        flow_key: flow_key.to_string(),
        phase: phase_id.to_string(),
    }
}
