//! Integration tests for phaseflow
//!
//! Library scenarios drive `Workflow` with scripted gates and workers; the
//! CLI tests run the `phaseflow` binary against a temporary project.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use phaseflow::agents::{AgentResolver, Worker, WorkerContext, WorkerKind, WorkerStatus};
use phaseflow::audit::EventType;
use phaseflow::config::Config;
use phaseflow::gates::{DefectCategory, GateCheck, GateContext, GateRegistry, GateResult};
use phaseflow::orchestrator::{NextOutcome, Workflow};
use phaseflow::phase::{FlowsFile, PhaseDefinition};
use phaseflow::routing::{RouteAction, RouteReason, RouteTable, RoutingPolicy};
use phaseflow::session::PhaseStatus;
use predicates::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Helper to create a phaseflow Command
fn phaseflow() -> Command {
    cargo_bin_cmd!("phaseflow")
}

/// Write `.phaseflow/flows.json` with a single flow named `memo`.
fn write_flows(dir: &TempDir, phases: Vec<PhaseDefinition>) {
    let state = dir.path().join(".phaseflow");
    fs::create_dir_all(&state).unwrap();
    FlowsFile {
        flows: BTreeMap::from([("memo".to_string(), phases)]),
    }
    .save(&state.join("flows.json"))
    .unwrap();
}

fn gates(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

/// The five-phase authoring flow, every phase manual.
fn authoring_flow(max_retries: u32) -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new("Phase0A", "manual", gates(&["goal"]), max_retries),
        PhaseDefinition::new("Phase0B", "manual", gates(&["requirements"]), max_retries),
        PhaseDefinition::new("Phase1", "manual", gates(&["structure", "goal_fit"]), max_retries),
        PhaseDefinition::new("Phase2", "manual", gates(&["content"]), max_retries),
        PhaseDefinition::new("Phase3", "manual", gates(&["style"]), max_retries),
    ]
}

/// Gate returning queued verdicts in order, then passing.
struct Scripted(Mutex<Vec<GateResult>>);

impl Scripted {
    fn new(verdicts: Vec<GateResult>) -> Self {
        Self(Mutex::new(verdicts))
    }
}

#[async_trait]
impl GateCheck for Scripted {
    fn description(&self) -> Option<&str> {
        Some("scripted verdicts")
    }

    async fn check(&self, gate_id: &str, _ctx: &GateContext) -> anyhow::Result<GateResult> {
        let mut queue = self.0.lock().unwrap();
        if queue.is_empty() {
            Ok(GateResult::passed(gate_id, "ok"))
        } else {
            Ok(queue.remove(0))
        }
    }
}

/// Gate that always fails with one category.
struct AlwaysFails(DefectCategory);

#[async_trait]
impl GateCheck for AlwaysFails {
    async fn check(&self, gate_id: &str, _ctx: &GateContext) -> anyhow::Result<GateResult> {
        Ok(GateResult::failed(gate_id, self.0, "still wrong"))
    }
}

struct Crashing;

#[async_trait]
impl Worker for Crashing {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Codex
    }
    async fn is_available(&self) -> bool {
        true
    }
    async fn execute(&self, _prompt: &str, _ctx: &WorkerContext) -> WorkerStatus {
        WorkerStatus::Failed {
            message: "rate limited".to_string(),
        }
    }
}

fn workflow(dir: &TempDir, registry: GateRegistry) -> Workflow {
    let config = Config::new(dir.path().to_path_buf(), None).unwrap();
    Workflow::new(&config).unwrap().with_gates(registry)
}

// =============================================================================
// Workflow scenarios
// =============================================================================

mod workflow_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_goal_defect_reroutes_phase1_to_phase0a() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));

        let mut registry = GateRegistry::new();
        registry.register(
            "goal_fit",
            Scripted::new(vec![GateResult::failed(
                "goal_fit",
                DefectCategory::GoalDefect,
                "memo no longer answers the brief",
            )]),
        );
        registry.register("goal", Scripted::new(vec![]));
        registry.register("requirements", Scripted::new(vec![]));
        registry.register("structure", Scripted::new(vec![]));
        let wf = workflow(&dir, registry);
        wf.start("memo").unwrap();

        assert_eq!(
            wf.done("Phase0A", "goal").await.unwrap().current_phase,
            "Phase0B"
        );
        assert_eq!(
            wf.done("Phase0B", "reqs").await.unwrap().current_phase,
            "Phase1"
        );

        let outcome = wf.done("Phase1", "outline").await.unwrap();
        assert_eq!(outcome.decision.action, RouteAction::Reroute);
        assert_eq!(outcome.decision.target_phase.as_deref(), Some("Phase0A"));
        assert_eq!(outcome.decision.reason, RouteReason::CategoryRoute);
        assert_eq!(outcome.decision.failed_gates, vec!["goal_fit".to_string()]);
        assert_eq!(outcome.status, PhaseStatus::Failed);

        let session = wf.status().unwrap();
        assert_eq!(session.current_phase, "Phase0A");
        assert_eq!(session.total_iterations, 3);
        let target = session.phase("Phase0A").unwrap();
        assert_eq!(target.status, PhaseStatus::Ready);
        assert_eq!(target.retries, 0);
        assert_eq!(target.reroute_count, 1);
        let source = session.phase("Phase1").unwrap();
        assert_eq!(source.status, PhaseStatus::Failed);
        assert_eq!(
            source.last_failure_category,
            Some(DefectCategory::GoalDefect)
        );

        let transitions = wf.events_by_type(EventType::StateTransition).unwrap();
        assert_eq!(transitions.len(), 3);
        let last = &transitions[2].data;
        assert_eq!(last["action"], "reroute");
        assert_eq!(last["target_phase"], "Phase0A");
        assert_eq!(last["category"], "GOAL_DEFECT");
        assert_eq!(last["reason"], "category_route");

        // The redo prompt explains which downstream gate sent the work back.
        match wf.next().await.unwrap() {
            NextOutcome::WaitingForInput { prompt_file, .. } => {
                let prompt = std::fs::read_to_string(prompt_file).unwrap();
                assert!(prompt.contains("Rerouted here after gates of phase 'Phase1' failed:"));
                assert!(prompt.contains(
                    "- goal_fit [GOAL_DEFECT]: memo no longer answers the brief"
                ));
            }
            other => panic!("Expected WaitingForInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_escalates_after_max_retries() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![PhaseDefinition::new("Phase2", "manual", gates(&["content"]), 3)],
        );
        let mut registry = GateRegistry::new();
        registry.register("content", AlwaysFails(DefectCategory::ContentDefect));
        let wf = workflow(&dir, registry);
        wf.start("memo").unwrap();

        for expected_retries in 1..=3 {
            let outcome = wf.done("Phase2", "draft").await.unwrap();
            assert_eq!(outcome.decision.action, RouteAction::Retry);
            assert_eq!(
                wf.status().unwrap().phase("Phase2").unwrap().retries,
                expected_retries
            );
        }

        let outcome = wf.done("Phase2", "draft").await.unwrap();
        assert_eq!(outcome.decision.action, RouteAction::Escalate);
        assert_eq!(outcome.decision.reason, RouteReason::MaxRetriesExceeded);
        assert_eq!(outcome.status, PhaseStatus::Escalated);

        // Escalated phases stay put until resumed.
        match wf.next().await.unwrap() {
            NextOutcome::Escalated { phase_id, category } => {
                assert_eq!(phase_id, "Phase2");
                assert_eq!(category, Some(DefectCategory::ContentDefect));
            }
            other => panic!("Expected Escalated, got {other:?}"),
        }
        assert!(wf.done("Phase2", "again").await.is_err());
        assert_eq!(wf.status().unwrap().phase("Phase2").unwrap().retries, 3);
    }

    #[tokio::test]
    async fn test_advance_and_last_phase_noop() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![
                PhaseDefinition::new("Phase2", "manual", vec![], 3),
                PhaseDefinition::new("Phase3", "manual", vec![], 3),
            ],
        );
        let wf = workflow(&dir, GateRegistry::new());
        wf.start("memo").unwrap();

        let first = wf.done("Phase2", "body").await.unwrap();
        assert_eq!(first.decision.action, RouteAction::Advance);
        assert_eq!(first.current_phase, "Phase3");
        assert!(!first.flow_complete);

        let last = wf.done("Phase3", "polished").await.unwrap();
        assert!(last.flow_complete);
        assert_eq!(last.current_phase, "Phase3");

        let session = wf.status().unwrap();
        assert_eq!(session.current_phase, "Phase3");
        assert_eq!(session.phase("Phase3").unwrap().status, PhaseStatus::Passed);

        for _ in 0..2 {
            assert!(matches!(
                wf.next().await.unwrap(),
                NextOutcome::FlowComplete { .. }
            ));
        }
        let completed = wf
            .events()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::FlowCompleted)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_iteration_cap_terminates_reroute_loop() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![
                PhaseDefinition::new("Phase1", "manual", gates(&["structure"]), 10),
                PhaseDefinition::new("Phase2", "manual", gates(&["content"]), 10),
            ],
        );
        // Phase1 always passes, Phase2 always sends the flow back to Phase1.
        let mut registry = GateRegistry::new();
        registry.register("structure", Scripted::new(vec![]));
        registry.register("content", AlwaysFails(DefectCategory::StructureDefect));
        let wf = workflow(&dir, registry).with_policy(RoutingPolicy::new(5, RouteTable::default()));
        wf.start("memo").unwrap();

        let mut decisions = 0;
        loop {
            let current = wf.status().unwrap().current_phase;
            let outcome = wf.done(&current, "attempt").await.unwrap();
            decisions += 1;
            assert!(decisions <= 6, "cap did not terminate the loop");
            if outcome.decision.action == RouteAction::Escalate {
                assert_eq!(outcome.decision.reason, RouteReason::MaxIterationsExceeded);
                assert_eq!(outcome.decision.total_iterations, 6);
                break;
            }
        }
        assert_eq!(decisions, 6);
        assert_eq!(wf.status().unwrap().total_iterations, 6);
    }

    #[tokio::test]
    async fn test_unresolvable_gate_fails_unknown_and_escalates() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![PhaseDefinition::new(
                "Phase1",
                "manual",
                gates(&["registered", "missing"]),
                3,
            )],
        );
        let mut registry = GateRegistry::new();
        registry.register("registered", Scripted::new(vec![]));
        let wf = workflow(&dir, registry);
        wf.start("memo").unwrap();

        let outcome = wf.done("Phase1", "text").await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[1].gate_id, "missing");
        assert_eq!(outcome.results[1].category, Some(DefectCategory::Unknown));
        assert_eq!(outcome.decision.action, RouteAction::Escalate);
        assert_eq!(outcome.decision.reason, RouteReason::NoValidRoute);

        let batch = dir
            .path()
            .join(".phaseflow/gates/Phase1/attempt-1.json");
        let persisted: Vec<GateResult> =
            serde_json::from_str(&fs::read_to_string(batch).unwrap()).unwrap();
        assert_eq!(persisted, outcome.results);
    }

    #[tokio::test]
    async fn test_worker_failure_suspends_with_event() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![PhaseDefinition::new("Phase1", "codex-large", vec![], 3)],
        );
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        let mut resolver = AgentResolver::new(&config.project_dir);
        resolver.register(WorkerKind::Codex, Arc::new(Crashing));
        let wf = Workflow::new(&config).unwrap().with_resolver(resolver);
        wf.start("memo").unwrap();

        match wf.next().await.unwrap() {
            NextOutcome::WaitingForInput { message, .. } => {
                assert_eq!(message.as_deref(), Some("rate limited"));
            }
            other => panic!("Expected WaitingForInput, got {other:?}"),
        }
        let session = wf.status().unwrap();
        assert_eq!(
            session.phase("Phase1").unwrap().status,
            PhaseStatus::WaitingForInput
        );
        assert_eq!(session.total_iterations, 0);

        let events = wf.events().unwrap();
        let failed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::WorkerFailed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["message"], "rate limited");
    }

    #[tokio::test]
    async fn test_session_survives_restart() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        let mut registry = GateRegistry::new();
        registry.register("goal", Scripted::new(vec![]));

        {
            let wf = workflow(&dir, registry.clone());
            wf.start("memo").unwrap();
            assert!(matches!(
                wf.next().await.unwrap(),
                NextOutcome::WaitingForInput { .. }
            ));
        }

        let wf = workflow(&dir, registry);
        let outcome = wf.done("Phase0A", "goal statement").await.unwrap();
        assert_eq!(outcome.current_phase, "Phase0B");

        // Phase0B's prompt carries Phase0A's recorded output.
        match wf.next().await.unwrap() {
            NextOutcome::WaitingForInput { prompt_file, .. } => {
                let prompt = fs::read_to_string(prompt_file).unwrap();
                assert!(prompt.contains("goal statement"));
                assert!(prompt.contains("[WARNING: gate 'requirements' has no description]"));
            }
            other => panic!("Expected WaitingForInput, got {other:?}"),
        }
    }
}

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_phaseflow_help() {
        phaseflow()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume"));
    }

    #[test]
    fn test_phaseflow_version() {
        phaseflow().arg("--version").assert().success();
    }

    #[test]
    fn test_start_without_flows_file_fails() {
        let dir = TempDir::new().unwrap();
        phaseflow()
            .current_dir(dir.path())
            .args(["start", "memo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read flows file"));
    }

    #[test]
    fn test_start_unknown_flow_fails() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        phaseflow()
            .current_dir(dir.path())
            .args(["start", "novel"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Flow 'novel' is not defined"));
    }

    #[test]
    fn test_next_without_session_fails() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        phaseflow()
            .current_dir(dir.path())
            .arg("next")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No session found"));
    }

    #[test]
    fn test_manual_loop_to_completion() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![PhaseDefinition::new("Phase1", "manual", vec![], 3)],
        );
        let output = dir.path().join("out.md");
        fs::write(&output, "# Memo\n").unwrap();

        phaseflow()
            .current_dir(dir.path())
            .args(["start", "memo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Started"));

        phaseflow()
            .current_dir(dir.path())
            .arg("next")
            .assert()
            .success()
            .stdout(predicate::str::contains("Waiting for input"));
        assert!(
            dir.path()
                .join(".phaseflow/artifacts/Phase1/attempt-1-prompt.md")
                .exists()
        );

        phaseflow()
            .current_dir(dir.path())
            .args(["done", "Phase1", "--output"])
            .arg(&output)
            .assert()
            .success()
            .stdout(predicate::str::contains("Flow complete"));

        phaseflow()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"passed\""));

        let assert = phaseflow()
            .current_dir(dir.path())
            .args(["events", "--type", "flow_completed", "--json"])
            .assert()
            .success();
        let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
        assert_eq!(stdout.lines().count(), 1);
    }

    #[test]
    fn test_command_gate_from_config_drives_retry() {
        let dir = TempDir::new().unwrap();
        write_flows(
            &dir,
            vec![PhaseDefinition::new("Phase2", "manual", gates(&["nonempty"]), 3)],
        );
        fs::write(
            dir.path().join(".phaseflow/phaseflow.toml"),
            r#"
[gates.nonempty]
command = 'test -s "$PHASEFLOW_OUTPUT_FILE"'
description = "Output must not be empty"
category = "CONTENT_DEFECT"
"#,
        )
        .unwrap();

        phaseflow()
            .current_dir(dir.path())
            .args(["start", "memo"])
            .assert()
            .success();

        phaseflow()
            .current_dir(dir.path())
            .args(["done", "Phase2"])
            .write_stdin("")
            .assert()
            .success()
            .stdout(predicate::str::contains("retry"))
            .stdout(predicate::str::contains("CONTENT_DEFECT"));

        phaseflow()
            .current_dir(dir.path())
            .args(["done", "Phase2"])
            .write_stdin("A full paragraph.")
            .assert()
            .success()
            .stdout(predicate::str::contains("Flow complete"));
    }

    #[test]
    fn test_resume_requires_suspended_phase() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        phaseflow()
            .current_dir(dir.path())
            .args(["start", "memo"])
            .assert()
            .success();
        phaseflow()
            .current_dir(dir.path())
            .arg("resume")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot resume phase 'Phase0A'"));
    }

    #[test]
    fn test_config_reports_warnings() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        fs::write(
            dir.path().join(".phaseflow/phaseflow.toml"),
            "[routing.categories]\nTONE_DEFECT = \"Phase1\"\n",
        )
        .unwrap();
        phaseflow()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("TONE_DEFECT"));
    }

    #[test]
    fn test_config_shows_worker_commands() {
        let dir = TempDir::new().unwrap();
        write_flows(&dir, authoring_flow(3));
        fs::write(
            dir.path().join(".phaseflow/phaseflow.toml"),
            "[workers.codex]\ncommand = \"team-codex\"\nargs = [\"exec\", \"--quiet\"]\n",
        )
        .unwrap();
        phaseflow()
            .current_dir(dir.path())
            .env_remove("PHASEFLOW_CODEX_CMD")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("team-codex exec --quiet"))
            .stdout(predicate::str::contains("(prompt files only)"));
    }
}
