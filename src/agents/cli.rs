//! Workers backed by an external agent CLI.

use super::{Worker, WorkerContext, WorkerKind, WorkerStatus};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub struct CliWorker {
    kind: WorkerKind,
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CliWorker {
    pub fn new(kind: WorkerKind, command: &str, args: Vec<String>, working_dir: &Path) -> Self {
        Self {
            kind,
            command: command.to_string(),
            args,
            working_dir: working_dir.to_path_buf(),
        }
    }

    async fn run(&self, prompt: &str, ctx: &WorkerContext) -> anyhow::Result<WorkerStatus> {
        use anyhow::Context;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PHASEFLOW_SESSION_ID", ctx.session_id.to_string())
            .env("PHASEFLOW_PHASE", &ctx.phase_id)
            .env("PHASEFLOW_ATTEMPT", ctx.attempt.to_string())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        // Feed stdin concurrently with draining stdout, or an agent that
        // writes before it has read the whole prompt fills the pipe and both
        // sides block.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_owned();
            tokio::spawn(async move { stdin.write_all(prompt.as_bytes()).await })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for worker")?;

        if let Some(writer) = writer {
            match writer.await.context("Prompt writer task failed")? {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(command = %self.command, "worker closed stdin before reading the whole prompt");
                }
                Err(e) => return Err(e).context("Failed to write prompt to worker stdin"),
            }
        }

        if output.status.success() {
            Ok(WorkerStatus::Completed {
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(WorkerStatus::Failed {
                message: format!(
                    "{} exited with code {}: {}",
                    self.command,
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            })
        }
    }
}

#[async_trait]
impl Worker for CliWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Available when `<command> --version` can be spawned.
    async fn is_available(&self) -> bool {
        Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok()
    }

    async fn execute(&self, prompt: &str, ctx: &WorkerContext) -> WorkerStatus {
        info!(kind = %self.kind, command = %self.command, phase = %ctx.phase_id, "invoking worker");
        match self.run(prompt, ctx).await {
            Ok(status) => {
                debug!(kind = %self.kind, status = status.as_str(), "worker finished");
                status
            }
            Err(e) => WorkerStatus::Failed {
                message: format!("{:#}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn ctx() -> WorkerContext {
        WorkerContext {
            session_id: Uuid::new_v4(),
            phase_id: "Phase1".to_string(),
            attempt: 2,
        }
    }

    #[tokio::test]
    async fn test_prompt_goes_to_stdin_and_stdout_is_output() {
        let dir = tempdir().unwrap();
        let worker = CliWorker::new(WorkerKind::Claude, "cat", vec![], dir.path());
        let status = worker.execute("draft the memo", &ctx()).await;
        assert_eq!(
            status,
            WorkerStatus::Completed {
                output: "draft the memo".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_env_carries_phase() {
        let dir = tempdir().unwrap();
        let worker = CliWorker::new(
            WorkerKind::Codex,
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo $PHASEFLOW_PHASE".to_string()],
            dir.path(),
        );
        match worker.execute("x", &ctx()).await {
            WorkerStatus::Completed { output } => assert_eq!(output.trim(), "Phase1"),
            other => panic!("Expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = tempdir().unwrap();
        let worker = CliWorker::new(
            WorkerKind::Gemini,
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo quota >&2; exit 2".to_string()],
            dir.path(),
        );
        match worker.execute("x", &ctx()).await {
            WorkerStatus::Failed { message } => {
                assert!(message.contains("code 2"));
                assert!(message.contains("quota"));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_prompt_with_early_output_completes() {
        let dir = tempdir().unwrap();
        // Writes more than a pipe buffer before reading any input.
        let worker = CliWorker::new(
            WorkerKind::Claude,
            "sh",
            vec![
                "-c".to_string(),
                "head -c 200000 /dev/zero; cat >/dev/null".to_string(),
            ],
            dir.path(),
        );
        let prompt = "p".repeat(300_000);

        let status = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            worker.execute(&prompt, &ctx()),
        )
        .await
        .expect("worker hung on a large prompt");

        match status {
            WorkerStatus::Completed { output } => assert_eq!(output.len(), 200_000),
            other => panic!("Expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_error_is_failed() {
        let dir = tempdir().unwrap();
        let worker = CliWorker::new(
            WorkerKind::Claude,
            "phaseflow-test-no-such-binary",
            vec![],
            dir.path(),
        );
        assert!(!worker.is_available().await);
        assert!(matches!(
            worker.execute("x", &ctx()).await,
            WorkerStatus::Failed { .. }
        ));
    }
}
