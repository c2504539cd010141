use super::{Worker, WorkerContext, WorkerKind, WorkerStatus};
use async_trait::async_trait;

/// Always-available fallback. Hands the prompt to a human: the orchestrator
/// persists it and suspends until `done` is called.
pub struct ManualWorker;

#[async_trait]
impl Worker for ManualWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Manual
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, _prompt: &str, _ctx: &WorkerContext) -> WorkerStatus {
        WorkerStatus::ManualRequired
    }
}
