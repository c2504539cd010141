use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of records in the session event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionInitialized,
    PhaseStarted,
    WaitingForInput,
    WorkerFailed,
    GatesEvaluated,
    StateTransition,
    PhaseAdvanced,
    PhaseResumed,
    FlowCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionInitialized => "session_initialized",
            EventType::PhaseStarted => "phase_started",
            EventType::WaitingForInput => "waiting_for_input",
            EventType::WorkerFailed => "worker_failed",
            EventType::GatesEvaluated => "gates_evaluated",
            EventType::StateTransition => "state_transition",
            EventType::PhaseAdvanced => "phase_advanced",
            EventType::PhaseResumed => "phase_resumed",
            EventType::FlowCompleted => "flow_completed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data,
        }
    }
}

pub mod logger;
pub use logger::EventLog;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_flat_record() {
        let event = Event::new(
            EventType::StateTransition,
            serde_json::json!({"phase": "Phase1", "action": "retry"}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "state_transition");
        assert_eq!(value["data"]["action"], "retry");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_event_type_display_matches_serde() {
        let json = serde_json::to_string(&EventType::SessionInitialized).unwrap();
        assert_eq!(json, format!("\"{}\"", EventType::SessionInitialized));
    }
}
