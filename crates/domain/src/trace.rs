use serde::Serialize;

/// Structured trace events emitted across the orchestrator crates, mirroring
/// the shape of ordinary `tracing` spans/fields but collected here so they
/// can be asserted on directly in tests without a subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    TurnStarted {
        session_id: String,
        turn_id: String,
        provider: String,
    },
    TurnEnded {
        session_id: String,
        turn_id: String,
        outcome: String,
    },
    ToolDispatched {
        session_id: String,
        call_id: String,
        tool_name: String,
    },
    CliSpawned {
        session_id: String,
        flavor: String,
        pid: Option<i32>,
    },
    CliKilled {
        session_id: String,
        pid: Option<i32>,
        escalated_to_sigkill: bool,
    },
    CancelIssued {
        session_id: String,
        cascaded_to: usize,
    },
    EventAppendFailed {
        session_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "orchestrator_event");
    }
}
