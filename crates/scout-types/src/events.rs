// Status Events
// Append-only, per-run ordered progress events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// One entry in a run's ordered status stream.
///
/// Sequence numbers are assigned by the status log, strictly increasing and
/// gapless from 1 within a run. Events are never mutated after append; replay
/// delivers copies with `is_replay` set so consumers can tell catch-up from
/// live updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub run_id: String,
    pub seq: u64,
    pub stage: Stage,
    /// Human-readable progress message.
    pub message: String,
    /// Stage-specific payload (query lists, document counts, scores, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_replay: bool,
}

impl StatusEvent {
    pub fn new(run_id: &str, seq: u64, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            seq,
            stage,
            message: message.into(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
            is_replay: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
