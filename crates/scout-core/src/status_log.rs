// Status Log
// Persistent, replayable per-run status stream with live subscription

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use scout_types::{Stage, StatusEvent};

use crate::error::Result;
use crate::store::RunStore;

/// Append-only status log. Assigns gapless, strictly increasing sequence
/// numbers per run (restored from disk after a restart), persists every event
/// before broadcasting it, and can replay full history for reconnecting
/// consumers with `is_replay` set.
pub struct StatusLog {
    store: Arc<RunStore>,
    tx: broadcast::Sender<StatusEvent>,
    seqs: Mutex<HashMap<String, u64>>,
}

impl StatusLog {
    pub fn new(store: Arc<RunStore>) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            store,
            tx,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event for a run. The sequence number is assigned here so the
    /// per-run ordering contract lives in one place.
    pub async fn append(
        &self,
        run_id: &str,
        stage: Stage,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<StatusEvent> {
        let seq = {
            let mut seqs = self.seqs.lock().await;
            let counter = seqs
                .entry(run_id.to_string())
                .or_insert_with(|| self.store.latest_event_seq(run_id));
            *counter += 1;
            *counter
        };

        let event = StatusEvent::new(run_id, seq, stage, message).with_payload(payload);
        // Persist before broadcast: a reconnecting client must never see an
        // event live that later vanishes from replay.
        self.store.append_event(&event)?;
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// Subscribe to the live stream. Events carry their run id; consumers
    /// interested in one run filter on it.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Full persisted history of a run, in sequence order, as stored.
    pub fn read_all(&self, run_id: &str) -> Result<Vec<StatusEvent>> {
        self.store.load_events(run_id)
    }

    /// Full history with every event marked as a replay, for catch-up
    /// delivery to a reconnecting consumer.
    pub fn replay(&self, run_id: &str) -> Result<Vec<StatusEvent>> {
        let mut events = self.store.load_events(run_id)?;
        for event in &mut events {
            event.is_replay = true;
        }
        Ok(events)
    }

    /// Explicitly delete a run's event history.
    pub async fn delete(&self, run_id: &str) -> Result<()> {
        self.seqs.lock().await.remove(run_id);
        self.store.delete_run(run_id)
    }
}
