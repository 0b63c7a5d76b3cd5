// Run Manager
// Process-wide wiring: starts runs, deduplicates in-flight ones, exposes
// the status stream and persisted history

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scout_providers::{EvidenceClient, Generator, SearchBackend};
use scout_types::{ChatTurn, Mode, Run, RunSummary, StatusEvent};

use crate::config::PipelineConfig;
use crate::engine::PipelineEngine;
use crate::error::{EngineError, Result};
use crate::registry::RunRegistry;
use crate::status_log::StatusLog;
use crate::store::RunStore;

/// Run-start request as sent by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Used as the run id when present, so reconnects key on it.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub mode: Mode,
    /// Recent conversation turns; transcript storage is external.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Existing conversation title, if one was already generated.
    #[serde(default)]
    pub conversation_title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: String,
    /// True when the request attached to an already-executing run.
    pub attached: bool,
}

/// Owns the shared pieces of the pipeline (registry, status log, store,
/// evidence cache) and spawns one engine task per run.
pub struct RunManager {
    config: PipelineConfig,
    generator: Arc<dyn Generator>,
    evidence_client: EvidenceClient,
    registry: Arc<RunRegistry>,
    status: Arc<StatusLog>,
    store: Arc<RunStore>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl RunManager {
    pub fn new(
        state_dir: &Path,
        config: PipelineConfig,
        generator: Arc<dyn Generator>,
        backend: Arc<dyn SearchBackend>,
    ) -> Result<Self> {
        let store = Arc::new(RunStore::new(state_dir)?);
        let status = Arc::new(StatusLog::new(store.clone()));
        let evidence_client = EvidenceClient::new(backend, config.search.clone());
        Ok(Self {
            config,
            generator,
            evidence_client,
            registry: Arc::new(RunRegistry::new()),
            status,
            store,
            cancellations: Mutex::new(HashMap::new()),
        })
    }

    /// Start a run, or attach to the in-flight run with the same id.
    /// A duplicate request is not an error.
    pub async fn send_message(self: &Arc<Self>, request: SendMessageRequest) -> Result<RunTicket> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(EngineError::InvalidOperation(
                "message must not be empty".to_string(),
            ));
        }

        let run_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !self.registry.start(&run_id).await {
            tracing::info!("run {} already in flight, attaching", run_id);
            return Ok(RunTicket {
                run_id,
                attached: true,
            });
        }

        let mut run = Run::new(run_id.clone(), message, request.mode);
        run.conversation_id = request.conversation_id.clone();
        run.title = request
            .conversation_title
            .clone()
            .filter(|t| !t.trim().is_empty());

        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(run_id.clone(), cancel.clone());

        let manager = self.clone();
        let history = request.history;
        tokio::spawn(async move {
            let engine = PipelineEngine::new(
                manager.config.clone(),
                manager.generator.clone(),
                manager.evidence_client.clone(),
                manager.status.clone(),
                manager.store.clone(),
                manager.registry.clone(),
                cancel,
            );
            let run = engine.execute(run, &history).await;
            manager.cancellations.lock().await.remove(&run.run_id);
            tracing::info!("run {} finished in stage {}", run.run_id, run.stage.as_str());
        });

        Ok(RunTicket {
            run_id,
            attached: false,
        })
    }

    /// Live event stream for all runs; filter on `run_id`.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Join a run by id: full replayed history (marked `is_replay`) plus a
    /// live receiver for everything after it.
    pub async fn join(
        &self,
        run_id: &str,
    ) -> Result<(Vec<StatusEvent>, broadcast::Receiver<StatusEvent>)> {
        if !self.store.run_exists(run_id) && !self.registry.is_active(run_id).await {
            return Err(EngineError::NotFound(format!("run {} not found", run_id)));
        }
        // Subscribe before reading history so no live event falls in between.
        let receiver = self.status.subscribe();
        let replayed = self.status.replay(run_id)?;
        Ok((replayed, receiver))
    }

    /// Ask a run to stop at the next stage boundary.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        match self.cancellations.lock().await.get(run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "no executing run with id {}",
                run_id
            ))),
        }
    }

    pub async fn list_active(&self) -> Vec<String> {
        self.registry.list_active().await
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.store.load_summaries()
    }

    pub fn load_run(&self, run_id: &str) -> Result<Run> {
        self.store.load_run(run_id)
    }

    pub fn read_events(&self, run_id: &str) -> Result<Vec<StatusEvent>> {
        self.status.read_all(run_id)
    }

    /// Delete a run's persisted history. Refused while the run executes.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        if self.registry.is_active(run_id).await {
            return Err(EngineError::InvalidOperation(format!(
                "run {} is still executing",
                run_id
            )));
        }
        self.status.delete(run_id).await
    }
}

// ============================================================================
// Tests
// ============================================================================
