// Run Registry
// Process-wide active-run set; at most one engine instance per run id

use std::collections::HashSet;

use tokio::sync::Mutex;

/// Tracks which runs are currently executing. Purely in-memory with process
/// lifetime; durable history lives in the run store, so the active set can be
/// re-derived after a restart if needed. Injected into the orchestration
/// layer rather than accessed as ambient state.
#[derive(Default)]
pub struct RunRegistry {
    active: Mutex<HashSet<String>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a run id for execution. Returns false when the run is already
    /// in flight, in which case the caller attaches to the existing run
    /// instead of starting a second engine instance.
    pub async fn start(&self, run_id: &str) -> bool {
        self.active.lock().await.insert(run_id.to_string())
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.active.lock().await.contains(run_id)
    }

    /// Release a run id; called once its engine reaches a terminal stage.
    pub async fn finish(&self, run_id: &str) {
        self.active.lock().await.remove(run_id);
    }

    pub async fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_start_for_an_active_run_is_rejected() {
        let registry = RunRegistry::new();
        assert!(registry.start("run_1").await);
        assert!(!registry.start("run_1").await);
        assert!(registry.is_active("run_1").await);
    }

    #[tokio::test]
    async fn finished_runs_can_be_started_again() {
        let registry = RunRegistry::new();
        assert!(registry.start("run_1").await);
        registry.finish("run_1").await;
        assert!(!registry.is_active("run_1").await);
        assert!(registry.start("run_1").await);
    }

    #[tokio::test]
    async fn list_active_reflects_current_set() {
        let registry = RunRegistry::new();
        registry.start("run_b").await;
        registry.start("run_a").await;
        registry.finish("run_b").await;
        assert_eq!(registry.list_active().await, vec!["run_a".to_string()]);
    }
}
