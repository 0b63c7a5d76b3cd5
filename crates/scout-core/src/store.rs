// Run Store
// Persistence layer for run state and status event logs, file-per-run

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use scout_types::{Run, RunSummary, StatusEvent};

use crate::error::{EngineError, Result};

// ============================================================================
// Run Store
// ============================================================================

/// Persistence for runs: each run owns a directory with its `run.json`
/// snapshot and an append-only `events.log` (JSONL). Both survive restarts;
/// deleting a run's data is an explicit operation, never a side effect of
/// completion.
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let base_dir = state_dir.join("runs");
        fs::create_dir_all(&base_dir)
            .map_err(|e| EngineError::Io(format!("Failed to create runs directory: {}", e)))?;
        Ok(Self { base_dir })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// Save run state.
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.run_id);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Io(format!("Failed to create run directory: {}", e)))?;

        let path = dir.join("run.json");
        let content = serde_json::to_string_pretty(run)
            .map_err(|e| EngineError::Serialization(format!("Failed to serialize run: {}", e)))?;
        atomic_write(&path, &content)
    }

    /// Load run state.
    pub fn load_run(&self, run_id: &str) -> Result<Run> {
        let path = self.run_dir(run_id).join("run.json");
        let content = fs::read_to_string(&path)
            .map_err(|e| EngineError::Io(format!("Failed to read run file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Parse(format!("Failed to parse run file: {}", e)))
    }

    /// Append a status event to the run's log.
    pub fn append_event(&self, event: &StatusEvent) -> Result<()> {
        let run_dir = self.run_dir(&event.run_id);
        // Events can be emitted before the run snapshot is first persisted.
        fs::create_dir_all(&run_dir)
            .map_err(|e| EngineError::Io(format!("Failed to create run directory: {}", e)))?;

        let path = run_dir.join("events.log");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::Io(format!("Failed to open events log: {}", e)))?;

        let line = serde_json::to_string(event)
            .map_err(|e| EngineError::Serialization(format!("Failed to serialize event: {}", e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| EngineError::Io(format!("Failed to write event: {}", e)))?;
        Ok(())
    }

    /// Load all events for a run in append order.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<StatusEvent>> {
        let path = self.run_dir(run_id).join("events.log");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .map_err(|e| EngineError::Io(format!("Failed to open events log: {}", e)))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| EngineError::Io(format!("Failed to read events log line: {}", e)))?;
            if let Ok(event) = serde_json::from_str(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Highest sequence number already persisted for a run (0 if none).
    pub fn latest_event_seq(&self, run_id: &str) -> u64 {
        self.load_events(run_id)
            .map(|events| events.iter().map(|e| e.seq).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// List all persisted run ids.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .map_err(|e| EngineError::Io(format!("Failed to read runs directory: {}", e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| EngineError::Io(format!("Failed to read directory entry: {}", e)))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        Ok(runs)
    }

    /// Load summaries for all persisted runs, most recent first.
    pub fn load_summaries(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for run_id in self.list_runs()? {
            match self.load_run(&run_id) {
                Ok(run) => summaries.push(run.to_summary()),
                Err(e) => tracing::warn!("skipping unreadable run {}: {}", run_id, e),
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    /// Delete a run's directory, snapshot and event log included.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| EngineError::Io(format!("Failed to delete run directory: {}", e)))?;
        }
        Ok(())
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join("run.json").exists()
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| EngineError::Io(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| EngineError::Io(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use scout_types::{Mode, Stage};
    use tempfile::tempdir;

    #[test]
    fn test_save_load_run() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();

        let run = Run::new("run_1".to_string(), "test query".to_string(), Mode::Fast);
        store.save_run(&run).unwrap();
        let loaded = store.load_run("run_1").unwrap();

        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.query, run.query);
        assert_eq!(loaded.stage, Stage::Thinking);
    }

    #[test]
    fn test_append_load_events() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();

        let event1 = StatusEvent::new("run_1", 1, Stage::Thinking, "planning");
        let event2 = StatusEvent::new("run_1", 2, Stage::Searching, "searching");
        store.append_event(&event1).unwrap();
        store.append_event(&event2).unwrap();

        let events = store.load_events("run_1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert_eq!(store.latest_event_seq("run_1"), 2);
    }

    #[test]
    fn test_events_for_unknown_run_are_empty() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();
        assert!(store.load_events("missing").unwrap().is_empty());
        assert_eq!(store.latest_event_seq("missing"), 0);
    }

    #[test]
    fn test_list_runs() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();

        store
            .save_run(&Run::new("run_1".to_string(), "q1".to_string(), Mode::Fast))
            .unwrap();
        store
            .save_run(&Run::new(
                "run_2".to_string(),
                "q2".to_string(),
                Mode::Thorough,
            ))
            .unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.contains(&"run_1".to_string()));
        assert!(runs.contains(&"run_2".to_string()));
    }

    #[test]
    fn test_delete_run_removes_snapshot_and_events() {
        let temp = tempdir().unwrap();
        let store = RunStore::new(temp.path()).unwrap();

        let run = Run::new("run_1".to_string(), "q".to_string(), Mode::Fast);
        store.save_run(&run).unwrap();
        store
            .append_event(&StatusEvent::new("run_1", 1, Stage::Thinking, "planning"))
            .unwrap();

        store.delete_run("run_1").unwrap();
        assert!(!store.run_exists("run_1"));
        assert!(store.load_events("run_1").unwrap().is_empty());
    }
}
