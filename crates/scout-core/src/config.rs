// Pipeline Configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use scout_providers::SearchConfig;
use scout_types::Mode;

use crate::error::{EngineError, Result};

/// Configuration for pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Evidence fetching tunables (cache TTL, retries, backoff, fan-out).
    pub search: SearchConfig,
    /// Query fan-out per thinking pass in fast mode.
    pub fast_min_queries: usize,
    pub fast_max_queries: usize,
    /// Query fan-out per thinking pass in thorough mode.
    pub thorough_min_queries: usize,
    pub thorough_max_queries: usize,
    /// QA re-search loop-backs allowed per run, by mode.
    pub fast_loop_bound: u32,
    pub thorough_loop_bound: u32,
    /// Minimum draft length (words) before thorough mode accepts it.
    pub thorough_min_words: usize,
    /// Maximum evidence items kept after distillation.
    pub evidence_cap: usize,
    /// Maximum characters of content carried per evidence item.
    pub excerpt_cap: usize,
    /// Total evidence characters below which synthesis fails soft.
    pub low_evidence_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            fast_min_queries: 3,
            fast_max_queries: 5,
            thorough_min_queries: 7,
            thorough_max_queries: 10,
            fast_loop_bound: 0,
            thorough_loop_bound: 2,
            thorough_min_words: 4000,
            evidence_cap: 8,
            excerpt_cap: 2000,
            low_evidence_chars: 400,
        }
    }
}

impl PipelineConfig {
    /// Inclusive query-count range for a mode.
    pub fn query_range(&self, mode: Mode) -> (usize, usize) {
        match mode {
            Mode::Fast => (self.fast_min_queries, self.fast_max_queries),
            Mode::Thorough => (self.thorough_min_queries, self.thorough_max_queries),
        }
    }

    /// Hard cap on QA loop-backs for a mode.
    pub fn loop_bound(&self, mode: Mode) -> u32 {
        match mode {
            Mode::Fast => self.fast_loop_bound,
            Mode::Thorough => self.thorough_loop_bound,
        }
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Io(format!("Failed to read config file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Parse(format!("Failed to parse config file: {}", e)))
    }

    /// Load from a JSON file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("ignoring invalid config at {}: {}", path.display(), e),
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = PipelineConfig::default();
        assert_eq!(config.evidence_cap, 8);
        assert_eq!(config.excerpt_cap, 2000);
        assert_eq!(config.thorough_loop_bound, 2);
        assert_eq!(config.fast_loop_bound, 0);
        assert_eq!(config.query_range(Mode::Fast), (3, 5));
        assert_eq!(config.query_range(Mode::Thorough), (7, 10));
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let parsed: PipelineConfig =
            serde_json::from_str(r#"{"thorough_min_words": 2500}"#).unwrap();
        assert_eq!(parsed.thorough_min_words, 2500);
        assert_eq!(parsed.evidence_cap, 8);
        assert_eq!(parsed.search.cache_ttl_secs, 120);
    }
}
