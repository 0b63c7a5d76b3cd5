// Pipeline Types
// Core type definitions shared across the Scout engine crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Mode & Stage
// ============================================================================

/// Research depth requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Single pass, no QA loop-backs.
    #[default]
    Fast,
    /// Wider query fan-out, QA may request more evidence up to the loop cap.
    Thorough,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Thorough => "thorough",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "thorough" => Ok(Mode::Thorough),
            other => Err(format!("unknown mode `{}` (expected fast|thorough)", other)),
        }
    }
}

/// Node in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Thinking,
    Searching,
    Distilling,
    Synthesizing,
    Qa,
    Formatting,
    Titling,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Thinking => "thinking",
            Stage::Searching => "searching",
            Stage::Distilling => "distilling",
            Stage::Synthesizing => "synthesizing",
            Stage::Qa => "qa",
            Stage::Formatting => "formatting",
            Stage::Titling => "titling",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    /// Terminal stages end the run; the registry drops it from the active set.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

/// One prior message of the surrounding conversation, supplied by the caller.
/// Transcript storage itself is external to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

// ============================================================================
// Evidence
// ============================================================================

/// Extracted content from one fetched URL. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub url: String,
    pub title: String,
    /// Normalized plain-text content; must be non-empty to be eligible downstream.
    pub content: String,
    pub fetched_ok: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Evidence item after scoring and truncation. Derived, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEvidence {
    pub url: String,
    pub title: String,
    /// Content truncated to the configured excerpt cap.
    pub excerpt: String,
    /// Combined score: relevance-weighted plus source-quality-weighted.
    pub score: f64,
}

/// A citation marker index bound to the evidence item it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based index as it appears in the answer text (`[n]` / `[^n]`).
    pub index: usize,
    pub url: String,
    pub title: String,
}

// ============================================================================
// Stage outputs
// ============================================================================

/// Output of the thinking stage: the planned search queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkPlan {
    pub queries: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// Output of the QA stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaVerdict {
    pub needs_more_evidence: bool,
    pub quality_score: f64,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub refined_query: Option<String>,
    #[serde(default)]
    pub improvement_notes: Vec<String>,
}

impl QaVerdict {
    /// Verdict used when the critique cannot be parsed: accept the draft as-is.
    pub fn satisfied() -> Self {
        Self {
            needs_more_evidence: false,
            quality_score: 0.6,
            missing_aspects: Vec::new(),
            refined_query: None,
            improvement_notes: Vec::new(),
        }
    }
}

/// Synthesis result. Low evidence is a distinguishable outcome, not an error
/// and not a sentinel string, so callers cannot silently ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum SynthesisOutcome {
    /// Answer grounded in the distilled evidence set.
    Grounded(String),
    /// Best-effort answer produced without sufficient evidence.
    LowEvidence(String),
}

impl SynthesisOutcome {
    pub fn text(&self) -> &str {
        match self {
            SynthesisOutcome::Grounded(text) | SynthesisOutcome::LowEvidence(text) => text,
        }
    }

    pub fn is_low_evidence(&self) -> bool {
        matches!(self, SynthesisOutcome::LowEvidence(_))
    }
}

// ============================================================================
// Run State
// ============================================================================

/// One end-to-end pipeline execution for a single user query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: String,
    /// Conversation this run belongs to, if the client supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// The user's message.
    pub query: String,
    pub mode: Mode,
    /// Current stage in the pipeline state machine.
    pub stage: Stage,
    /// Number of QA re-search loop-backs taken so far.
    pub loop_count: u32,
    /// Accumulated answer draft.
    #[serde(default)]
    pub answer: String,
    /// Citations retained after formatting.
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Conversation title; generated once per conversation, first reply only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(run_id: String, query: String, mode: Mode) -> Self {
        Self {
            run_id,
            conversation_id: None,
            query,
            mode,
            stage: Stage::Thinking,
            loop_count: 0,
            answer: String::new(),
            citations: Vec::new(),
            title: None,
            error_message: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn to_summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            query: self.query.clone(),
            mode: self.mode,
            stage: self.stage,
            title: self.title.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Lightweight run descriptor for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub query: String,
    pub mode: Mode,
    pub stage: Stage,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
