// Pipeline Engine
// Stage graph executor: Think -> Search -> Distill -> Synthesize -> QA ->
// {loop back | Format} -> Title -> Done, with status events at every step

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use scout_providers::{EvidenceClient, Generator};
use scout_types::{
    ChatTurn, EvidenceItem, Mode, QaVerdict, Run, ScoredEvidence, Stage, SynthesisOutcome,
    ThinkPlan,
};

use crate::citations;
use crate::config::PipelineConfig;
use crate::distill::Distiller;
use crate::error::{EngineError, Result};
use crate::prompts::StagePrompts;
use crate::registry::RunRegistry;
use crate::status_log::StatusLog;
use crate::store::RunStore;

// ============================================================================
// Transition Function
// ============================================================================

/// Signals a completed stage feeds into the transition function.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionSignals {
    /// QA asked for more evidence (or the draft missed the length floor).
    pub qa_needs_more: bool,
    /// Draft meets the mode's minimum length requirement.
    pub draft_long_enough: bool,
    /// The run already carries a conversation title.
    pub has_title: bool,
}

/// Pure transition function of the pipeline state machine. The loop edge
/// exists only in thorough mode and is capped by `loop_bound`; fast mode
/// always proceeds from QA to formatting.
pub fn next_stage(
    stage: Stage,
    mode: Mode,
    loop_count: u32,
    loop_bound: u32,
    signals: TransitionSignals,
) -> Stage {
    match stage {
        Stage::Thinking => Stage::Searching,
        Stage::Searching => Stage::Distilling,
        Stage::Distilling => Stage::Synthesizing,
        Stage::Synthesizing => Stage::Qa,
        Stage::Qa => {
            let wants_loop = signals.qa_needs_more || !signals.draft_long_enough;
            if mode == Mode::Thorough && wants_loop && loop_count < loop_bound {
                Stage::Thinking
            } else {
                Stage::Formatting
            }
        }
        Stage::Formatting => {
            if signals.has_title {
                Stage::Done
            } else {
                Stage::Titling
            }
        }
        Stage::Titling => Stage::Done,
        Stage::Done => Stage::Done,
        Stage::Failed => Stage::Failed,
    }
}

// ============================================================================
// Pipeline Engine
// ============================================================================

/// Working state of one Search -> Distill -> Synthesize cycle. Replaced on a
/// QA loop-back; only the answer, citations and title outlive it on the run.
#[derive(Default)]
struct CycleState {
    plan: ThinkPlan,
    raw_items: Vec<EvidenceItem>,
    evidence: Vec<ScoredEvidence>,
    low_evidence: bool,
    qa: Option<QaVerdict>,
}

/// Executes one run through the stage graph. Owns the run state exclusively
/// for the duration of the execution; everything shared (status log, store,
/// registry, evidence cache) is injected.
pub struct PipelineEngine {
    config: PipelineConfig,
    generator: Arc<dyn Generator>,
    evidence_client: EvidenceClient,
    distiller: Distiller,
    status: Arc<StatusLog>,
    store: Arc<RunStore>,
    registry: Arc<RunRegistry>,
    cancel: CancellationToken,
}

impl PipelineEngine {
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn Generator>,
        evidence_client: EvidenceClient,
        status: Arc<StatusLog>,
        store: Arc<RunStore>,
        registry: Arc<RunRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let distiller = Distiller::with_default_scorers(
            config.evidence_cap,
            config.excerpt_cap,
            config.low_evidence_chars,
        );
        Self {
            config,
            generator,
            evidence_client,
            distiller,
            status,
            store,
            registry,
            cancel,
        }
    }

    /// Drive the run to a terminal stage. Cancellation is honored between
    /// stages, never mid-stage.
    pub async fn execute(&self, mut run: Run, history: &[ChatTurn]) -> Run {
        let mut cycle = CycleState::default();
        if let Err(e) = self.store.save_run(&run) {
            tracing::warn!("failed to persist run {}: {}", run.run_id, e);
        }

        loop {
            if run.is_terminal() {
                break;
            }
            if self.cancel.is_cancelled() {
                self.fail(&mut run, "cancelled by client").await;
                break;
            }

            match self.run_stage(&mut run, &mut cycle, history).await {
                Ok(signals) => {
                    let loop_bound = self.config.loop_bound(run.mode);
                    let next = next_stage(run.stage, run.mode, run.loop_count, loop_bound, signals);
                    if run.stage == Stage::Qa && next == Stage::Thinking {
                        run.loop_count += 1;
                    }
                    run.stage = next;
                    if next == Stage::Done {
                        self.complete(&mut run, &cycle).await;
                    }
                    if let Err(e) = self.store.save_run(&run) {
                        tracing::warn!("failed to persist run {}: {}", run.run_id, e);
                    }
                }
                Err(e) => self.fail(&mut run, &e.to_string()).await,
            }
        }

        self.registry.finish(&run.run_id).await;
        run
    }

    async fn run_stage(
        &self,
        run: &mut Run,
        cycle: &mut CycleState,
        history: &[ChatTurn],
    ) -> Result<TransitionSignals> {
        match run.stage {
            Stage::Thinking => self.run_thinking(run, cycle, history).await,
            Stage::Searching => self.run_searching(run, cycle).await,
            Stage::Distilling => self.run_distilling(run, cycle).await,
            Stage::Synthesizing => self.run_synthesizing(run, cycle, history).await,
            Stage::Qa => self.run_qa(run, cycle).await,
            Stage::Formatting => self.run_formatting(run, cycle).await,
            Stage::Titling => self.run_titling(run).await,
            Stage::Done | Stage::Failed => Ok(TransitionSignals::default()),
        }
    }

    // ------------------------------------------------------------------
    // Stage executors
    // ------------------------------------------------------------------

    async fn run_thinking(
        &self,
        run: &mut Run,
        cycle: &mut CycleState,
        history: &[ChatTurn],
    ) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Thinking,
                "Analyzing the query and planning search strategy...",
                serde_json::Value::Null,
            )
            .await?;

        let (min_queries, max_queries) = self.config.query_range(run.mode);
        let prompt = StagePrompts::build_thinking_prompt(
            &run.query,
            run.mode,
            min_queries,
            max_queries,
            history,
            cycle.qa.as_ref(),
        );

        let plan = match self.generator.generate(&prompt).await {
            Ok(output) => StagePrompts::parse_think_plan(&output, &run.query, max_queries),
            Err(e) => {
                tracing::warn!("thinking generation failed ({}), searching directly", e);
                ThinkPlan {
                    queries: vec![run.query.clone()],
                    rationale: format!("planner unavailable ({}), searching the query directly", e),
                }
            }
        };

        self.status
            .append(
                &run.run_id,
                Stage::Thinking,
                format!("Planned {} search queries", plan.queries.len()),
                json!({ "queries": &plan.queries }),
            )
            .await?;

        cycle.plan = plan;
        Ok(TransitionSignals::default())
    }

    async fn run_searching(&self, run: &mut Run, cycle: &mut CycleState) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Searching,
                "Searching online for relevant information...",
                json!({ "query_count": cycle.plan.queries.len() }),
            )
            .await?;

        let results = self.evidence_client.fetch(&cycle.plan.queries).await;

        // Merge in planned-query order and dedup by URL, first occurrence wins.
        let mut seen_urls = std::collections::HashSet::new();
        let mut merged = Vec::new();
        let mut failed_queries = Vec::new();
        for query in &cycle.plan.queries {
            match results.get(query.trim()) {
                Some(items) if !items.is_empty() => {
                    for item in items {
                        if seen_urls.insert(item.url.clone()) {
                            merged.push(item.clone());
                        }
                    }
                }
                _ => failed_queries.push(query.clone()),
            }
        }

        self.status
            .append(
                &run.run_id,
                Stage::Searching,
                format!("Found {} unique search results", merged.len()),
                json!({
                    "document_count": merged.len(),
                    "empty_queries": failed_queries,
                }),
            )
            .await?;

        cycle.raw_items = merged;
        Ok(TransitionSignals::default())
    }

    async fn run_distilling(
        &self,
        run: &mut Run,
        cycle: &mut CycleState,
    ) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Distilling,
                "Filtering and distilling search results...",
                serde_json::Value::Null,
            )
            .await?;

        let query_context = cycle
            .plan
            .queries
            .first()
            .map(String::as_str)
            .unwrap_or(&run.query);
        cycle.evidence = self.distiller.distill(&cycle.raw_items, query_context);
        cycle.low_evidence = self.distiller.is_low_evidence(&cycle.evidence);

        self.status
            .append(
                &run.run_id,
                Stage::Distilling,
                format!(
                    "Kept {} of {} sources",
                    cycle.evidence.len(),
                    cycle.raw_items.len()
                ),
                json!({
                    "raw_count": cycle.raw_items.len(),
                    "kept_count": cycle.evidence.len(),
                    "low_evidence": cycle.low_evidence,
                }),
            )
            .await?;

        Ok(TransitionSignals::default())
    }

    async fn run_synthesizing(
        &self,
        run: &mut Run,
        cycle: &mut CycleState,
        history: &[ChatTurn],
    ) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Synthesizing,
                "Synthesizing a comprehensive response...",
                serde_json::Value::Null,
            )
            .await?;

        let outcome = if cycle.low_evidence {
            // Fail-soft: a degraded-but-valid answer instead of an error.
            let prompt = StagePrompts::build_context_synthesis_prompt(&run.query, history);
            match self.generator.generate(&prompt).await {
                Ok(text) => SynthesisOutcome::LowEvidence(text),
                Err(e) => {
                    tracing::warn!("context synthesis failed: {}", e);
                    SynthesisOutcome::LowEvidence(
                        "I could not gather enough evidence to answer this question reliably. \
                         Please try again, or rephrase the question."
                            .to_string(),
                    )
                }
            }
        } else {
            let prompt = StagePrompts::build_synthesis_prompt(&run.query, &cycle.evidence);
            let text = self
                .generator
                .generate(&prompt)
                .await
                .map_err(|e| EngineError::Generation(e.to_string()))?;
            SynthesisOutcome::Grounded(text)
        };

        let low_evidence = outcome.is_low_evidence();
        run.answer = outcome.text().to_string();

        self.status
            .append(
                &run.run_id,
                Stage::Synthesizing,
                format!(
                    "Drafted answer from {} sources",
                    if low_evidence { 0 } else { cycle.evidence.len() }
                ),
                json!({
                    "answer_chars": run.answer.len(),
                    "low_evidence": low_evidence,
                }),
            )
            .await?;

        Ok(TransitionSignals::default())
    }

    async fn run_qa(&self, run: &mut Run, cycle: &mut CycleState) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Qa,
                "Quality checking the draft...",
                serde_json::Value::Null,
            )
            .await?;

        let word_count = run.answer.split_whitespace().count();
        let prompt = StagePrompts::build_qa_prompt(
            &run.query,
            &run.answer,
            run.mode,
            cycle.evidence.len(),
            word_count,
            self.config.thorough_min_words,
        );

        let verdict = match self.generator.generate(&prompt).await {
            Ok(output) => StagePrompts::parse_qa_verdict(&output),
            Err(e) => {
                tracing::warn!("QA generation failed ({}), accepting the draft", e);
                QaVerdict::satisfied()
            }
        };

        let draft_long_enough =
            run.mode == Mode::Fast || word_count >= self.config.thorough_min_words;
        let signals = TransitionSignals {
            qa_needs_more: verdict.needs_more_evidence,
            draft_long_enough,
            has_title: run.title.is_some(),
        };

        self.status
            .append(
                &run.run_id,
                Stage::Qa,
                format!("Quality check complete (score {:.2})", verdict.quality_score),
                json!({
                    "quality_score": verdict.quality_score,
                    "needs_more_evidence": verdict.needs_more_evidence,
                    "word_count": word_count,
                }),
            )
            .await?;

        let loop_bound = self.config.loop_bound(run.mode);
        let will_loop = run.mode == Mode::Thorough
            && (signals.qa_needs_more || !signals.draft_long_enough)
            && run.loop_count < loop_bound;
        if will_loop {
            self.status
                .append(
                    &run.run_id,
                    Stage::Qa,
                    format!(
                        "Requesting additional evidence (pass {} of {})",
                        run.loop_count + 1,
                        loop_bound
                    ),
                    json!({ "missing_aspects": &verdict.missing_aspects }),
                )
                .await?;
        }

        cycle.qa = Some(verdict);
        Ok(signals)
    }

    async fn run_formatting(
        &self,
        run: &mut Run,
        cycle: &mut CycleState,
    ) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Formatting,
                "Formatting the response and verifying citations...",
                serde_json::Value::Null,
            )
            .await?;

        let notes = cycle
            .qa
            .as_ref()
            .map(|v| v.improvement_notes.clone())
            .unwrap_or_default();
        if !notes.is_empty() && !run.answer.is_empty() {
            let prompt = StagePrompts::build_reformat_prompt(&run.query, &run.answer, &notes);
            match self.generator.generate(&prompt).await {
                Ok(text) if !text.trim().is_empty() => run.answer = text,
                Ok(_) => {}
                Err(e) => tracing::warn!("reformat failed ({}), keeping the draft", e),
            }
        }

        run.citations = citations::retained_citations(&run.answer, &cycle.evidence);
        if !run.citations.is_empty() && !run.answer.contains("## Sources") {
            run.answer = format!(
                "{}\n\n{}",
                run.answer.trim_end(),
                citations::sources_section(&run.citations)
            );
        }

        self.status
            .append(
                &run.run_id,
                Stage::Formatting,
                format!("Formatting complete, {} citations retained", run.citations.len()),
                json!({ "citation_count": run.citations.len() }),
            )
            .await?;

        Ok(TransitionSignals {
            has_title: run.title.is_some(),
            ..TransitionSignals::default()
        })
    }

    async fn run_titling(&self, run: &mut Run) -> Result<TransitionSignals> {
        self.status
            .append(
                &run.run_id,
                Stage::Titling,
                "Generating conversation title...",
                serde_json::Value::Null,
            )
            .await?;

        let prompt = StagePrompts::build_title_prompt(&run.query, &run.answer);
        let title = match self.generator.generate(&prompt).await {
            Ok(raw) => StagePrompts::clean_title(&raw, &run.query),
            Err(e) => {
                tracing::warn!("title generation failed ({}), using the query", e);
                StagePrompts::clean_title("", &run.query)
            }
        };

        self.status
            .append(
                &run.run_id,
                Stage::Titling,
                format!("Title generated: {}", title),
                json!({ "title": &title }),
            )
            .await?;

        run.title = Some(title);
        Ok(TransitionSignals::default())
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    async fn complete(&self, run: &mut Run, cycle: &CycleState) {
        run.ended_at = Some(chrono::Utc::now());
        let result = self
            .status
            .append(
                &run.run_id,
                Stage::Done,
                "Response ready",
                json!({
                    "answer_chars": run.answer.len(),
                    "citation_count": run.citations.len(),
                    "title": &run.title,
                    "loop_count": run.loop_count,
                    "evidence_count": cycle.evidence.len(),
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("failed to record completion event for {}: {}", run.run_id, e);
        }
    }

    async fn fail(&self, run: &mut Run, reason: &str) {
        tracing::error!("run {} failed: {}", run.run_id, reason);
        run.stage = Stage::Failed;
        run.error_message = Some(reason.to_string());
        run.ended_at = Some(chrono::Utc::now());

        let result = self
            .status
            .append(
                &run.run_id,
                Stage::Failed,
                format!("Run failed: {}", reason),
                json!({ "error": reason }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("failed to record failure event for {}: {}", run.run_id, e);
        }
        if let Err(e) = self.store.save_run(run) {
            tracing::warn!("failed to persist failed run {}: {}", run.run_id, e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scout_providers::{RawSearchItem, RawSearchResponse, SearchBackend, SearchConfig};
    use scout_types::StatusEvent;
    use tempfile::{tempdir, TempDir};

    // ------------------------------------------------------------------
    // Scripted collaborators
    // ------------------------------------------------------------------

    struct ScriptedGenerator {
        queries: Vec<String>,
        qa_needs_more: bool,
        answer: String,
        fail_synthesis: bool,
    }

    impl ScriptedGenerator {
        fn satisfied() -> Self {
            Self {
                queries: vec!["alpha".into(), "beta".into(), "gamma".into()],
                qa_needs_more: false,
                answer: "Summary grounded in [1] and [2].".to_string(),
                fail_synthesis: false,
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            if prompt.starts_with("You are a research planning agent") {
                Ok(json!({ "queries": &self.queries, "rationale": "coverage" }).to_string())
            } else if prompt.starts_with("You are a quality assurance agent") {
                Ok(json!({
                    "needs_more_evidence": self.qa_needs_more,
                    "quality_score": 0.8,
                    "missing_aspects": ["depth"],
                    "refined_query": "alpha details",
                    "improvement_notes": []
                })
                .to_string())
            } else if prompt.starts_with("You are a title generation agent") {
                Ok("Scripted Test Title".to_string())
            } else if prompt.starts_with("You are a response formatter") {
                Ok(self.answer.clone())
            } else if prompt.starts_with("Answer the user's question comprehensively") {
                if self.fail_synthesis {
                    anyhow::bail!("generation backend exploded");
                }
                Ok(self.answer.clone())
            } else {
                // Context (low-evidence) synthesis.
                Ok("Best-effort answer from conversation context.".to_string())
            }
        }
    }

    struct StaticBackend {
        per_query: usize,
    }

    #[async_trait]
    impl SearchBackend for StaticBackend {
        async fn search(&self, query: &str, _max_urls: usize) -> anyhow::Result<RawSearchResponse> {
            let results = (0..self.per_query)
                .map(|i| RawSearchItem {
                    url: format!("https://example.com/{}/{}", query, i),
                    title: Some(format!("{} source {}", query, i)),
                    markdown: Some(
                        format!("Detailed findings about {} section {}. ", query, i).repeat(40),
                    ),
                    ..Default::default()
                })
                .collect();
            Ok(RawSearchResponse { results })
        }
    }

    struct PartiallyFailingBackend {
        bad_query: String,
    }

    #[async_trait]
    impl SearchBackend for PartiallyFailingBackend {
        async fn search(&self, query: &str, _max_urls: usize) -> anyhow::Result<RawSearchResponse> {
            if query == self.bad_query {
                anyhow::bail!("backend unavailable for this query");
            }
            Ok(RawSearchResponse {
                results: vec![RawSearchItem {
                    url: format!("https://example.com/{}", query),
                    title: Some(query.to_string()),
                    markdown: Some(format!("Reliable content about {}. ", query).repeat(60)),
                    ..Default::default()
                }],
            })
        }
    }

    struct EmptyBackend;

    #[async_trait]
    impl SearchBackend for EmptyBackend {
        async fn search(
            &self,
            _query: &str,
            _max_urls: usize,
        ) -> anyhow::Result<RawSearchResponse> {
            Ok(RawSearchResponse::default())
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        _temp: TempDir,
        status: Arc<StatusLog>,
        registry: Arc<RunRegistry>,
    }

    fn build_engine(
        backend: Arc<dyn SearchBackend>,
        generator: Arc<dyn Generator>,
    ) -> (PipelineEngine, Harness) {
        build_engine_with(backend, generator, PipelineConfig::default())
    }

    fn build_engine_with(
        backend: Arc<dyn SearchBackend>,
        generator: Arc<dyn Generator>,
        mut config: PipelineConfig,
    ) -> (PipelineEngine, Harness) {
        config.search = SearchConfig {
            retry_attempts: 1,
            backoff_base_ms: 1,
            jitter_ms: 1,
            ..config.search
        };
        let temp = tempdir().unwrap();
        let store = Arc::new(RunStore::new(temp.path()).unwrap());
        let status = Arc::new(StatusLog::new(store.clone()));
        let registry = Arc::new(RunRegistry::new());
        let client = EvidenceClient::new(backend, config.search.clone());
        let engine = PipelineEngine::new(
            config,
            generator,
            client,
            status.clone(),
            store,
            registry.clone(),
            CancellationToken::new(),
        );
        (
            engine,
            Harness {
                _temp: temp,
                status,
                registry,
            },
        )
    }

    fn stage_messages(events: &[StatusEvent], needle: &str) -> usize {
        events.iter().filter(|e| e.message.contains(needle)).count()
    }

    // ------------------------------------------------------------------
    // Transition function
    // ------------------------------------------------------------------

    #[test]
    fn fast_mode_never_takes_the_loop_edge() {
        let wants_more = TransitionSignals {
            qa_needs_more: true,
            draft_long_enough: true,
            has_title: false,
        };
        assert_eq!(
            next_stage(Stage::Qa, Mode::Fast, 0, 0, wants_more),
            Stage::Formatting
        );
    }

    #[test]
    fn thorough_mode_loops_until_the_bound() {
        let wants_more = TransitionSignals {
            qa_needs_more: true,
            draft_long_enough: true,
            has_title: false,
        };
        assert_eq!(
            next_stage(Stage::Qa, Mode::Thorough, 0, 2, wants_more),
            Stage::Thinking
        );
        assert_eq!(
            next_stage(Stage::Qa, Mode::Thorough, 1, 2, wants_more),
            Stage::Thinking
        );
        assert_eq!(
            next_stage(Stage::Qa, Mode::Thorough, 2, 2, wants_more),
            Stage::Formatting
        );
    }

    #[test]
    fn short_draft_prefers_the_loop_edge_in_thorough_mode() {
        let short_draft = TransitionSignals {
            qa_needs_more: false,
            draft_long_enough: false,
            has_title: false,
        };
        assert_eq!(
            next_stage(Stage::Qa, Mode::Thorough, 0, 2, short_draft),
            Stage::Thinking
        );
    }

    #[test]
    fn formatting_skips_titling_when_a_title_exists() {
        let titled = TransitionSignals {
            has_title: true,
            ..Default::default()
        };
        assert_eq!(
            next_stage(Stage::Formatting, Mode::Fast, 0, 0, titled),
            Stage::Done
        );
        assert_eq!(
            next_stage(Stage::Formatting, Mode::Fast, 0, 0, TransitionSignals::default()),
            Stage::Titling
        );
    }

    #[test]
    fn main_path_edges_are_unconditional() {
        let s = TransitionSignals::default();
        assert_eq!(next_stage(Stage::Thinking, Mode::Fast, 0, 0, s), Stage::Searching);
        assert_eq!(next_stage(Stage::Searching, Mode::Fast, 0, 0, s), Stage::Distilling);
        assert_eq!(
            next_stage(Stage::Distilling, Mode::Fast, 0, 0, s),
            Stage::Synthesizing
        );
        assert_eq!(next_stage(Stage::Synthesizing, Mode::Fast, 0, 0, s), Stage::Qa);
        assert_eq!(next_stage(Stage::Titling, Mode::Fast, 0, 0, s), Stage::Done);
    }

    // ------------------------------------------------------------------
    // End-to-end engine behavior
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn fast_run_completes_without_looping() {
        let generator = Arc::new(ScriptedGenerator {
            qa_needs_more: true,
            ..ScriptedGenerator::satisfied()
        });
        let (engine, harness) =
            build_engine(Arc::new(StaticBackend { per_query: 2 }), generator);

        let run = Run::new("run_fast".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        assert_eq!(run.loop_count, 0);
        let events = harness.status.read_all("run_fast").unwrap();
        assert_eq!(stage_messages(&events, "Analyzing the query"), 1);
        assert!(!harness.registry.is_active("run_fast").await);
    }

    #[tokio::test]
    async fn thorough_run_takes_the_loop_edge_at_most_twice() {
        let generator = Arc::new(ScriptedGenerator {
            qa_needs_more: true,
            ..ScriptedGenerator::satisfied()
        });
        let (engine, harness) =
            build_engine(Arc::new(StaticBackend { per_query: 2 }), generator);

        let run = Run::new("run_deep".into(), "rust async design".into(), Mode::Thorough);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        assert_eq!(run.loop_count, 2);
        let events = harness.status.read_all("run_deep").unwrap();
        // Initial pass plus two loop-backs.
        assert_eq!(stage_messages(&events, "Analyzing the query"), 3);
        assert_eq!(stage_messages(&events, "Requesting additional evidence"), 2);
    }

    #[tokio::test]
    async fn event_sequence_is_gapless_across_a_whole_run() {
        let (engine, harness) = build_engine(
            Arc::new(StaticBackend { per_query: 2 }),
            Arc::new(ScriptedGenerator::satisfied()),
        );

        let run = Run::new("run_seq".into(), "rust async design".into(), Mode::Fast);
        engine.execute(run, &[]).await;

        let events = harness.status.read_all("run_seq").unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (1..=events.len() as u64).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn partial_backend_failure_still_reaches_done() {
        let generator = Arc::new(ScriptedGenerator::satisfied());
        let backend = Arc::new(PartiallyFailingBackend {
            bad_query: "beta".to_string(),
        });
        let (engine, harness) = build_engine(backend, generator);

        let run = Run::new("run_partial".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        assert!(!run.answer.is_empty());
        let events = harness.status.read_all("run_partial").unwrap();
        assert!(events.iter().any(|e| e.stage == Stage::Distilling));
        let search_summary = events
            .iter()
            .find(|e| e.message.starts_with("Found"))
            .unwrap();
        assert_eq!(search_summary.payload["empty_queries"][0], "beta");
    }

    #[tokio::test]
    async fn citations_contain_only_referenced_evidence() {
        let generator = Arc::new(ScriptedGenerator {
            queries: vec!["single".into()],
            answer: "First claim [2]. Second claim [4].".to_string(),
            ..ScriptedGenerator::satisfied()
        });
        let (engine, _harness) =
            build_engine(Arc::new(StaticBackend { per_query: 5 }), generator);

        let run = Run::new("run_cite".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        let indices: Vec<usize> = run.citations.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![2, 4]);
        assert!(run.citations[0].url.ends_with("/1"));
        assert!(run.citations[1].url.ends_with("/3"));
        assert!(run.answer.contains("## Sources"));
    }

    #[tokio::test]
    async fn cancellation_between_stages_fails_the_run() {
        let (engine, harness) = build_engine(
            Arc::new(StaticBackend { per_query: 2 }),
            Arc::new(ScriptedGenerator::satisfied()),
        );
        engine.cancel.cancel();

        let run = Run::new("run_cancel".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Failed);
        assert!(run.error_message.as_deref().unwrap().contains("cancelled"));
        let events = harness.status.read_all("run_cancel").unwrap();
        assert_eq!(events.last().unwrap().stage, Stage::Failed);
    }

    #[tokio::test]
    async fn unrecoverable_synthesis_failure_marks_the_run_failed() {
        let generator = Arc::new(ScriptedGenerator {
            fail_synthesis: true,
            ..ScriptedGenerator::satisfied()
        });
        let (engine, harness) =
            build_engine(Arc::new(StaticBackend { per_query: 2 }), generator);

        let run = Run::new("run_fatal".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Failed);
        assert!(run
            .error_message
            .as_deref()
            .unwrap()
            .contains("generation backend exploded"));
        let events = harness.status.read_all("run_fatal").unwrap();
        assert!(events
            .iter()
            .any(|e| e.stage == Stage::Failed && e.payload["error"].is_string()));
        assert!(!harness.registry.is_active("run_fatal").await);
    }

    #[tokio::test]
    async fn total_evidence_failure_fails_soft() {
        let (engine, _harness) = build_engine(
            Arc::new(EmptyBackend),
            Arc::new(ScriptedGenerator::satisfied()),
        );

        let run = Run::new("run_soft".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        assert!(!run.answer.is_empty());
        assert!(run.citations.is_empty());
    }

    #[tokio::test]
    async fn existing_title_makes_titling_one_shot() {
        let (engine, harness) = build_engine(
            Arc::new(StaticBackend { per_query: 2 }),
            Arc::new(ScriptedGenerator::satisfied()),
        );

        let mut run = Run::new("run_titled".into(), "rust async design".into(), Mode::Fast);
        run.title = Some("Existing Conversation Title".to_string());
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.stage, Stage::Done);
        assert_eq!(run.title.as_deref(), Some("Existing Conversation Title"));
        let events = harness.status.read_all("run_titled").unwrap();
        assert!(events.iter().all(|e| e.stage != Stage::Titling));
    }

    #[tokio::test]
    async fn first_reply_generates_a_title() {
        let (engine, harness) = build_engine(
            Arc::new(StaticBackend { per_query: 2 }),
            Arc::new(ScriptedGenerator::satisfied()),
        );

        let run = Run::new("run_untitled".into(), "rust async design".into(), Mode::Fast);
        let run = engine.execute(run, &[]).await;

        assert_eq!(run.title.as_deref(), Some("Scripted Test Title"));
        let events = harness.status.read_all("run_untitled").unwrap();
        assert!(events.iter().any(|e| e.stage == Stage::Titling));
    }
}
