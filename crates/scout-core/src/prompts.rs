// Stage Prompt Templates
// Prompt builders and output parsers for the generation-backed stages

use scout_types::{Mode, QaVerdict, ScoredEvidence, ThinkPlan};

/// Prompt builder for the pipeline stages.
pub struct StagePrompts;

impl StagePrompts {
    /// Build prompt for the thinking stage.
    pub fn build_thinking_prompt(
        query: &str,
        mode: Mode,
        min_queries: usize,
        max_queries: usize,
        history: &[scout_types::ChatTurn],
        feedback: Option<&QaVerdict>,
    ) -> String {
        let conversation = if history.is_empty() {
            "No previous conversation".to_string()
        } else {
            history
                .iter()
                .rev()
                .take(6)
                .rev()
                .map(|turn| format!("{}: {}", turn.role, turn.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let feedback_section = feedback
            .map(|verdict| {
                let aspects = if verdict.missing_aspects.is_empty() {
                    "none listed".to_string()
                } else {
                    verdict.missing_aspects.join("; ")
                };
                let refined = verdict.refined_query.as_deref().unwrap_or("none");
                format!(
                    "\n## Previous Pass Critique\nMissing aspects: {}\nRefined query suggestion: {}\nTarget these gaps with the new queries.\n",
                    aspects, refined
                )
            })
            .unwrap_or_default();

        format!(
            r#"You are a research planning agent.

Analyze the user's query in the context of the conversation and plan diverse web search queries that together cover it comprehensively.

## Conversation History
{conversation}

## User Query
{query}

## Mode
{mode}
{feedback_section}
## Output Format
Respond with ONLY a JSON object:
{{
  "queries": ["query 1", "query 2", ...],
  "rationale": "why these queries cover the question"
}}

## Rules
- Produce {min_queries} to {max_queries} queries.
- Vary terminology, angle and specificity: overview, mechanisms, comparisons, recent developments, criticisms.
- Mix broad and narrow queries; avoid near-duplicates."#,
            conversation = conversation,
            query = query,
            mode = mode.as_str(),
            feedback_section = feedback_section,
            min_queries = min_queries,
            max_queries = max_queries,
        )
    }

    /// Build prompt for evidence-grounded synthesis.
    pub fn build_synthesis_prompt(query: &str, evidence: &[ScoredEvidence]) -> String {
        let sources = evidence
            .iter()
            .enumerate()
            .map(|(i, e)| format!("[^{}] {}\n{}\n{}", i + 1, e.title, e.url, e.excerpt))
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            r#"Answer the user's question comprehensively using ONLY the provided sources.

Your response must be detailed, well-structured and self-contained. Provide the full answer immediately; do not ask what the user wants next. Cite claims with [^n] markers referring to the numbered sources. If something is uncertain, say so clearly.

Question: {query}

Sources (each starts with its [^n] marker):
{sources}"#,
            query = query,
            sources = sources,
        )
    }

    /// Build prompt for best-effort synthesis when evidence is insufficient.
    pub fn build_context_synthesis_prompt(
        query: &str,
        history: &[scout_types::ChatTurn],
    ) -> String {
        let context = if history.is_empty() {
            "No previous conversation".to_string()
        } else {
            history
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|turn| format!("{}: {}", turn.role, turn.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"Answer the user's question using the conversation context provided.

Little or no web evidence is available for this question, so answer from the context and general knowledge, and state clearly what remains uncertain. Provide a complete answer; do not ask follow-up questions.

Current question: {query}

Conversation context:
{context}"#,
            query = query,
            context = context,
        )
    }

    /// Build prompt for the QA critique.
    pub fn build_qa_prompt(
        query: &str,
        answer: &str,
        mode: Mode,
        source_count: usize,
        word_count: usize,
        min_words: usize,
    ) -> String {
        let length_rule = match mode {
            Mode::Thorough => format!(
                "- The response MUST be at least {} words; it currently has {} words.\n- Request more evidence only when reformatting cannot fix the gap.",
                min_words, word_count
            ),
            Mode::Fast => {
                "- Prefer reformatting; never request additional evidence in fast mode.".to_string()
            }
        };

        format!(
            r#"You are a quality assurance agent evaluating a research answer.

User Query: {query}
Mode: {mode}
Available Sources: {source_count}

Current Response:
{answer}

Evaluate completeness, depth, structure, accuracy and citations, then respond with ONLY a JSON object:
{{
  "needs_more_evidence": true/false,
  "quality_score": 0.0-1.0,
  "missing_aspects": ["aspect", ...],
  "refined_query": "query for additional evidence, or null",
  "improvement_notes": ["formatting or structure suggestion", ...]
}}

Rules:
{length_rule}
- Set needs_more_evidence=true only for gaps that require new information."#,
            query = query,
            mode = mode.as_str(),
            source_count = source_count,
            answer = answer,
            length_rule = length_rule,
        )
    }

    /// Build prompt for the reformat pass.
    pub fn build_reformat_prompt(query: &str, answer: &str, notes: &[String]) -> String {
        format!(
            r#"You are a response formatter improving the structure and presentation of an answer.

Reorganize the response below so it directly and professionally answers the user's query: clear sections, logical flow, readable formatting. Keep every fact and every citation marker exactly as written.

User Query: {query}

Current Response:
{answer}

Improvement Suggestions: {notes}

Return only the improved response."#,
            query = query,
            answer = answer,
            notes = if notes.is_empty() {
                "none".to_string()
            } else {
                notes.join("; ")
            },
        )
    }

    /// Build prompt for the title stage.
    pub fn build_title_prompt(query: &str, answer: &str) -> String {
        let preview: String = answer.chars().take(2000).collect();
        format!(
            r#"You are a title generation agent. Create a concise, descriptive title (3-8 words) for a conversation, capturing its main subject. Avoid generic words like "Question" or "Query".

User's Query: {query}

Assistant's Response: {preview}

Respond with just the title, no quotes or extra text."#,
            query = query,
            preview = preview,
        )
    }

    /// Parse the thinking output. Falls back to a single query equal to the
    /// user's message when the output cannot be parsed, and clamps the query
    /// count to the mode's maximum.
    pub fn parse_think_plan(output: &str, fallback_query: &str, max_queries: usize) -> ThinkPlan {
        #[derive(serde::Deserialize)]
        struct RawPlan {
            #[serde(alias = "search_queries")]
            queries: Vec<String>,
            #[serde(default, alias = "reasoning")]
            rationale: String,
        }

        let parsed = serde_json::from_str::<RawPlan>(strip_code_fences(output)).ok();
        let mut plan = match parsed {
            Some(raw) => ThinkPlan {
                queries: raw
                    .queries
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect(),
                rationale: raw.rationale,
            },
            None => {
                tracing::warn!("thinking output was not valid JSON, falling back to direct search");
                ThinkPlan {
                    queries: Vec::new(),
                    rationale: "planner output unparseable, searching the query directly"
                        .to_string(),
                }
            }
        };

        if plan.queries.is_empty() {
            plan.queries = vec![fallback_query.to_string()];
        } else if plan.queries.len() > max_queries {
            tracing::warn!(
                "too many queries planned ({}), keeping the first {}",
                plan.queries.len(),
                max_queries
            );
            plan.queries.truncate(max_queries);
        }
        plan
    }

    /// Parse the QA critique. Unparseable output degrades to an accepting
    /// verdict rather than failing the run.
    pub fn parse_qa_verdict(output: &str) -> QaVerdict {
        #[derive(serde::Deserialize)]
        struct RawVerdict {
            #[serde(alias = "needs_more_data")]
            needs_more_evidence: bool,
            #[serde(default)]
            quality_score: f64,
            #[serde(default)]
            missing_aspects: Vec<String>,
            #[serde(default)]
            refined_query: Option<String>,
            #[serde(default, alias = "improvement_suggestions")]
            improvement_notes: Vec<String>,
        }

        match serde_json::from_str::<RawVerdict>(strip_code_fences(output)) {
            Ok(raw) => QaVerdict {
                needs_more_evidence: raw.needs_more_evidence,
                quality_score: raw.quality_score.clamp(0.0, 1.0),
                missing_aspects: raw.missing_aspects,
                refined_query: raw.refined_query.filter(|q| !q.trim().is_empty()),
                improvement_notes: raw.improvement_notes,
            },
            Err(e) => {
                tracing::warn!("QA output was not valid JSON ({}), accepting the draft", e);
                QaVerdict::satisfied()
            }
        }
    }

    /// Normalize a generated title: strip quotes and whitespace, cap length.
    pub fn clean_title(raw: &str, fallback_query: &str) -> String {
        let title = raw
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let title = if title.is_empty() {
            fallback_query.to_string()
        } else {
            title
        };
        if title.chars().count() > 60 {
            let truncated: String = title.chars().take(57).collect();
            format!("{}...", truncated)
        } else {
            title
        }
    }
}

/// Strip a surrounding markdown code fence, if any.
fn strip_code_fences(output: &str) -> &str {
    let trimmed = output.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fenced_think_plan() {
        let output = format!(
            "```json\n{}\n```",
            json!({"queries": ["a", "b"], "rationale": "coverage"})
        );
        let plan = StagePrompts::parse_think_plan(&output, "fallback", 5);
        assert_eq!(plan.queries, vec!["a", "b"]);
        assert_eq!(plan.rationale, "coverage");
    }

    #[test]
    fn think_plan_accepts_alternate_field_names() {
        let output = json!({"search_queries": ["x"], "reasoning": "r"}).to_string();
        let plan = StagePrompts::parse_think_plan(&output, "fallback", 5);
        assert_eq!(plan.queries, vec!["x"]);
        assert_eq!(plan.rationale, "r");
    }

    #[test]
    fn unparseable_plan_falls_back_to_the_user_query() {
        let plan = StagePrompts::parse_think_plan("not json at all", "the user query", 5);
        assert_eq!(plan.queries, vec!["the user query"]);
    }

    #[test]
    fn plan_is_clamped_to_the_mode_maximum() {
        let queries: Vec<String> = (0..12).map(|i| format!("q{}", i)).collect();
        let output = json!({"queries": queries}).to_string();
        let plan = StagePrompts::parse_think_plan(&output, "fallback", 5);
        assert_eq!(plan.queries.len(), 5);
    }

    #[test]
    fn unparseable_qa_verdict_accepts_the_draft() {
        let verdict = StagePrompts::parse_qa_verdict("garbage");
        assert!(!verdict.needs_more_evidence);
    }

    #[test]
    fn qa_verdict_accepts_alternate_field_names() {
        let output = json!({
            "needs_more_data": true,
            "quality_score": 0.4,
            "improvement_suggestions": ["tighter structure"]
        })
        .to_string();
        let verdict = StagePrompts::parse_qa_verdict(&output);
        assert!(verdict.needs_more_evidence);
        assert_eq!(verdict.improvement_notes, vec!["tighter structure"]);
    }

    #[test]
    fn titles_are_cleaned_and_capped() {
        assert_eq!(
            StagePrompts::clean_title("  \"Rust   Engine Design\" ", "fallback"),
            "Rust Engine Design"
        );
        let long = "word ".repeat(30);
        let cleaned = StagePrompts::clean_title(&long, "fallback");
        assert!(cleaned.chars().count() <= 60);
        assert!(cleaned.ends_with("..."));
        assert_eq!(StagePrompts::clean_title("", "fallback"), "fallback");
    }
}
