// Evidence Distiller
// Scores, filters, truncates and ranks raw evidence into a bounded set

use scout_types::{EvidenceItem, ScoredEvidence};

/// Fixed composition weights. The scoring functions themselves are pluggable;
/// the weighting is part of the distillation contract.
pub const RELEVANCE_WEIGHT: f64 = 0.7;
pub const QUALITY_WEIGHT: f64 = 0.3;

pub type RelevanceFn = dyn Fn(&EvidenceItem, &str) -> f64 + Send + Sync;
pub type QualityFn = dyn Fn(&EvidenceItem) -> f64 + Send + Sync;

/// Deterministic evidence ranking: given identical inputs, identical output.
pub struct Distiller {
    relevance: Box<RelevanceFn>,
    quality: Box<QualityFn>,
    evidence_cap: usize,
    excerpt_cap: usize,
    low_evidence_chars: usize,
}

impl Distiller {
    pub fn new(
        relevance: Box<RelevanceFn>,
        quality: Box<QualityFn>,
        evidence_cap: usize,
        excerpt_cap: usize,
        low_evidence_chars: usize,
    ) -> Self {
        Self {
            relevance,
            quality,
            evidence_cap,
            excerpt_cap,
            low_evidence_chars,
        }
    }

    /// Distiller with the stock keyword-overlap and domain-tier scorers.
    pub fn with_default_scorers(
        evidence_cap: usize,
        excerpt_cap: usize,
        low_evidence_chars: usize,
    ) -> Self {
        Self::new(
            Box::new(keyword_relevance),
            Box::new(domain_quality),
            evidence_cap,
            excerpt_cap,
            low_evidence_chars,
        )
    }

    /// Score and rank evidence against the query context. Output is sorted by
    /// descending combined score, ties preserve input order, length is capped.
    /// Truncation applies to the carried excerpt only, never to scoring input.
    pub fn distill(&self, items: &[EvidenceItem], query_context: &str) -> Vec<ScoredEvidence> {
        let mut scored: Vec<ScoredEvidence> = items
            .iter()
            .filter(|item| item.fetched_ok && !item.content.trim().is_empty())
            .map(|item| {
                let score = RELEVANCE_WEIGHT * (self.relevance)(item, query_context)
                    + QUALITY_WEIGHT * (self.quality)(item);
                ScoredEvidence {
                    url: item.url.clone(),
                    title: item.title.clone(),
                    excerpt: truncate_chars(&item.content, self.excerpt_cap),
                    score,
                }
            })
            .collect();

        // Vec::sort_by is stable, so equal scores keep original fetch order.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.evidence_cap);
        scored
    }

    /// Low evidence is a signal for fail-soft synthesis, not an error.
    pub fn is_low_evidence(&self, evidence: &[ScoredEvidence]) -> bool {
        let total_chars: usize = evidence.iter().map(|e| e.excerpt.len()).sum();
        evidence.is_empty() || total_chars < self.low_evidence_chars
    }
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        text.chars().take(cap).collect()
    }
}

// ============================================================================
// Default Scorers
// ============================================================================

/// Keyword-overlap relevance: share of content words that appear in the query.
pub fn keyword_relevance(item: &EvidenceItem, query: &str) -> f64 {
    let query_words: std::collections::HashSet<String> = tokenize(query)
        .into_iter()
        .filter(|w| w.len() > 2)
        .collect();
    let content_words = tokenize(&item.content);
    if query_words.is_empty() || content_words.is_empty() {
        return 0.0;
    }
    let hits = content_words
        .iter()
        .filter(|w| query_words.contains(*w))
        .count();
    hits as f64 / content_words.len().max(1) as f64
}

const OFFICIAL_MARKERS: &[&str] = &[
    "docs.",
    "developer.",
    "learn.",
    "support.",
    "help.",
    "wikipedia.org",
    "arxiv.org",
    "who.int",
    "nih.gov",
];

const COMMUNITY_MARKERS: &[&str] = &[
    "reddit.com",
    "quora.com",
    "stackoverflow.com",
    "medium.com",
];

/// Domain-tier source quality in [0, 1].
pub fn domain_quality(item: &EvidenceItem) -> f64 {
    let url = item.url.to_lowercase();
    if OFFICIAL_MARKERS.iter().any(|m| url.contains(m)) {
        return 1.0;
    }
    if COMMUNITY_MARKERS.iter().any(|m| url.contains(m)) {
        return 0.6;
    }
    0.8
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
