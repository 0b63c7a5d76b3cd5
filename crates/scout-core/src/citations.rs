// Citation Handling
// Parses [n] / [^n] markers and retains only citations the answer references

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use scout_types::{Citation, ScoredEvidence};

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\[\^?(\d+)\]").expect("citation marker regex"))
}

/// Distinct 1-based evidence indices referenced in the answer, ascending.
pub fn referenced_indices(answer: &str) -> Vec<usize> {
    let mut indices = BTreeSet::new();
    for capture in marker_regex().captures_iter(answer) {
        if let Ok(index) = capture[1].parse::<usize>() {
            if index > 0 {
                indices.insert(index);
            }
        }
    }
    indices.into_iter().collect()
}

/// Citations for markers that map to an evidence item actually present.
/// Unreferenced evidence is dropped even if it informed synthesis; markers
/// pointing outside the evidence set are ignored.
pub fn retained_citations(answer: &str, evidence: &[ScoredEvidence]) -> Vec<Citation> {
    referenced_indices(answer)
        .into_iter()
        .filter_map(|index| {
            evidence.get(index - 1).map(|e| Citation {
                index,
                url: e.url.clone(),
                title: e.title.clone(),
            })
        })
        .collect()
}

/// Numbered sources section appended to the final answer.
pub fn sources_section(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }
    let mut section = String::from("## Sources\n");
    for citation in citations {
        section.push_str(&format!(
            "\n[{}] {}\n- {}\n",
            citation.index, citation.title, citation.url
        ));
    }
    section
}
