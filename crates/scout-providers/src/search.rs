// Remote Search Backend
// Wire types, content decode strategies, and the HTTP backend implementation

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use scout_types::EvidenceItem;

// ============================================================================
// Wire Types
// ============================================================================

/// One raw result item as returned by the search backend. The content may
/// arrive base64-encoded or as plain text under an alternate field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSearchItem {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_b64_md: Option<String>,
    #[serde(default)]
    pub markdown_content: Option<String>,
    #[serde(default)]
    pub markdown: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSearchResponse {
    #[serde(default)]
    pub results: Vec<RawSearchItem>,
}

/// Remote search/fetch capability: given a query, returns raw evidence items
/// or fails. The backend performs its own internal URL fan-out, so this is
/// one logical call per query.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_urls: usize) -> anyhow::Result<RawSearchResponse>;
}

// ============================================================================
// Content Decode Strategies
// ============================================================================

type DecodeFn = fn(&RawSearchItem) -> Option<String>;

/// Ordered decode strategies tried in sequence. Each is total (never fails);
/// the first one yielding non-empty text wins.
const CONTENT_DECODERS: &[DecodeFn] = &[
    decode_b64_markdown,
    decode_markdown_content,
    decode_plain_markdown,
];

fn decode_b64_markdown(item: &RawSearchItem) -> Option<String> {
    let encoded = item.content_b64_md.as_deref()?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    non_empty(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_markdown_content(item: &RawSearchItem) -> Option<String> {
    non_empty(item.markdown_content.clone()?)
}

fn decode_plain_markdown(item: &RawSearchItem) -> Option<String> {
    non_empty(item.markdown.clone()?)
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Run the decode strategies over a raw item's content fields.
pub fn decode_content(item: &RawSearchItem) -> Option<String> {
    CONTENT_DECODERS.iter().find_map(|decode| decode(item))
}

/// Normalize a raw item into an [`EvidenceItem`], skipping items with no URL
/// or no decodable content.
pub fn normalize_item(item: &RawSearchItem) -> Option<EvidenceItem> {
    if item.url.trim().is_empty() {
        return None;
    }
    let content = decode_content(item)?;
    let title = item
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| title_from_content(&content, &item.url));
    Some(EvidenceItem {
        url: item.url.clone(),
        title,
        content,
        fetched_ok: true,
        fetched_at: Utc::now(),
    })
}

fn title_from_content(content: &str, url: &str) -> String {
    let first_line = content
        .lines()
        .map(|l| l.trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or(url);
    first_line.chars().take(100).collect()
}

/// Parse a backend payload that may be either a direct `{"results": [...]}`
/// object or a wrapped `{"statusCode": ..., "body": "<json string>"}` envelope.
pub fn parse_search_payload(value: serde_json::Value) -> RawSearchResponse {
    if let Some(body) = value.get("body").and_then(|b| b.as_str()) {
        if let Ok(inner) = serde_json::from_str::<RawSearchResponse>(body) {
            return inner;
        }
    }
    serde_json::from_value(value).unwrap_or_default()
}

// ============================================================================
// HTTP Backend
// ============================================================================

/// Search backend reached over HTTP: POSTs `{query, max_urls}` and accepts
/// either payload envelope.
pub struct HttpSearchBackend {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSearchBackend {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, max_urls: usize) -> anyhow::Result<RawSearchResponse> {
        let mut req = self.client.post(&self.endpoint).json(&json!({
            "query": query,
            "max_urls": max_urls,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("search backend returned status {}", status);
        }
        let value: serde_json::Value = response.json().await?;
        Ok(parse_search_payload(value))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn item(url: &str) -> RawSearchItem {
        RawSearchItem {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_base64_content_field() {
        let mut raw = item("https://example.com/a");
        raw.content_b64_md = Some(
            base64::engine::general_purpose::STANDARD.encode("# Heading\nbody text"),
        );
        let decoded = decode_content(&raw).unwrap();
        assert!(decoded.starts_with("# Heading"));
    }

    #[test]
    fn falls_back_to_plain_alternate_field() {
        let mut raw = item("https://example.com/a");
        raw.markdown_content = Some("plain body".to_string());
        assert_eq!(decode_content(&raw).as_deref(), Some("plain body"));
    }

    #[test]
    fn base64_field_wins_over_plain_fields() {
        let mut raw = item("https://example.com/a");
        raw.content_b64_md = Some(base64::engine::general_purpose::STANDARD.encode("from b64"));
        raw.markdown_content = Some("from plain".to_string());
        assert_eq!(decode_content(&raw).as_deref(), Some("from b64"));
    }

    #[test]
    fn invalid_base64_falls_through_to_next_strategy() {
        let mut raw = item("https://example.com/a");
        raw.content_b64_md = Some("!!!not base64!!!".to_string());
        raw.markdown = Some("recovered".to_string());
        assert_eq!(decode_content(&raw).as_deref(), Some("recovered"));
    }

    #[test]
    fn item_without_content_is_skipped() {
        let raw = item("https://example.com/a");
        assert!(normalize_item(&raw).is_none());
    }

    #[test]
    fn item_without_url_is_skipped() {
        let mut raw = item("");
        raw.markdown = Some("content".to_string());
        assert!(normalize_item(&raw).is_none());
    }

    #[test]
    fn title_falls_back_to_first_content_line() {
        let mut raw = item("https://example.com/a");
        raw.markdown = Some("## Rust in Production\n\nDetails follow.".to_string());
        let evidence = normalize_item(&raw).unwrap();
        assert_eq!(evidence.title, "Rust in Production");
    }

    #[test]
    fn parses_wrapped_body_envelope() {
        let inner = serde_json::json!({
            "results": [{"url": "https://example.com/a", "markdown": "text"}]
        });
        let wrapped = serde_json::json!({
            "statusCode": 200,
            "body": inner.to_string(),
        });
        let parsed = parse_search_payload(wrapped);
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].url, "https://example.com/a");
    }
}
