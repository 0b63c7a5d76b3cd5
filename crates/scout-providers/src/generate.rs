// Text Generation Capability
// Opaque "generate text given a prompt" boundary used by the pipeline stages

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Text-generation capability consumed by the thinking, synthesis, QA,
/// formatting and titling stages. May be slow or return malformed text;
/// callers apply stage-level fail-soft handling.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat-completions generator.
pub struct HttpGenerator {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("generation request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = extract_text(&value) {
            return Ok(text);
        }
        anyhow::bail!(
            "generator returned no completion content for model `{}`",
            self.model
        );
    }
}

fn extract_text(value: &serde_json::Value) -> Option<String> {
    let content = value
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()?;
    if content.trim().is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown provider error");
    Some(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_text_reads_first_choice() {
        let value = json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(extract_text(&value).as_deref(), Some("hello"));
    }

    #[test]
    fn extract_text_rejects_empty_content() {
        let value = json!({
            "choices": [{"message": {"content": "   "}}]
        });
        assert!(extract_text(&value).is_none());
    }

    #[test]
    fn extract_error_reads_message() {
        let value = json!({"error": {"message": "rate limited"}});
        assert_eq!(extract_error(&value).as_deref(), Some("rate limited"));
    }
}
