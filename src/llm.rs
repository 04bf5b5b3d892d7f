//! Default OpenAI-compatible text generator.
//!
//! The host may supply its own [`TextGenerator`]; this client covers the
//! common case of an OpenAI-style `/chat/completions` endpoint (Ollama,
//! LM Studio, vLLM, OpenAI). Purposes route to the configured status or
//! summary model, falling back to the primary model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;
use crate::error::ChroniclerError;
use crate::host::{LlmMessage, Purpose, TextGenerator};

pub struct LlmClient {
    settings: LlmSettings,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn model_for(&self, purpose: Purpose) -> &str {
        let fallback = self.settings.model.as_str();
        match purpose {
            Purpose::Chat => fallback,
            Purpose::Status => self.settings.status_model.as_deref().unwrap_or(fallback),
            Purpose::Summary => self.settings.summary_model.as_deref().unwrap_or(fallback),
        }
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, messages: &[LlmMessage], purpose: Purpose) -> Result<String> {
        let url = format!("{}/chat/completions", self.settings.api_url);
        let request = ChatCompletionRequest {
            model: self.model_for(purpose),
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: Some(0.7),
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = self.settings.api_key.as_deref() {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {key}"));
            }
        }

        let response = req.send().await.context("failed to send model request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            return Err(ChroniclerError::TransientApi(format!("{status}: {body}")).into());
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("failed to parse model response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("model returned no choices"))
    }
}

/// Best-effort extraction of a JSON payload from model output: strip a
/// trailing reasoning block, then try a ```json fence, then the outermost
/// brace or bracket window, else return the input unchanged.
pub fn extract_json(raw: &str) -> &str {
    let cleaned = match raw.rfind("</think>") {
        Some(end) => raw[end + 8..].trim(),
        None => raw.trim(),
    };

    if let Some(start) = cleaned.find("```json") {
        let after = &cleaned[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    let object = window(cleaned, '{', '}');
    let array = window(cleaned, '[', ']');
    match (object, array) {
        (Some(o), Some(a)) => {
            // Prefer whichever opens first.
            if cleaned.find('[').unwrap_or(usize::MAX) < cleaned.find('{').unwrap_or(usize::MAX) {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => cleaned,
    }
}

fn window(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_code_fence() {
        let raw = "Sure!\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn extracts_brace_window() {
        let raw = "Here you go: {\"a\": 1} hope that helps";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn extracts_array_when_it_opens_first() {
        let raw = "[{\"summary\": \"x\"}] trailing";
        assert_eq!(extract_json(raw), "[{\"summary\": \"x\"}]");
    }

    #[test]
    fn strips_reasoning_block() {
        let raw = "<think>internal</think>\n{\"a\": 1}";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn status_purpose_routes_to_status_model() {
        let client = LlmClient::new(LlmSettings {
            model: "main".to_string(),
            status_model: Some("small".to_string()),
            ..LlmSettings::default()
        });
        assert_eq!(client.model_for(Purpose::Status), "small");
        assert_eq!(client.model_for(Purpose::Summary), "main");
        assert_eq!(client.model_for(Purpose::Chat), "main");
    }
}
