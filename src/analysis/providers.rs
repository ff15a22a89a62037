//! Provider adapters: the only code that knows a remote API's wire format.
//!
//! Both adapters plug into the same [`ThrottledTransport`](super::transport::ThrottledTransport),
//! which owns throttling, status classification and usage accounting.

use serde::{Deserialize, Serialize};

use super::types::{PromptEnvelope, TokenUsage};

/// Per-request generation parameters taken from the client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Wire dialect of one remote API.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the POST request: URL, credential header and JSON body.
    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        envelope: &PromptEnvelope,
        settings: &GenerationSettings,
    ) -> reqwest::RequestBuilder;

    /// Pull the first candidate's text and token usage out of a 2xx body.
    /// `Err` carries a description of what the envelope was missing.
    fn extract_reply(&self, body: &str) -> Result<(String, Option<TokenUsage>), String>;
}

// ──────────────────────────────────────────────
// OpenAI-compatible chat completions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCompatible;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ProviderAdapter for OpenAiCompatible {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        envelope: &PromptEnvelope,
        settings: &GenerationSettings,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &settings.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &envelope.system,
                },
                ChatMessage {
                    role: "user",
                    content: &envelope.user,
                },
            ],
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };
        client.post(url).bearer_auth(api_key).json(&body)
    }

    fn extract_reply(&self, body: &str) -> Result<(String, Option<TokenUsage>), String> {
        let parsed: ChatResponse =
            serde_json::from_str(body).map_err(|e| format!("response is not JSON: {e}"))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| "no choices in response".to_string())?
            .message
            .and_then(|m| m.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| "first choice has no text content".to_string())?;

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });

        Ok((text, usage))
    }
}

// ──────────────────────────────────────────────
// Google Gemini generateContent
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct Gemini;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: [GeminiContent<'a>; 1],
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [GeminiPart<'a>; 1],
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiReplyContent>,
}

#[derive(Deserialize)]
struct GeminiReplyContent {
    #[serde(default)]
    parts: Vec<GeminiReplyPart>,
}

#[derive(Deserialize)]
struct GeminiReplyPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl ProviderAdapter for Gemini {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        envelope: &PromptEnvelope,
        settings: &GenerationSettings,
    ) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            settings.model
        );
        let body = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: [GeminiPart {
                    text: &envelope.system,
                }],
            },
            contents: [GeminiContent {
                role: Some("user"),
                parts: [GeminiPart {
                    text: &envelope.user,
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: settings.temperature,
                max_output_tokens: settings.max_tokens,
            },
        };
        client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&body)
    }

    fn extract_reply(&self, body: &str) -> Result<(String, Option<TokenUsage>), String> {
        let parsed: GeminiResponse =
            serde_json::from_str(body).map_err(|e| format!("response is not JSON: {e}"))?;

        let content = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| "no candidates in response".to_string())?
            .content
            .ok_or_else(|| "first candidate has no content".to_string())?;

        let text: String = content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err("first candidate has no text parts".into());
        }

        let usage = parsed.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
        });

        Ok((text, usage))
    }
}
