use crate::core::error::StoryError;
use crate::utils::retry::{with_backoff, RetryPolicy};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_count as u32 + 1,
            base_delay_ms: self.retry_delay_seconds * 1000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

/// `chat` wrapped in the transient-failure backoff.
pub async fn chat_with_retry(
    llm: &dyn LlmClient,
    policy: &RetryPolicy,
    system: &str,
    user: &str,
) -> Result<String> {
    with_backoff(policy, "text generation", |_| llm.chat(system, user)).await
}

fn require_key(provider: &str, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(StoryError::Configuration(format!("{} api_key is empty", provider)).into());
    }
    Ok(())
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let cfg = config
                .gemini
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("Gemini config missing".into()))?;
            require_key("gemini", &cfg.api_key)?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &cfg.model)))
        }
        "ollama" => {
            let cfg = config
                .ollama
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("Ollama config missing".into()))?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        "openai" => {
            let cfg = config
                .openai
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("OpenAI config missing".into()))?;
            require_key("openai", &cfg.api_key)?;
            Ok(Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref())))
        }
        other => Err(StoryError::Configuration(format!("Unknown LLM provider: {}", other)).into()),
    }
}

pub(crate) async fn check_status(provider: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoryError::from_http(provider, status.as_u16(), &body).into())
}

pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() || err.is_connect() {
        StoryError::TransientService(format!("{}: {}", provider, err)).into()
    } else {
        anyhow!("{} request failed: {}", provider, err)
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn gemini_text(result: GeminiResponse) -> Result<String> {
    if let Some(err) = result.error {
        return Err(anyhow!("Gemini API returned error: {}", err.message));
    }
    if let Some(reason) = result.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(StoryError::ContentPolicy(format!("Gemini blocked prompt: {}", reason)).into());
    }

    let first = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| anyhow!("Gemini response had no candidates"))?;

    let text: String = first
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    if !text.is_empty() {
        return Ok(text);
    }

    let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
    match reason {
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => {
            Err(StoryError::ContentPolicy(format!("Gemini finish reason {}", reason)).into())
        }
        _ => Err(anyhow!("Gemini response empty. Finish reason: {}", reason)),
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport_error("gemini", e))?;
        let response_text = check_status("gemini", resp).await?.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text))?;
        gemini_text(result)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage { role: "system".to_string(), content: system.to_string() },
        ChatMessage { role: "user".to_string(), content: user.to_string() },
    ]
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: messages(system, user),
            stream: false,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport_error("ollama", e))?;
        let result: OllamaResponse = check_status("ollama", resp).await?.json().await?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: messages(system, user),
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;
        let result: OpenAIResponse = check_status("openai", resp).await?.json().await?;
        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("OpenAI response has no choices"))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(StoryError::ContentPolicy("OpenAI content filter".into()).into());
        }
        choice
            .message
            .content
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorClass;

    #[test]
    fn test_gemini_safety_block_is_content_policy() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = gemini_text(result).unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::ContentPolicy);
    }

    #[test]
    fn test_gemini_prompt_feedback_block() {
        let json = r#"{"promptFeedback": {"blockReason": "OTHER"}}"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = gemini_text(result).unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::ContentPolicy);
    }

    #[test]
    fn test_gemini_empty_content() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "role": "model" },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = gemini_text(result).unwrap_err();
        assert!(err.to_string().contains("STOP"));
    }

    #[test]
    fn test_gemini_joins_parts() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [ { "text": "Hello " }, { "text": "world" } ],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(gemini_text(result).unwrap(), "Hello world");
    }

    #[test]
    fn test_openai_response_parsing() {
        let json = r#"{
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "Once upon a time" },
                "finish_reason": "stop"
            }]
        }"#;
        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Once upon a time"));
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            retry_count: 0,
            retry_delay_seconds: 0,
            gemini: None,
            ollama: None,
            openai: Some(OpenAIConfig {
                api_key: " ".to_string(),
                model: "gpt-4o-mini".to_string(),
                base_url: None,
            }),
        };
        let err = create_llm(&config).unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::Configuration);

        let config = LlmConfig { provider: "gemini".into(), openai: None, ..config };
        assert_eq!(StoryError::classify(&create_llm(&config).unwrap_err()), ErrorClass::Configuration);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = LlmConfig {
            provider: "ollama".into(),
            retry_count: 2,
            retry_delay_seconds: 3,
            gemini: None,
            ollama: None,
            openai: None,
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 3000);
    }
}
