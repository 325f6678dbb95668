use super::{mime_of, GeminiImageConfig, ImageClient, ReferenceImage};
use crate::core::error::StoryError;
use crate::services::llm::{check_status, transport_error};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct GeminiImageClient {
    config: GeminiImageConfig,
    client: reqwest::Client,
}

impl GeminiImageClient {
    pub fn new(config: GeminiImageConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Request {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    Inline { inline_data: InlineData },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(alias = "mime_type")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(alias = "inline_data")]
    inline_data: Option<InlineData>,
}

fn extract_image(resp: Response) -> Result<Vec<u8>> {
    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(StoryError::ContentPolicy(format!("Gemini blocked image prompt: {}", reason)).into());
    }
    let candidate = resp
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| StoryError::Parse("Gemini image response had no candidates".into()))?;

    let inline = candidate
        .content
        .and_then(|c| c.parts.into_iter().find_map(|p| p.inline_data));
    match inline {
        Some(data) => BASE64_STANDARD
            .decode(data.data.trim())
            .map_err(|e| anyhow!("Gemini image payload is not valid base64: {}", e)),
        None => match candidate.finish_reason.as_deref() {
            Some(r @ ("SAFETY" | "IMAGE_SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")) => {
                Err(StoryError::ContentPolicy(format!("Gemini finish reason {}", r)).into())
            }
            other => Err(StoryError::Parse(format!(
                "Gemini returned no image (finish reason {})",
                other.unwrap_or("UNKNOWN")
            ))
            .into()),
        },
    }
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        self.generate_with_references(prompt, &[]).await
    }

    async fn generate_with_references(&self, prompt: &str, references: &[ReferenceImage]) -> Result<Vec<u8>> {
        let mut parts: Vec<RequestPart> = references
            .iter()
            .map(|r| RequestPart::Inline {
                inline_data: InlineData {
                    mime_type: mime_of(&r.bytes).to_string(),
                    data: BASE64_STANDARD.encode(&r.bytes),
                },
            })
            .collect();
        parts.push(RequestPart::Text {
            text: prompt.to_string(),
        });

        let body = Request {
            contents: vec![Content { role: "user", parts }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE"],
            },
        };
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.config.model
        );
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("gemini-image", e))?;
        let resp = check_status("gemini-image", resp).await?;
        let parsed: Response = resp.json().await?;
        extract_image(parsed)
    }
}
