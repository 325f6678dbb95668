use super::{mime_of, ImageClient, OpenAiImageConfig, ReferenceImage};
use crate::core::error::StoryError;
use crate::services::llm::{check_status, transport_error};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::prelude::*;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct OpenAiImageClient {
    config: OpenAiImageConfig,
    client: reqwest::Client,
}

impl OpenAiImageClient {
    pub fn new(config: OpenAiImageConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    n: u32,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

fn decode_first(resp: ImageResponse) -> Result<Vec<u8>> {
    let encoded = resp
        .data
        .into_iter()
        .find_map(|d| d.b64_json)
        .ok_or_else(|| StoryError::Parse("OpenAI image response had no b64_json".into()))?;
    BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("OpenAI image payload is not valid base64: {}", e))
}

#[async_trait]
impl ImageClient for OpenAiImageClient {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        let body = GenerationRequest {
            model: &self.config.model,
            prompt,
            size: &self.config.size,
            n: 1,
        };
        let resp = self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("openai-image", e))?;
        let resp = check_status("openai-image", resp).await?;
        let parsed: ImageResponse = resp.json().await?;
        decode_first(parsed)
    }

    async fn generate_with_references(&self, prompt: &str, references: &[ReferenceImage]) -> Result<Vec<u8>> {
        if references.is_empty() {
            return self.generate(prompt).await;
        }
        let mut form = Form::new()
            .text("model", self.config.model.clone())
            .text("prompt", prompt.to_string())
            .text("size", self.config.size.clone())
            .text("n", "1");
        for (i, reference) in references.iter().enumerate() {
            let mime = mime_of(&reference.bytes);
            let ext = mime.rsplit('/').next().unwrap_or("png");
            let part = Part::bytes(reference.bytes.clone())
                .file_name(format!("ref{}_{}.{}", i, reference.name.replace(' ', "_"), ext))
                .mime_str(mime)?;
            form = form.part("image[]", part);
        }
        debug!("OpenAI image edit with {} reference payloads", references.len());

        let resp = self
            .client
            .post(self.endpoint("images/edits"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("openai-image", e))?;
        let resp = check_status("openai-image", resp).await?;
        let parsed: ImageResponse = resp.json().await?;
        decode_first(parsed)
    }
}
