use crate::core::error::StoryError;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

pub mod gemini;
pub mod openai;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub openai: Option<OpenAiImageConfig>,
    #[serde(default)]
    pub gemini: Option<GeminiImageConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiImageConfig {
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_size")]
    pub size: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiImageConfig {
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

fn default_openai_model() -> String {
    "gpt-image-1".to_string()
}
fn default_gemini_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_size() -> String {
    "1536x1024".to_string()
}

/// One reference payload sent alongside a prompt. `name` is only used for
/// logging and multipart file names.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ImageClient: Send + Sync + std::fmt::Debug {
    /// Generates one image and returns its encoded bytes (PNG).
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>>;

    /// Generates one image conditioned on `references`, in the given order.
    async fn generate_with_references(&self, prompt: &str, references: &[ReferenceImage]) -> Result<Vec<u8>>;
}

pub fn create_image_client(config: &ImageProviderConfig) -> Result<Box<dyn ImageClient>> {
    info!("Initializing image client for provider: {}", config.provider);
    match config.provider.as_str() {
        "openai" => {
            let cfg = config
                .openai
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("OpenAI image config missing".into()))?;
            if cfg.api_key.trim().is_empty() {
                return Err(StoryError::Configuration("openai image api_key is empty".into()).into());
            }
            Ok(Box::new(openai::OpenAiImageClient::new(cfg.clone())))
        }
        "gemini" => {
            let cfg = config
                .gemini
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("Gemini image config missing".into()))?;
            if cfg.api_key.trim().is_empty() {
                return Err(StoryError::Configuration("gemini image api_key is empty".into()).into());
            }
            Ok(Box::new(gemini::GeminiImageClient::new(cfg.clone())))
        }
        other => Err(StoryError::Configuration(format!("Unknown image provider: {}", other)).into()),
    }
}

/// Sniffs the container so references can be labelled correctly.
pub fn mime_of(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// File extension matching the sniffed image type; PNG when unknown.
pub fn extension_of(bytes: &[u8]) -> &'static str {
    match mime_of(bytes) {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}
