use crate::core::error::StoryError;
use crate::core::model::SpeechStyle;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

pub mod openai;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsProviderConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub openai: Option<OpenAiTtsConfig>,
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            openai: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiTtsConfig {
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_openai_model() -> String {
    "gpt-4o-mini-tts".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub id: String,
    pub description: String,
}

#[async_trait]
pub trait TtsClient: Send + Sync + std::fmt::Debug {
    /// Synthesizes `text` (at most `max_input_chars`) and returns a WAV file.
    async fn speak(&self, text: &str, voice: &str, style: SpeechStyle) -> Result<Vec<u8>>;

    async fn list_voices(&self) -> Result<Vec<Voice>>;

    fn default_voice(&self) -> String;

    /// Provider input ceiling in characters.
    fn max_input_chars(&self) -> usize;
}

pub fn create_tts_client(config: &TtsProviderConfig) -> Result<Box<dyn TtsClient>> {
    info!("Initializing TTS client for provider: {}", config.provider);
    match config.provider.as_str() {
        "openai" => {
            let cfg = config
                .openai
                .as_ref()
                .ok_or_else(|| StoryError::Configuration("OpenAI TTS config missing".into()))?;
            if cfg.api_key.trim().is_empty() {
                return Err(StoryError::Configuration("openai tts api_key is empty".into()).into());
            }
            Ok(Box::new(openai::OpenAiTtsClient::new(cfg.clone())))
        }
        other => Err(StoryError::Configuration(format!("Unknown TTS provider: {}", other)).into()),
    }
}
