use super::{OpenAiTtsConfig, TtsClient, Voice};
use crate::core::model::SpeechStyle;
use crate::services::llm::{check_status, transport_error};
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::Serialize;

const MAX_INPUT_CHARS: usize = 4096;

const VOICES: &[(&str, &str)] = &[
    ("alloy", "neutral, balanced"),
    ("ash", "soft, conversational male"),
    ("ballad", "gentle, lyrical"),
    ("coral", "warm, friendly female"),
    ("echo", "clear male"),
    ("fable", "expressive storyteller"),
    ("nova", "bright female"),
    ("onyx", "deep male"),
    ("sage", "calm, measured"),
    ("shimmer", "light, airy female"),
];

#[derive(Debug)]
pub struct OpenAiTtsClient {
    config: OpenAiTtsConfig,
    client: reqwest::Client,
}

impl OpenAiTtsClient {
    pub fn new(config: OpenAiTtsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    instructions: String,
}

fn instructions_for(style: SpeechStyle) -> String {
    format!(
        "You are narrating a children's picture book. Speak {} at a relaxed storytelling pace.",
        style.as_str()
    )
}

#[async_trait]
impl TtsClient for OpenAiTtsClient {
    async fn speak(&self, text: &str, voice: &str, style: SpeechStyle) -> Result<Vec<u8>> {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/audio/speech", base.trim_end_matches('/'));
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice,
            response_format: "wav",
            instructions: instructions_for(style),
        };
        debug!("TTS request: {} chars, voice {}, {}", text.chars().count(), voice, style.as_str());

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("openai-tts", e))?;
        let resp = check_status("openai-tts", resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_voices(&self) -> Result<Vec<Voice>> {
        Ok(VOICES
            .iter()
            .map(|(id, description)| Voice {
                id: id.to_string(),
                description: description.to_string(),
            })
            .collect())
    }

    fn default_voice(&self) -> String {
        "coral".to_string()
    }

    fn max_input_chars(&self) -> usize {
        MAX_INPUT_CHARS
    }
}
