use crate::core::error::StoryError;
use crate::core::model::StoryConfig;
use crate::services::llm::{chat_with_retry, LlmClient};
use crate::utils::json_repair::strip_code_fences;
use crate::utils::retry::RetryPolicy;
use anyhow::Result;
use log::info;

/// Spoken pace used to size narration for a target duration.
pub const WORDS_PER_MINUTE: u32 = 140;

pub const MIN_DURATION_MINUTES: u32 = 1;
pub const MAX_DURATION_MINUTES: u32 = 20;

pub fn validate_config(config: &StoryConfig) -> Result<()> {
    if config.id.trim().is_empty() || config.id.contains(['/', '\\']) {
        return Err(StoryError::Precondition(format!("invalid story id {:?}", config.id)).into());
    }
    if config.title.trim().is_empty() {
        return Err(StoryError::Precondition("story title is empty".into()).into());
    }
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&config.target_duration_minutes) {
        return Err(StoryError::Precondition(format!(
            "target duration {} min outside {}..={}",
            config.target_duration_minutes, MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
        ))
        .into());
    }
    Ok(())
}

/// Writes the narration text for a story from its configuration.
pub struct NarrationWriter<'a> {
    llm: &'a dyn LlmClient,
    retry: RetryPolicy,
}

impl<'a> NarrationWriter<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub fn build_prompt(config: &StoryConfig) -> String {
        let words = config.target_duration_minutes * WORDS_PER_MINUTE;
        format!(
            "Write an original narrated story titled \"{}\" for listeners aged {}.\n\
             Tone: {}.\n\
             Length: about {} words, to be read aloud in roughly {} minutes.\n\
             Give every recurring character a name and keep their appearance consistent.\n\
             Write plain prose paragraphs only: no headings, no lists, no markdown, no commentary.",
            config.title, config.age_group, config.tone, words, config.target_duration_minutes
        )
    }

    pub async fn write(&self, config: &StoryConfig) -> Result<String> {
        validate_config(config)?;
        info!("Writing narration for '{}'", config.title);
        let reply = chat_with_retry(
            self.llm,
            &self.retry,
            "You are a children's story author. Reply with the story text only.",
            &Self::build_prompt(config),
        )
        .await?;
        let text = clean_story_text(&reply);
        if text.is_empty() {
            return Err(StoryError::Parse("narration reply was empty".into()).into());
        }
        Ok(text)
    }
}

/// Drops fences, a leading title line and sign-off chatter the models like to add.
fn clean_story_text(reply: &str) -> String {
    let stripped = strip_code_fences(reply);
    let lines: Vec<&str> = stripped
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter(|l| !l.to_lowercase().starts_with("here is") && !l.to_lowercase().starts_with("here's"))
        .collect();
    let mut text = lines.join("\n");
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text.trim().to_string()
}
