use crate::core::config::Config;
use crate::services::tts::{TtsClient, Voice};
use anyhow::{anyhow, Result};
use inquire::Select;

/// Asks for a narrator voice on first run and stores it in `config.yml`.
/// Unattended runs fall back to the provider default without prompting.
pub async fn run_setup(config: &mut Config, tts: &dyn TtsClient) -> Result<()> {
    if config.audio.voice.is_some() {
        return Ok(());
    }
    if config.unattended {
        let voice = tts.default_voice();
        println!("No narrator voice configured, using {}", voice);
        config.audio.voice = Some(voice);
        return Ok(());
    }

    println!("Fetching {} voices...", config.audio.provider.provider);
    let voices = tts.list_voices().await?;
    if voices.is_empty() {
        return Err(anyhow!("Provider {} offered no voices", config.audio.provider.provider));
    }
    config.audio.voice = Some(select_voice("Select Narrator Voice:", &voices, &tts.default_voice())?);
    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

fn voice_label(v: &Voice) -> String {
    format!("{} - {}", v.id, v.description)
}

fn select_voice(prompt: &str, voices: &[Voice], default_id: &str) -> Result<String> {
    let options: Vec<String> = voices.iter().map(voice_label).collect();
    let start = voices.iter().position(|v| v.id == default_id).unwrap_or(0);
    let selection = Select::new(prompt, options).with_starting_cursor(start).prompt()?;
    voice_id_from_label(&selection).ok_or_else(|| anyhow!("Empty voice selection"))
}

fn voice_id_from_label(label: &str) -> Option<String> {
    label.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::SpeechStyle;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FixedTts;

    #[async_trait]
    impl TtsClient for FixedTts {
        async fn speak(&self, _text: &str, _voice: &str, _style: SpeechStyle) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn list_voices(&self) -> Result<Vec<Voice>> {
            Ok(Vec::new())
        }

        fn default_voice(&self) -> String {
            "coral".into()
        }

        fn max_input_chars(&self) -> usize {
            100
        }
    }

    fn config(unattended: bool, voice: Option<&str>) -> Config {
        let mut config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: openai\nimage:\n  provider: openai\n",
        )
        .unwrap();
        config.unattended = unattended;
        config.audio.voice = voice.map(String::from);
        config
    }

    #[tokio::test]
    async fn test_unattended_uses_default_voice() -> Result<()> {
        let mut cfg = config(true, None);
        run_setup(&mut cfg, &FixedTts).await?;
        assert_eq!(cfg.audio.voice.as_deref(), Some("coral"));
        Ok(())
    }

    #[tokio::test]
    async fn test_configured_voice_untouched() -> Result<()> {
        let mut cfg = config(false, Some("onyx"));
        run_setup(&mut cfg, &FixedTts).await?;
        assert_eq!(cfg.audio.voice.as_deref(), Some("onyx"));
        Ok(())
    }

    #[test]
    fn test_label_round_trip() {
        let v = Voice {
            id: "sage".into(),
            description: "calm, measured".into(),
        };
        assert_eq!(voice_id_from_label(&voice_label(&v)).as_deref(), Some("sage"));
    }
}
