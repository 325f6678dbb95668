use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::image::ImageProviderConfig;
use crate::services::llm::LlmConfig;
use crate::services::tts::TtsProviderConfig;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    pub image: ImageConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub video: VideoConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(flatten)]
    pub provider: ImageProviderConfig,
    #[serde(default = "default_max_references")]
    pub max_references: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(flatten)]
    pub provider: TtsProviderConfig,
    /// Voice used when a story does not name one.
    #[serde(default)]
    pub voice: Option<String>,
    /// Overrides the provider's own input ceiling when smaller.
    #[serde(default)]
    pub max_input_chars: Option<usize>,
    #[serde(default = "default_true")]
    pub scene_audio: bool,
    #[serde(default = "default_true")]
    pub narration_track: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: TtsProviderConfig::default(),
            voice: None,
            max_input_chars: None,
            scene_audio: true,
            narration_track: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f64,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            max_zoom: default_max_zoom(),
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_references() -> usize {
    5
}
fn default_max_prompt_chars() -> usize {
    800
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    25
}
fn default_max_zoom() -> f64 {
    1.2
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() -> Result<()> {
        let yaml = r#"
llm:
  provider: ollama
  ollama:
    base_url: http://localhost:11434
    model: llama3
image:
  provider: openai
  openai:
    api_key: sk-test
"#;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, yaml)?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.input_folder, "input");
        assert_eq!(config.image.max_references, 5);
        assert_eq!(config.image.max_prompt_chars, 800);
        assert_eq!(config.image.retry.max_attempts, 5);
        assert_eq!(config.video, VideoConfig::default());
        assert!(config.audio.scene_audio);
        assert_eq!(config.llm.retry_count, 3);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
