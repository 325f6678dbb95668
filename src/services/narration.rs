use crate::core::error::StoryError;
use crate::core::io::Storage;
use crate::core::model::{BatchReport, CancelFlag, GenerationStatus, SpeechStyle};
use crate::core::store::{StoryStore, UsageKind};
use crate::services::tts::TtsClient;
use crate::utils::audio::merge_wav;
use crate::utils::retry::{with_backoff, RetryPolicy};
use crate::utils::text::chunk_text;
use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::{error, info};
use std::path::Path;

pub struct NarrationSynthesizer<'a> {
    tts: &'a dyn TtsClient,
    storage: &'a dyn Storage,
    retry: RetryPolicy,
    max_input_chars: Option<usize>,
    artifact_root: String,
}

impl<'a> NarrationSynthesizer<'a> {
    pub fn new(
        tts: &'a dyn TtsClient,
        storage: &'a dyn Storage,
        retry: RetryPolicy,
        max_input_chars: Option<usize>,
        artifact_root: &str,
    ) -> Self {
        Self {
            tts,
            storage,
            retry,
            max_input_chars,
            artifact_root: artifact_root.to_string(),
        }
    }

    fn ceiling(&self) -> usize {
        let provider = self.tts.max_input_chars();
        self.max_input_chars.map_or(provider, |c| c.min(provider))
    }

    fn audio_path(&self, story_id: &str, file: &str) -> String {
        Path::new(&self.artifact_root)
            .join(story_id)
            .join("audio")
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    /// Synthesizes `text` as one WAV. Input over the provider ceiling is sent
    /// as sentence-aligned chunks whose PCM data is joined in order.
    pub async fn speak(&self, text: &str, voice: &str, style: SpeechStyle) -> Result<Vec<u8>> {
        let chunks = chunk_text(text, self.ceiling());
        if chunks.is_empty() {
            return Err(StoryError::Precondition("nothing to narrate".into()).into());
        }
        if chunks.len() > 1 {
            info!("Narration split into {} chunks", chunks.len());
        }

        let mut parts = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let label = format!("speech chunk {}/{}", i + 1, chunks.len());
            let audio = with_backoff(&self.retry, &label, |_| self.tts.speak(chunk, voice, style)).await?;
            parts.push(audio);
        }
        merge_wav(&parts).context("Failed to join narration chunks")
    }

    /// Full-story narration track used as the video's audio stream.
    pub async fn narrate_story(&self, store: &dyn StoryStore, story_id: &str, voice: &str) -> Result<String> {
        let mut story = store
            .load_story(story_id)
            .await?
            .ok_or_else(|| StoryError::NotFound(format!("story {}", story_id)))?;
        let text = story
            .narration_text
            .clone()
            .ok_or_else(|| StoryError::Precondition("story has no narration text".into()))?;

        let audio = self.speak(&text, voice, SpeechStyle::Warmly).await?;
        let path = self.audio_path(story_id, "narration.wav");
        self.storage.write(&path, &audio).await?;
        store.increment_usage(story_id, UsageKind::Speech).await?;

        story.narration_audio_url = Some(path.clone());
        store.save_story(&story).await?;
        info!("Narration track saved to {}", path);
        Ok(path)
    }

    /// One audio file per scene in the scene's emotional style. Scenes are
    /// processed in order and a failure is recorded without stopping the run.
    pub async fn generate_scene_audio(
        &self,
        store: &dyn StoryStore,
        story_id: &str,
        voice: &str,
        force: bool,
        cancel: &CancelFlag,
        progress: Option<&ProgressBar>,
    ) -> Result<BatchReport> {
        let scenes = store.load_scenes(story_id).await?;
        let mut report = BatchReport::default();

        for mut scene in scenes {
            if cancel.is_cancelled() {
                info!("Scene audio cancelled before scene {}", scene.order);
                break;
            }
            if !force && scene.audio_url.is_some() && scene.audio_status == GenerationStatus::Complete {
                report.skipped += 1;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                continue;
            }
            if scene.audio_status == GenerationStatus::Generating {
                scene.audio_status = GenerationStatus::Pending;
            }
            scene.audio_status.begin()?;

            let style = scene.emotion.speech_style();
            let path = self.audio_path(story_id, &format!("scene_{:03}.wav", scene.order));
            let outcome = match self.speak(&scene.narration_text, voice, style).await {
                Ok(audio) => self.storage.write(&path, &audio).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    scene.audio_url = Some(path);
                    scene.audio_status.complete()?;
                    store.increment_usage(story_id, UsageKind::Speech).await?;
                    report.complete += 1;
                }
                Err(e) => {
                    error!("Scene {} audio failed: {:#}", scene.order, e);
                    scene.audio_status.fail(format!("{:#}", e))?;
                    report.error += 1;
                }
            }
            store.update_scene(story_id, &scene).await?;
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorClass;
    use crate::core::io::NativeStorage;
    use crate::core::model::{Emotion, Scene, Story, StoryConfig};
    use crate::core::store::JsonStoryStore;
    use crate::services::tts::Voice;
    use crate::utils::audio::{pcm_wav, wav_duration_seconds};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Returns one second of silence per call and records the request.
    #[derive(Debug, Default)]
    struct MockTts {
        calls: Arc<Mutex<Vec<(String, SpeechStyle)>>>,
        ceiling: usize,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl TtsClient for MockTts {
        async fn speak(&self, text: &str, _voice: &str, style: SpeechStyle) -> Result<Vec<u8>> {
            assert!(text.chars().count() <= self.ceiling, "chunk over ceiling: {}", text);
            self.calls.lock().unwrap().push((text.to_string(), style));
            if let Some(needle) = &self.fail_on {
                if text.contains(needle.as_str()) {
                    return Err(StoryError::ContentPolicy("moderation_blocked".into()).into());
                }
            }
            Ok(pcm_wav(1.0, 8000))
        }

        async fn list_voices(&self) -> Result<Vec<Voice>> {
            Ok(Vec::new())
        }

        fn default_voice(&self) -> String {
            "mock".into()
        }

        fn max_input_chars(&self) -> usize {
            self.ceiling
        }
    }

    fn mock(ceiling: usize) -> MockTts {
        MockTts {
            ceiling,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_long_text_chunked_on_sentences() -> Result<()> {
        let tts = mock(40);
        let storage = NativeStorage::new();
        let synth = NarrationSynthesizer::new(&tts, &storage, RetryPolicy::default(), None, "build");
        let text = "The fox woke early. The sun was warm. She ran to the river. The owl was waiting there.";

        let audio = synth.speak(text, "v", SpeechStyle::Calmly).await?;
        let calls = tts.calls.lock().unwrap();
        assert!(calls.len() > 1);
        for (chunk, _) in calls.iter() {
            assert!(chunk.ends_with('.'), "split mid-sentence: {}", chunk);
        }
        let joined: Vec<&str> = calls.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(joined.join(" "), text);
        let expected = calls.len() as f64;
        assert!((wav_duration_seconds(&audio)? - expected).abs() < 1e-6);
        Ok(())
    }

    #[tokio::test]
    async fn test_configured_ceiling_is_tighter() -> Result<()> {
        let tts = mock(4096);
        let storage = NativeStorage::new();
        let synth = NarrationSynthesizer::new(&tts, &storage, RetryPolicy::default(), Some(21), "build");
        synth.speak("One two three. Four five six. Seven.", "v", SpeechStyle::Warmly).await?;
        assert_eq!(tts.calls.lock().unwrap().len(), 2);

        let err = synth.speak("   ", "v", SpeechStyle::Warmly).await.unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::Precondition);
        Ok(())
    }

    #[tokio::test]
    async fn test_scene_audio_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let storage = Arc::new(NativeStorage::new());
        let store = JsonStoryStore::new(&root, storage.clone());

        let mut scenes: Vec<Scene> = (1..=3)
            .map(|i| Scene::new(i, &format!("Scene number {}.", i), "v"))
            .collect();
        scenes[0].emotion = Emotion::Happy;
        scenes[2].emotion = Emotion::Scared;
        store.replace_scenes("s1", scenes).await?;

        let tts = MockTts {
            ceiling: 4096,
            fail_on: Some("number 2".into()),
            ..Default::default()
        };
        let synth = NarrationSynthesizer::new(&tts, storage.as_ref(), RetryPolicy::default(), None, &root);
        let report = synth
            .generate_scene_audio(&store, "s1", "v", false, &CancelFlag::new(), None)
            .await?;
        assert_eq!(report, BatchReport { complete: 2, error: 1, skipped: 0 });

        let styles: Vec<SpeechStyle> = tts.calls.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(styles, vec![SpeechStyle::Cheerfully, SpeechStyle::Calmly, SpeechStyle::Mysteriously]);

        let stored = store.load_scenes("s1").await?;
        assert!(stored[1].audio_status.is_error());
        assert!(stored[1].audio_url.is_none());
        assert!(storage.exists(stored[2].audio_url.as_deref().unwrap()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_narrate_story_records_track() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let storage = Arc::new(NativeStorage::new());
        let store = JsonStoryStore::new(&root, storage.clone());
        let config: StoryConfig = serde_yaml_ng::from_str("id: s1\ntitle: T\ntarget_duration_minutes: 1")?;
        let mut story = Story::new(config);
        story.narration_text = Some("A short tale.".into());
        store.save_story(&story).await?;

        let tts = mock(4096);
        let synth = NarrationSynthesizer::new(&tts, storage.as_ref(), RetryPolicy::default(), None, &root);
        let path = synth.narrate_story(&store, "s1", "v").await?;

        let saved = store.load_story("s1").await?.unwrap();
        assert_eq!(saved.narration_audio_url.as_deref(), Some(path.as_str()));
        assert!(storage.exists(&path).await?);
        Ok(())
    }
}
