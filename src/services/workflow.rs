use crate::core::config::Config;
use crate::core::error::{ErrorClass, StoryError};
use crate::core::io::Storage;
use crate::core::model::{CancelFlag, CharacterRoster, Scene, Story, StoryConfig, VideoAssemblyJob};
use crate::core::store::{StoryStore, UsageKind};
use crate::services::characters::CharacterRegistry;
use crate::services::decomposer::SceneDecomposer;
use crate::services::export::ExportBundle;
use crate::services::image::ImageClient;
use crate::services::images::ImageOrchestrator;
use crate::services::llm::LlmClient;
use crate::services::narration::NarrationSynthesizer;
use crate::services::story::{validate_config, NarrationWriter};
use crate::services::tts::TtsClient;
use crate::services::video::{VideoAssembler, VideoEncoder};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    NarrationText,
    Characters,
    NarrationAudio,
    Scenes,
    Images,
    Assembly,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Config,
        Stage::NarrationText,
        Stage::Characters,
        Stage::NarrationAudio,
        Stage::Scenes,
        Stage::Images,
        Stage::Assembly,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::NarrationText => "narration text",
            Stage::Characters => "characters",
            Stage::NarrationAudio => "narration audio",
            Stage::Scenes => "scenes",
            Stage::Images => "images",
            Stage::Assembly => "assembly",
        }
    }
}

/// Artifacts currently stored for one story.
#[derive(Debug, Clone, Default)]
pub struct StorySnapshot {
    pub story: Option<Story>,
    pub roster: CharacterRoster,
    pub scenes: Vec<Scene>,
}

/// Whether `stage` has its artifacts. Nothing but artifact presence is
/// consulted, so a revisited stage never leaves stale flags behind.
pub fn stage_complete(stage: Stage, snapshot: &StorySnapshot, narration_track: bool) -> bool {
    let story = snapshot.story.as_ref();
    match stage {
        Stage::Config => story.is_some(),
        Stage::NarrationText => story
            .and_then(|s| s.narration_text.as_deref())
            .is_some_and(|t| !t.trim().is_empty()),
        Stage::Characters => !snapshot.roster.is_empty(),
        Stage::NarrationAudio => !narration_track || story.is_some_and(|s| s.narration_audio_url.is_some()),
        Stage::Scenes => !snapshot.scenes.is_empty(),
        Stage::Images => !snapshot.scenes.is_empty() && snapshot.scenes.iter().all(|s| s.image_url.is_some()),
        Stage::Assembly => story.is_some_and(|s| s.final_video_url.is_some()),
    }
}

/// One story as found in the input folder.
#[derive(Debug, Clone)]
pub struct StoryInput {
    pub config: StoryConfig,
    /// Narration supplied next to the config; skips the narration writer.
    pub narration: Option<String>,
}

pub struct StoryPipeline {
    config: Config,
    llm: Box<dyn LlmClient>,
    images: Box<dyn ImageClient>,
    tts: Box<dyn TtsClient>,
    encoder: Box<dyn VideoEncoder>,
    storage: Arc<dyn Storage>,
    store: Arc<dyn StoryStore>,
    cancel: CancelFlag,
}

impl StoryPipeline {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        images: Box<dyn ImageClient>,
        tts: Box<dyn TtsClient>,
        encoder: Box<dyn VideoEncoder>,
        storage: Arc<dyn Storage>,
        store: Arc<dyn StoryStore>,
    ) -> Self {
        Self {
            config,
            llm,
            images,
            tts,
            encoder,
            storage,
            store,
            cancel: CancelFlag::new(),
        }
    }

    /// Handle for stopping batch stages after the current scene.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn snapshot(&self, story_id: &str) -> Result<StorySnapshot> {
        Ok(StorySnapshot {
            story: self.store.load_story(story_id).await?,
            roster: self.store.load_characters(story_id).await?,
            scenes: self.store.load_scenes(story_id).await?,
        })
    }

    pub async fn incomplete_stages(&self, story_id: &str) -> Result<Vec<Stage>> {
        let snapshot = self.snapshot(story_id).await?;
        Ok(Stage::ALL
            .into_iter()
            .filter(|s| !stage_complete(*s, &snapshot, self.config.audio.narration_track))
            .collect())
    }

    fn voice_for(&self, story: &StoryConfig) -> String {
        story
            .voice
            .clone()
            .or_else(|| self.config.audio.voice.clone())
            .unwrap_or_else(|| self.tts.default_voice())
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    fn output_path(&self, file: &str) -> String {
        Path::new(&self.config.output_folder)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    async fn require_story(&self, story_id: &str) -> Result<Story> {
        self.store
            .load_story(story_id)
            .await?
            .ok_or_else(|| StoryError::Precondition(format!("story {} has not been configured", story_id)).into())
    }

    async fn require_text(&self, story_id: &str) -> Result<(Story, String)> {
        let story = self.require_story(story_id).await?;
        let text = story
            .narration_text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| StoryError::Precondition("story has no narration text yet".into()))?;
        Ok((story, text))
    }

    /// Runs one stage regardless of its completion state. Later stages are
    /// left alone; re-running them is up to the caller.
    pub async fn run_stage(&self, input: &StoryInput, stage: Stage, force: bool) -> Result<()> {
        let id = input.config.id.as_str();
        let root = self.config.build_folder.as_str();
        info!("[{}] stage: {}", id, stage.label());

        match stage {
            Stage::Config => {
                validate_config(&input.config)?;
                let story = match self.store.load_story(id).await? {
                    Some(mut existing) => {
                        existing.config = input.config.clone();
                        existing
                    }
                    None => Story::new(input.config.clone()),
                };
                self.store.save_story(&story).await?;
            }
            Stage::NarrationText => {
                let mut story = self.require_story(id).await?;
                let text = match &input.narration {
                    Some(text) if !text.trim().is_empty() => text.trim().to_string(),
                    _ => {
                        let writer = NarrationWriter::new(self.llm.as_ref(), self.config.llm.retry_policy());
                        let text = writer.write(&story.config).await?;
                        self.store.increment_usage(id, UsageKind::Text).await?;
                        text
                    }
                };
                story.narration_text = Some(text);
                self.store.save_story(&story).await?;
            }
            Stage::Characters => {
                let (story, text) = self.require_text(id).await?;
                let registry = CharacterRegistry::new(
                    self.llm.as_ref(),
                    self.images.as_ref(),
                    self.storage.as_ref(),
                    self.config.llm.retry_policy(),
                    self.config.image.retry.clone(),
                    &story.config.visual_style,
                    root,
                );
                let roster = registry.extract_characters(&text).await;
                self.store.increment_usage(id, UsageKind::Text).await?;
                let existing = self.store.load_characters(id).await?;
                for mut descriptor in roster.characters.into_values() {
                    // keep a reference drawn in an earlier pass
                    if let Some(previous) = existing.get(&descriptor.name) {
                        descriptor.reference_image = previous.reference_image.clone();
                        descriptor.reference_status = previous.reference_status.clone();
                    }
                    self.store.upsert_character(id, &descriptor).await?;
                }
                let report = registry
                    .generate_missing_references(self.store.as_ref(), id, &self.cancel)
                    .await?;
                if report.error > 0 {
                    warn!("[{}] {} character references failed; scenes will render without them", id, report.error);
                }
            }
            Stage::NarrationAudio => {
                if !self.config.audio.narration_track {
                    info!("[{}] narration track disabled", id);
                    return Ok(());
                }
                let story = self.require_story(id).await?;
                let synth = self.narration();
                synth
                    .narrate_story(self.store.as_ref(), id, &self.voice_for(&story.config))
                    .await?;
            }
            Stage::Scenes => {
                let (story, text) = self.require_text(id).await?;
                let names: Vec<String> = self
                    .store
                    .load_characters(id)
                    .await?
                    .characters
                    .keys()
                    .cloned()
                    .collect();
                let decomposer = SceneDecomposer::new(self.llm.as_ref(), self.config.llm.retry_policy());
                let scenes = decomposer
                    .decompose(
                        &text,
                        story.config.target_duration_minutes,
                        story.config.target_scene_count,
                        &names,
                    )
                    .await?;
                self.store.increment_usage(id, UsageKind::Text).await?;
                info!("[{}] {} scenes", id, scenes.len());
                self.store.replace_scenes(id, scenes).await?;
            }
            Stage::Images => {
                let story = self.require_story(id).await?;
                let count = self.store.load_scenes(id).await?.len();
                if count == 0 {
                    return Err(StoryError::Precondition("no scenes to illustrate".into()).into());
                }
                let orchestrator = ImageOrchestrator::new(
                    self.config.image.clone(),
                    self.images.as_ref(),
                    self.storage.as_ref(),
                    root,
                );
                let pb = self.progress_bar(count)?;
                let report = orchestrator
                    .generate_all(self.store.as_ref(), &story.config, force, &self.cancel, Some(&pb))
                    .await?;
                pb.finish_and_clear();
                if report.error > 0 {
                    warn!("[{}] {} scene images failed; re-run to retry them", id, report.error);
                }
            }
            Stage::Assembly => self.assemble(input, force).await?,
        }
        Ok(())
    }

    fn narration(&self) -> NarrationSynthesizer<'_> {
        NarrationSynthesizer::new(
            self.tts.as_ref(),
            self.storage.as_ref(),
            self.config.audio.retry.clone(),
            self.config.audio.max_input_chars,
            &self.config.build_folder,
        )
    }

    /// Scene audio, export bundle, then the video itself. Scenes without an
    /// image stop the stage before any audio is synthesized.
    async fn assemble(&self, input: &StoryInput, force: bool) -> Result<()> {
        let id = input.config.id.as_str();
        let mut story = self.require_story(id).await?;
        VideoAssemblyJob::from_scenes(&self.store.load_scenes(id).await?, None).ensure_ready()?;

        if self.config.audio.scene_audio {
            let count = self.store.load_scenes(id).await?.len();
            let pb = self.progress_bar(count)?;
            let report = self
                .narration()
                .generate_scene_audio(
                    self.store.as_ref(),
                    id,
                    &self.voice_for(&story.config),
                    force,
                    &self.cancel,
                    Some(&pb),
                )
                .await?;
            pb.finish_and_clear();
            if report.error > 0 {
                warn!("[{}] {} scene audio clips failed", id, report.error);
            }
        }

        let scenes = self.store.load_scenes(id).await?;
        let mut bundle = ExportBundle::build(&story, &scenes);
        bundle
            .write_to(self.storage.as_ref(), &self.output_path(id))
            .await?;
        if !bundle.is_complete() {
            warn!("[{}] export incomplete, scenes missing assets: {:?}", id, bundle.missing_orders());
        }

        let track = if self.config.audio.narration_track {
            story.narration_audio_url.clone()
        } else {
            None
        };
        let job = VideoAssemblyJob::from_scenes(&scenes, track);
        let assembler = VideoAssembler::new(self.encoder.as_ref(), self.storage.as_ref());
        let outcome = assembler
            .assemble(&job, &self.output_path(&format!("{}.mp4", id)))
            .await?;
        self.store.increment_usage(id, UsageKind::Video).await?;

        story.final_video_url = Some(outcome.output);
        self.store.save_story(&story).await?;
        Ok(())
    }

    /// Runs every incomplete stage in order. Returns `false` when the user
    /// chose to stop.
    pub async fn run_story(&self, input: &StoryInput) -> Result<bool> {
        let id = input.config.id.as_str();
        for stage in Stage::ALL {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let snapshot = self.snapshot(id).await?;
            // a changed config file is always re-applied
            let done = stage != Stage::Config
                && stage_complete(stage, &snapshot, self.config.audio.narration_track);
            if done {
                info!("[{}] {} already done", id, stage.label());
                continue;
            }
            if !self.config.unattended && stage != Stage::Config {
                let ans = inquire::Confirm::new(&format!("[{}] Run stage '{}'?", id, stage.label()))
                    .with_default(true)
                    .prompt();
                match ans {
                    Ok(true) => {}
                    Ok(false) => {
                        println!("Stopping as requested.");
                        return Ok(false);
                    }
                    Err(_) => {
                        println!("Error reading input, stopping.");
                        return Ok(false);
                    }
                }
            }
            self.run_stage(input, stage, false)
                .await
                .with_context(|| format!("Stage '{}' failed for {}", stage.label(), id))?;
        }
        Ok(true)
    }

    async fn load_inputs(&self) -> Result<Vec<StoryInput>> {
        let entries = self.storage.list(&self.config.input_folder).await?;
        let mut inputs = Vec::new();
        for path in entries
            .iter()
            .filter(|e| e.ends_with(".yml") || e.ends_with(".yaml"))
        {
            let bytes = self.storage.read(path).await?;
            let config: StoryConfig = match serde_yaml_ng::from_slice(&bytes) {
                Ok(c) => c,
                Err(e) => {
                    error!("Skipping {}: {}", path, e);
                    continue;
                }
            };
            let text_path = Path::new(path).with_extension("txt").to_string_lossy().to_string();
            let narration = if self.storage.exists(&text_path).await? {
                Some(String::from_utf8_lossy(&self.storage.read(&text_path).await?).to_string())
            } else {
                None
            };
            inputs.push(StoryInput { config, narration });
        }
        Ok(inputs)
    }

    /// Processes every story config in the input folder. A failing story is
    /// logged and the next one starts; configuration errors stop the run.
    pub async fn run(&self) -> Result<()> {
        let inputs = self.load_inputs().await?;
        if inputs.is_empty() {
            println!("No story configs found in {}", self.config.input_folder);
            return Ok(());
        }

        for input in &inputs {
            println!("Processing story: {} ({})", input.config.title, input.config.id);
            match self.run_story(input).await {
                Ok(true) => println!("Finished: {}", input.config.id),
                Ok(false) => break,
                Err(e) => {
                    if StoryError::classify(&e) == ErrorClass::Configuration {
                        return Err(e);
                    }
                    error!("{:#}", e);
                }
            }
        }
        Ok(())
    }
}
