//! Per-scene illustration generation.
//!
//! For every scene the orchestrator first consults the positional overrides
//! (cover, ending card). If none applies it resolves a prompt, gathers the
//! character reference images weighted by character status, and calls the
//! image provider under the retry policy. Results are written to storage and
//! attached to the scene; the scene's text fields are never touched.

use crate::core::config::ImageConfig;
use crate::core::io::Storage;
use crate::core::model::{
    BatchReport, CancelFlag, CharacterDescriptor, CharacterRoster, CharacterStatus, GenerationStatus, Scene,
    StoryConfig,
};
use crate::core::store::{StoryStore, UsageKind};
use crate::services::image::{extension_of, ImageClient, ReferenceImage};
use crate::utils::retry::with_backoff;
use crate::utils::text::{char_len, truncate_at_word};
use anyhow::Result;
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::path::Path;

/// Scene character entry standing for the main character when the story
/// never names them.
pub const PROTAGONIST_MARKER: &str = "protagonist";

/// How many times a reference is submitted, by character status.
pub const REFERENCE_WEIGHTS: &[(CharacterStatus, usize)] =
    &[(CharacterStatus::Protagonist, 1), (CharacterStatus::Supporting, 2)];

fn duplication_factor(status: CharacterStatus) -> usize {
    REFERENCE_WEIGHTS
        .iter()
        .find(|(s, _)| *s == status)
        .map(|(_, n)| *n)
        .unwrap_or(1)
}

pub struct OverrideContext<'a> {
    pub story: &'a StoryConfig,
    pub scene_count: usize,
}

/// Returns an existing artifact to use instead of generating one.
pub type ImageOverride = fn(&Scene, &OverrideContext) -> Option<String>;

fn cover_override(scene: &Scene, ctx: &OverrideContext) -> Option<String> {
    (scene.order == 1).then(|| ctx.story.cover_image_url.clone()).flatten()
}

fn ending_override(scene: &Scene, ctx: &OverrideContext) -> Option<String> {
    (scene.order == ctx.scene_count).then(|| ctx.story.ending_image_url.clone()).flatten()
}

/// Evaluated in order; the first hit wins.
pub const IMAGE_OVERRIDES: &[(&str, ImageOverride)] = &[("cover", cover_override), ("ending", ending_override)];

pub fn find_override(scene: &Scene, ctx: &OverrideContext) -> Option<(&'static str, String)> {
    IMAGE_OVERRIDES
        .iter()
        .find_map(|(name, rule)| rule(scene, ctx).map(|url| (*name, url)))
}

/// Characters appearing in the scene, protagonists first, without duplicates.
pub fn scene_characters<'r>(scene: &Scene, roster: &'r CharacterRoster) -> Vec<&'r CharacterDescriptor> {
    let mut found: Vec<&CharacterDescriptor> = Vec::new();
    for name in &scene.character_names {
        let descriptor = if name.trim().eq_ignore_ascii_case(PROTAGONIST_MARKER) {
            roster.first_with_reference()
        } else {
            roster.get(name)
        };
        match descriptor {
            Some(d) if !found.iter().any(|f| f.name == d.name) => found.push(d),
            Some(_) => {}
            None => debug!("scene {} names unknown character {:?}", scene.order, name),
        }
    }
    found.sort_by_key(|d| d.status != CharacterStatus::Protagonist);
    found
}

/// Reference artifact paths to submit, duplicated per status and capped.
pub fn reference_plan(characters: &[&CharacterDescriptor], max_references: usize) -> Vec<String> {
    let mut plan = Vec::new();
    for d in characters {
        if let Some(path) = &d.reference_image {
            for _ in 0..duplication_factor(d.status) {
                plan.push(path.clone());
            }
        }
    }
    if plan.len() > max_references {
        debug!("dropping {} reference payloads over the cap", plan.len() - max_references);
        plan.truncate(max_references);
    }
    plan
}

fn compact_descriptor(d: &CharacterDescriptor, budget: usize) -> String {
    let body = if d.full_description.trim().is_empty() {
        [&d.species, &d.main_colors, &d.clothing, &d.accessories]
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        d.full_description.trim().to_string()
    };
    if body.is_empty() {
        return d.name.clone();
    }
    format!("{} ({})", d.name, truncate_at_word(&body, budget))
}

/// Stored prompt if present, otherwise built from the scene and the
/// character descriptors, capped at `max_chars`.
pub fn resolve_prompt(scene: &Scene, characters: &[&CharacterDescriptor], visual_style: &str, max_chars: usize) -> String {
    if let Some(prompt) = scene.image_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        return prompt.trim().to_string();
    }

    let mut prompt = format!(
        "{} illustration. {} Mood: {}.",
        visual_style.trim(),
        scene.visual_description.trim(),
        scene.emotion.as_str()
    );
    if !characters.is_empty() {
        let remaining = max_chars.saturating_sub(char_len(&prompt) + 16);
        let budget = (remaining / characters.len()).max(60);
        let described: Vec<String> = characters.iter().map(|d| compact_descriptor(d, budget)).collect();
        prompt.push_str(" Characters: ");
        prompt.push_str(&described.join("; "));
        prompt.push('.');
    }
    truncate_at_word(&prompt, max_chars)
}

pub struct ImageOrchestrator<'a> {
    config: ImageConfig,
    images: &'a dyn ImageClient,
    storage: &'a dyn Storage,
    artifact_root: String,
}

impl<'a> ImageOrchestrator<'a> {
    pub fn new(config: ImageConfig, images: &'a dyn ImageClient, storage: &'a dyn Storage, artifact_root: &str) -> Self {
        Self {
            config,
            images,
            storage,
            artifact_root: artifact_root.to_string(),
        }
    }

    fn image_path(&self, story_id: &str, order: usize, bytes: &[u8]) -> String {
        Path::new(&self.artifact_root)
            .join(story_id)
            .join("images")
            .join(format!("scene_{:03}.{}", order, extension_of(bytes)))
            .to_string_lossy()
            .to_string()
    }

    async fn load_references(&self, plan: &[String], characters: &[&CharacterDescriptor]) -> Vec<ReferenceImage> {
        let mut references = Vec::with_capacity(plan.len());
        for path in plan {
            let name = characters
                .iter()
                .find(|d| d.reference_image.as_deref() == Some(path.as_str()))
                .map(|d| d.name.clone())
                .unwrap_or_default();
            match self.storage.read(path).await {
                Ok(bytes) => references.push(ReferenceImage { name, bytes }),
                Err(e) => warn!("Reference image {} unreadable, skipping: {:#}", path, e),
            }
        }
        references
    }

    /// Produces the image bytes for one scene without touching its status.
    async fn synthesize(&self, scene: &Scene, story: &StoryConfig, roster: &CharacterRoster) -> Result<Vec<u8>> {
        let characters = scene_characters(scene, roster);
        let prompt = resolve_prompt(scene, &characters, &story.visual_style, self.config.max_prompt_chars);
        let plan = reference_plan(&characters, self.config.max_references);
        let references = self.load_references(&plan, &characters).await;
        let label = format!("image for scene {}", scene.order);

        if references.is_empty() {
            debug!("Scene {}: unconditioned synthesis", scene.order);
            with_backoff(&self.config.retry, &label, |_| self.images.generate(&prompt)).await
        } else {
            debug!("Scene {}: {} reference payloads", scene.order, references.len());
            with_backoff(&self.config.retry, &label, |_| {
                self.images.generate_with_references(&prompt, &references)
            })
            .await
        }
    }

    /// Runs one scene through overrides or synthesis and records the outcome
    /// in its status. Returns whether the provider was called.
    pub async fn render_scene(
        &self,
        story: &StoryConfig,
        scene: &mut Scene,
        roster: &CharacterRoster,
        scene_count: usize,
    ) -> Result<bool> {
        scene.image_status.begin()?;

        let ctx = OverrideContext { story, scene_count };
        if let Some((name, url)) = find_override(scene, &ctx) {
            info!("Scene {}: using {} image {}", scene.order, name, url);
            scene.image_url = Some(url);
            scene.image_status.complete()?;
            return Ok(false);
        }

        let outcome = match self.synthesize(scene, story, roster).await {
            Ok(bytes) => {
                let path = self.image_path(&story.id, scene.order, &bytes);
                self.storage.write(&path, &bytes).await.map(|_| path)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(path) => {
                scene.image_url = Some(path);
                scene.image_status.complete()?;
                Ok(true)
            }
            Err(e) => {
                scene.image_status.fail(format!("{:#}", e))?;
                Err(e)
            }
        }
    }

    /// Generates images for every scene, strictly in order. A failed scene is
    /// recorded and the batch moves on. Completed scenes are skipped unless
    /// `force` is set.
    pub async fn generate_all(
        &self,
        store: &dyn StoryStore,
        story: &StoryConfig,
        force: bool,
        cancel: &CancelFlag,
        progress: Option<&ProgressBar>,
    ) -> Result<BatchReport> {
        let roster = store.load_characters(&story.id).await?;
        let scenes = store.load_scenes(&story.id).await?;
        let scene_count = scenes.len();
        let mut report = BatchReport::default();

        for mut scene in scenes {
            if cancel.is_cancelled() {
                info!("Image generation cancelled before scene {}", scene.order);
                break;
            }
            if !force && scene.image_url.is_some() && scene.image_status == GenerationStatus::Complete {
                report.skipped += 1;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                continue;
            }
            if scene.image_status == GenerationStatus::Generating {
                scene.image_status = GenerationStatus::Pending;
            }

            match self.render_scene(story, &mut scene, &roster, scene_count).await {
                Ok(called) => {
                    report.complete += 1;
                    if called {
                        store.increment_usage(&story.id, UsageKind::Image).await?;
                    }
                }
                Err(e) => {
                    error!("Scene {} image failed: {:#}", scene.order, e);
                    report.error += 1;
                }
            }
            store.update_scene(&story.id, &scene).await?;
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }

        info!(
            "Images: {} complete, {} failed, {} already done",
            report.complete, report.error, report.skipped
        );
        Ok(report)
    }

    /// Regenerates a single scene's image. Other scenes are not loaded for
    /// writing and are left as they are.
    pub async fn regenerate_scene(&self, store: &dyn StoryStore, story: &StoryConfig, order: usize) -> Result<Scene> {
        let roster = store.load_characters(&story.id).await?;
        let scenes = store.load_scenes(&story.id).await?;
        let scene_count = scenes.len();
        let mut scene = scenes
            .into_iter()
            .find(|s| s.order == order)
            .ok_or_else(|| crate::core::error::StoryError::NotFound(format!("scene {}", order)))?;
        if scene.image_status == GenerationStatus::Generating {
            scene.image_status = GenerationStatus::Pending;
        }

        let result = self.render_scene(story, &mut scene, &roster, scene_count).await;
        store.update_scene(&story.id, &scene).await?;
        if result? {
            store.increment_usage(&story.id, UsageKind::Image).await?;
        }
        Ok(scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorClass, StoryError};
    use crate::core::io::NativeStorage;
    use crate::core::model::Emotion;
    use crate::core::store::JsonStoryStore;
    use crate::services::image::ImageProviderConfig;
    use crate::utils::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        prompt: String,
        references: usize,
    }

    /// Pops a scripted error per call, succeeding once the script is empty.
    #[derive(Debug, Default)]
    struct MockImages {
        calls: Arc<Mutex<Vec<Call>>>,
        script: Arc<Mutex<VecDeque<StoryError>>>,
        fail_prompt: Option<String>,
        payload: Option<Vec<u8>>,
    }

    impl MockImages {
        fn record(&self, prompt: &str, references: usize) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(Call {
                prompt: prompt.to_string(),
                references,
            });
            if let Some(needle) = &self.fail_prompt {
                if prompt.contains(needle.as_str()) {
                    return Err(StoryError::ContentPolicy("safety system".into()).into());
                }
            }
            match self.script.lock().unwrap().pop_front() {
                Some(e) => Err(e.into()),
                None => Ok(self.payload.clone().unwrap_or_else(|| b"png".to_vec())),
            }
        }
    }

    #[async_trait]
    impl ImageClient for MockImages {
        async fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
            self.record(prompt, 0)
        }

        async fn generate_with_references(&self, prompt: &str, references: &[ReferenceImage]) -> Result<Vec<u8>> {
            self.record(prompt, references.len())
        }
    }

    fn image_config() -> ImageConfig {
        ImageConfig {
            provider: ImageProviderConfig {
                provider: "openai".into(),
                openai: None,
                gemini: None,
            },
            max_references: 5,
            max_prompt_chars: 400,
            retry: RetryPolicy {
                base_delay_ms: 0,
                ..Default::default()
            },
        }
    }

    fn story() -> StoryConfig {
        serde_yaml_ng::from_str("id: s1\ntitle: Pip\ntarget_duration_minutes: 2").unwrap()
    }

    fn character(name: &str, status: CharacterStatus, reference: Option<&str>) -> CharacterDescriptor {
        CharacterDescriptor {
            name: name.into(),
            species: "fox".into(),
            full_description: format!("{} is small and round with a striped scarf", name),
            status,
            reference_image: reference.map(String::from),
            ..Default::default()
        }
    }

    fn scene_with(order: usize, names: &[&str]) -> Scene {
        let mut scene = Scene::new(order, &format!("Narration {}", order), &format!("Visual {}", order));
        scene.character_names = names.iter().map(|s| s.to_string()).collect();
        scene
    }

    #[test]
    fn test_protagonist_once_supporting_twice() {
        let mut roster = CharacterRoster::default();
        roster.upsert(character("Pip", CharacterStatus::Protagonist, Some("pip.png")));
        roster.upsert(character("Olive", CharacterStatus::Supporting, Some("olive.png")));
        roster.upsert(character("Bram", CharacterStatus::Supporting, Some("bram.png")));

        let scene = scene_with(1, &["Olive", "Pip", "Bram"]);
        let chars = scene_characters(&scene, &roster);
        assert_eq!(chars[0].name, "Pip");

        let plan = reference_plan(&chars, 10);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.iter().filter(|p| *p == "pip.png").count(), 1);
        assert_eq!(plan.iter().filter(|p| *p == "olive.png").count(), 2);
        assert_eq!(plan.iter().filter(|p| *p == "bram.png").count(), 2);

        let capped = reference_plan(&chars, 3);
        assert_eq!(capped, vec!["pip.png", "bram.png", "bram.png"]);
    }

    #[test]
    fn test_protagonist_marker_resolves_to_first_reference() {
        let mut roster = CharacterRoster::default();
        roster.upsert(character("Olive", CharacterStatus::Supporting, None));
        roster.upsert(character("Pip", CharacterStatus::Protagonist, Some("pip.png")));

        let scene = scene_with(1, &["Protagonist", "Nobody"]);
        let chars = scene_characters(&scene, &roster);
        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].name, "Pip");
    }

    #[test]
    fn test_prompt_resolution() {
        let mut scene = scene_with(1, &[]);
        scene.image_prompt = Some("  stored prompt ".into());
        assert_eq!(resolve_prompt(&scene, &[], "ink", 400), "stored prompt");

        scene.image_prompt = None;
        scene.emotion = Emotion::Mysterious;
        let long = CharacterDescriptor {
            name: "Pip".into(),
            full_description: "a very detailed fox ".repeat(100),
            ..Default::default()
        };
        let prompt = resolve_prompt(&scene, &[&long], "ink", 400);
        assert!(char_len(&prompt) <= 400);
        assert!(prompt.starts_with("ink illustration. Visual 1 Mood: mysterious."));
        assert!(prompt.contains("Pip ("));
    }

    #[test]
    fn test_overrides() {
        let mut story = story();
        story.cover_image_url = Some("cover.png".into());
        story.ending_image_url = Some("end.png".into());
        let ctx = OverrideContext {
            story: &story,
            scene_count: 3,
        };
        assert_eq!(find_override(&scene_with(1, &[]), &ctx), Some(("cover", "cover.png".into())));
        assert_eq!(find_override(&scene_with(2, &[]), &ctx), None);
        assert_eq!(find_override(&scene_with(3, &[]), &ctx), Some(("ending", "end.png".into())));
    }

    async fn seeded(dir: &tempfile::TempDir, scenes: Vec<Scene>) -> Result<(Arc<NativeStorage>, JsonStoryStore)> {
        let storage = Arc::new(NativeStorage::new());
        let store = JsonStoryStore::new(&dir.path().to_string_lossy(), storage.clone());
        store.replace_scenes("s1", scenes).await?;
        Ok((storage, store))
    }

    #[tokio::test]
    async fn test_batch_tolerates_policy_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, (1..=3).map(|i| scene_with(i, &[])).collect()).await?;
        let images = MockImages {
            fail_prompt: Some("Visual 2".into()),
            ..Default::default()
        };
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);

        let report = orchestrator
            .generate_all(&store, &story(), false, &CancelFlag::new(), None)
            .await?;
        assert_eq!(report, BatchReport { complete: 2, error: 1, skipped: 0 });
        // content policy is surfaced without retry
        assert_eq!(images.calls.lock().unwrap().len(), 3);

        let scenes = store.load_scenes("s1").await?;
        assert_eq!(scenes[0].image_status, GenerationStatus::Complete);
        assert!(scenes[1].image_status.is_error());
        assert!(scenes[1].image_url.is_none());
        assert_eq!(scenes[2].image_status, GenerationStatus::Complete);
        assert!(storage.exists(scenes[2].image_url.as_deref().unwrap()).await?);
        assert_eq!(scenes[1].narration_text, "Narration 2");
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_overload_retried() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, vec![scene_with(1, &[])]).await?;
        let images = MockImages::default();
        images.script.lock().unwrap().extend([
            StoryError::TransientService("529 overloaded".into()),
            StoryError::TransientService("529 overloaded".into()),
        ]);
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        let report = orchestrator
            .generate_all(&store, &story(), false, &CancelFlag::new(), None)
            .await?;
        assert_eq!(report.complete, 1);
        assert_eq!(images.calls.lock().unwrap().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_overrides_recorded_as_generated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, (1..=3).map(|i| scene_with(i, &[])).collect()).await?;
        let images = MockImages::default();
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        let mut story = story();
        story.cover_image_url = Some("cover.png".into());
        story.ending_image_url = Some("end.png".into());

        let report = orchestrator
            .generate_all(&store, &story, false, &CancelFlag::new(), None)
            .await?;
        assert_eq!(report.complete, 3);
        assert_eq!(images.calls.lock().unwrap().len(), 1);
        let scenes = store.load_scenes("s1").await?;
        assert_eq!(scenes[0].image_url.as_deref(), Some("cover.png"));
        assert_eq!(scenes[2].image_url.as_deref(), Some("end.png"));
        assert!(scenes.iter().all(|s| s.image_status == GenerationStatus::Complete));
        Ok(())
    }

    #[tokio::test]
    async fn test_references_submitted_from_storage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, vec![scene_with(1, &["Pip", "Olive"])]).await?;
        let pip = dir.path().join("pip.png").to_string_lossy().to_string();
        let olive = dir.path().join("olive.png").to_string_lossy().to_string();
        storage.write(&pip, b"p").await?;
        storage.write(&olive, b"o").await?;
        store
            .upsert_character("s1", &character("Pip", CharacterStatus::Protagonist, Some(&pip)))
            .await?;
        store
            .upsert_character("s1", &character("Olive", CharacterStatus::Supporting, Some(&olive)))
            .await?;

        let images = MockImages::default();
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        orchestrator
            .generate_all(&store, &story(), false, &CancelFlag::new(), None)
            .await?;
        let calls = images.calls.lock().unwrap();
        assert_eq!(calls[0].references, 3);
        assert!(calls[0].prompt.contains("Olive ("));
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_single_scene() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, (1..=3).map(|i| scene_with(i, &[])).collect()).await?;
        let images = MockImages::default();
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        orchestrator
            .generate_all(&store, &story(), false, &CancelFlag::new(), None)
            .await?;
        let before = store.load_scenes("s1").await?;

        let scene = orchestrator.regenerate_scene(&store, &story(), 2).await?;
        assert_eq!(scene.image_status, GenerationStatus::Complete);
        assert_eq!(images.calls.lock().unwrap().len(), 4);

        let after = store.load_scenes("s1").await?;
        assert_eq!(before[0], after[0]);
        assert_eq!(before[2], after[2]);
        assert_eq!(after[1].narration_text, before[1].narration_text);
        assert_eq!(after[1].visual_description, before[1].visual_description);

        // a second batch run skips everything
        let report = orchestrator
            .generate_all(&store, &story(), false, &CancelFlag::new(), None)
            .await?;
        assert_eq!(report.skipped, 3);

        let err = orchestrator.regenerate_scene(&store, &story(), 9).await.unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_between_scenes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, (1..=3).map(|i| scene_with(i, &[])).collect()).await?;
        let images = MockImages::default();
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = orchestrator.generate_all(&store, &story(), false, &cancel, None).await?;
        assert_eq!(report, BatchReport::default());
        assert!(images.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_jpeg_payload_keeps_its_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let (storage, store) = seeded(&dir, vec![scene_with(1, &[])]).await?;
        let images = MockImages {
            payload: Some(vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0]),
            ..Default::default()
        };
        let orchestrator = ImageOrchestrator::new(image_config(), &images, storage.as_ref(), &root);
        let scene = orchestrator.regenerate_scene(&store, &story(), 1).await?;
        let url = scene.image_url.unwrap();
        assert!(url.ends_with("scene_001.jpg"), "{}", url);
        assert!(storage.exists(&url).await?);
        Ok(())
    }
}
