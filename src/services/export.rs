use crate::core::io::Storage;
use crate::core::model::{Scene, Story};
use crate::services::video::fetch_source;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingAssets {
    pub order: usize,
    pub image: bool,
    pub audio: bool,
}

/// Script text, scene assets and usage notes for manual editing elsewhere.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub title: String,
    pub script: String,
    pub instructions: String,
    pub images: Vec<(usize, String)>,
    pub audio: Vec<(usize, String)>,
    pub missing: Vec<MissingAssets>,
}

fn extension_of(source: &str, fallback: &str) -> String {
    Path::new(source.split('?').next().unwrap_or(source))
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 4)
        .unwrap_or(fallback)
        .to_string()
}

fn render_instructions(title: &str, missing: &[MissingAssets]) -> String {
    let mut instructions = format!(
        "{}\n\nThis folder holds everything needed to edit the video by hand.\n\
         - script.txt: narration and picture notes, one block per scene\n\
         - images/scene_NNN.*: one illustration per scene\n\
         - audio/scene_NNN.*: one narration clip per scene\n\n\
         Place each image on the timeline for the length of its audio clip, in scene order.\n",
        title
    );
    if missing.is_empty() {
        instructions.push_str("\nAll scenes have an image and an audio clip.\n");
    } else {
        instructions.push_str("\nIncomplete. Missing assets:\n");
        for m in missing {
            let what = match (m.image, m.audio) {
                (true, true) => "image and audio",
                (true, false) => "image",
                _ => "audio",
            };
            instructions.push_str(&format!("- scene {}: {}\n", m.order, what));
        }
    }
    instructions
}

fn is_remote(source: &str) -> bool {
    Url::parse(source).is_ok_and(|u| u.scheme() == "http" || u.scheme() == "https")
}

impl ExportBundle {
    pub fn build(story: &Story, scenes: &[Scene]) -> Self {
        let mut ordered: Vec<&Scene> = scenes.iter().collect();
        ordered.sort_by_key(|s| s.order);

        let mut script = format!("{}\n\n", story.config.title);
        let mut images = Vec::new();
        let mut audio = Vec::new();
        let mut missing = Vec::new();

        for scene in &ordered {
            script.push_str(&format!(
                "Scene {} ({}, ~{}s)\n{}\n[Picture: {}]\n\n",
                scene.order,
                scene.emotion.as_str(),
                scene.duration_estimate_seconds,
                scene.narration_text.trim(),
                scene.visual_description.trim()
            ));
            if let Some(url) = &scene.image_url {
                images.push((scene.order, url.clone()));
            }
            if let Some(url) = &scene.audio_url {
                audio.push((scene.order, url.clone()));
            }
            if scene.image_url.is_none() || scene.audio_url.is_none() {
                missing.push(MissingAssets {
                    order: scene.order,
                    image: scene.image_url.is_none(),
                    audio: scene.audio_url.is_none(),
                });
            }
        }

        let instructions = render_instructions(&story.config.title, &missing);

        Self {
            title: story.config.title.clone(),
            script,
            instructions,
            images,
            audio,
            missing,
        }
    }

    /// Complete when every scene has both an image and an audio asset.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing_orders(&self) -> Vec<usize> {
        self.missing.iter().map(|m| m.order).collect()
    }

    fn mark_missing(&mut self, order: usize, image: bool) {
        match self.missing.iter_mut().find(|m| m.order == order) {
            Some(m) if image => m.image = true,
            Some(m) => m.audio = true,
            None => {
                self.missing.push(MissingAssets {
                    order,
                    image,
                    audio: !image,
                });
                self.missing.sort_by_key(|m| m.order);
            }
        }
    }

    async fn copy_asset(&self, http: &reqwest::Client, storage: &dyn Storage, source: &str, dest: &Path) -> Result<()> {
        if is_remote(source) {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            return fetch_source(http, storage, source, dest).await;
        }
        let bytes = storage.read(source).await?;
        storage.write(&dest.to_string_lossy(), &bytes).await
    }

    /// Writes the bundle under `dir`. Assets that cannot be fetched are
    /// logged and reported as missing; returns the number of asset files
    /// written.
    pub async fn write_to(&mut self, storage: &dyn Storage, dir: &str) -> Result<usize> {
        let root = Path::new(dir);
        let http = reqwest::Client::new();

        let mut written = 0;
        let mut failed = Vec::new();
        for (folder, assets, fallback) in [("images", &self.images, "png"), ("audio", &self.audio, "wav")] {
            for (order, source) in assets {
                let dest = root
                    .join(folder)
                    .join(format!("scene_{:03}.{}", order, extension_of(source, fallback)));
                match self.copy_asset(&http, storage, source, &dest).await {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!("Skipping {} for scene {}: {:#}", folder, order, e);
                        failed.push((*order, folder == "images"));
                    }
                }
            }
        }
        for (order, image) in failed {
            self.mark_missing(order, image);
        }
        self.instructions = render_instructions(&self.title, &self.missing);

        let path = |p: &Path| p.to_string_lossy().to_string();
        storage.write(&path(&root.join("script.txt")), self.script.as_bytes()).await?;
        storage
            .write(&path(&root.join("README.txt")), self.instructions.as_bytes())
            .await?;
        info!("Exported {} assets to {}", written, dir);
        Ok(written)
    }
}
