use crate::core::error::StoryError;
use crate::core::io::Storage;
use crate::core::model::{renumber, CharacterDescriptor, CharacterRoster, Scene, Story};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Text,
    Image,
    Speech,
    Video,
}

/// Persistence contract for story, scene and character records, keyed by story id.
#[async_trait]
pub trait StoryStore: Send + Sync {
    async fn load_story(&self, story_id: &str) -> Result<Option<Story>>;
    async fn save_story(&self, story: &Story) -> Result<()>;
    async fn list_stories(&self) -> Result<Vec<String>>;

    async fn load_scenes(&self, story_id: &str) -> Result<Vec<Scene>>;
    /// Deletes every existing scene of the story, then inserts `scenes`.
    async fn replace_scenes(&self, story_id: &str, scenes: Vec<Scene>) -> Result<()>;
    /// Overwrites the stored scene with the same order.
    async fn update_scene(&self, story_id: &str, scene: &Scene) -> Result<()>;

    async fn load_characters(&self, story_id: &str) -> Result<CharacterRoster>;
    async fn upsert_character(&self, story_id: &str, descriptor: &CharacterDescriptor) -> Result<()>;

    async fn increment_usage(&self, story_id: &str, kind: UsageKind) -> Result<u64>;
}

/// JSON files under `<build>/<story_id>/` written through a `Storage`.
pub struct JsonStoryStore {
    root: String,
    storage: Arc<dyn Storage>,
}

impl JsonStoryStore {
    pub fn new(root: &str, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.to_string(),
            storage,
        }
    }

    fn path(&self, story_id: &str, file: &str) -> String {
        Path::new(&self.root)
            .join(story_id)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(path).await?;
        let value = serde_json::from_slice(&bytes).with_context(|| format!("Corrupt record {}", path))?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.storage.write(path, content.as_bytes()).await
    }
}

#[async_trait]
impl StoryStore for JsonStoryStore {
    async fn load_story(&self, story_id: &str) -> Result<Option<Story>> {
        self.read_json(&self.path(story_id, "story.json")).await
    }

    async fn save_story(&self, story: &Story) -> Result<()> {
        self.write_json(&self.path(story.id(), "story.json"), story).await
    }

    async fn list_stories(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.storage.list(&self.root).await? {
            let story_file = Path::new(&entry).join("story.json");
            if self.storage.exists(&story_file.to_string_lossy()).await? {
                if let Some(name) = Path::new(&entry).file_name() {
                    ids.push(name.to_string_lossy().to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn load_scenes(&self, story_id: &str) -> Result<Vec<Scene>> {
        let mut scenes: Vec<Scene> = self
            .read_json(&self.path(story_id, "scenes.json"))
            .await?
            .unwrap_or_default();
        scenes.sort_by_key(|s| s.order);
        Ok(scenes)
    }

    async fn replace_scenes(&self, story_id: &str, mut scenes: Vec<Scene>) -> Result<()> {
        let path = self.path(story_id, "scenes.json");
        self.storage.delete(&path).await?;
        renumber(&mut scenes);
        self.write_json(&path, &scenes).await
    }

    async fn update_scene(&self, story_id: &str, scene: &Scene) -> Result<()> {
        let mut scenes = self.load_scenes(story_id).await?;
        let slot = scenes
            .iter_mut()
            .find(|s| s.order == scene.order)
            .ok_or_else(|| StoryError::NotFound(format!("scene {} of {}", scene.order, story_id)))?;
        *slot = scene.clone();
        self.write_json(&self.path(story_id, "scenes.json"), &scenes).await
    }

    async fn load_characters(&self, story_id: &str) -> Result<CharacterRoster> {
        Ok(self
            .read_json(&self.path(story_id, "characters.json"))
            .await?
            .unwrap_or_default())
    }

    async fn upsert_character(&self, story_id: &str, descriptor: &CharacterDescriptor) -> Result<()> {
        let mut roster = self.load_characters(story_id).await?;
        roster.upsert(descriptor.clone());
        self.write_json(&self.path(story_id, "characters.json"), &roster).await
    }

    async fn increment_usage(&self, story_id: &str, kind: UsageKind) -> Result<u64> {
        let path = self.path(story_id, "usage.json");
        let mut counters: BTreeMap<UsageKind, u64> = self.read_json(&path).await?.unwrap_or_default();
        let count = counters.entry(kind).or_insert(0);
        *count += 1;
        let value = *count;
        self.write_json(&path, &counters).await?;
        Ok(value)
    }
}
