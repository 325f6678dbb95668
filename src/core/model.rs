use crate::core::error::StoryError;
use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const MIN_SCENE_SECONDS: u32 = 10;
pub const MAX_SCENE_SECONDS: u32 = 30;

// --- Story ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoryConfig {
    pub id: String,
    pub title: String,
    pub target_duration_minutes: u32,
    #[serde(default)]
    pub target_scene_count: Option<usize>,
    #[serde(default = "default_age_group")]
    pub age_group: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_visual_style")]
    pub visual_style: String,
    /// Previously chosen cover illustration, reused for the first scene.
    #[serde(default)]
    pub cover_image_url: Option<String>,
    /// Library-selected ending card, reused for the last scene.
    #[serde(default)]
    pub ending_image_url: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

fn default_age_group() -> String {
    "4-7".to_string()
}
fn default_tone() -> String {
    "warm".to_string()
}
fn default_visual_style() -> String {
    "soft watercolor picture-book".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Story {
    pub config: StoryConfig,
    #[serde(default)]
    pub narration_text: Option<String>,
    #[serde(default)]
    pub narration_audio_url: Option<String>,
    #[serde(default)]
    pub final_video_url: Option<String>,
}

impl Story {
    pub fn new(config: StoryConfig) -> Self {
        Self {
            config,
            narration_text: None,
            narration_audio_url: None,
            final_video_url: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

// --- Emotion & speech style ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Excited,
    #[default]
    Calm,
    Mysterious,
    Loving,
    Scared,
}

// Near terms the models tend to produce, snapped onto the vocabulary.
const EMOTION_SYNONYMS: &[(&str, Emotion)] = &[
    ("happy", Emotion::Happy),
    ("joy", Emotion::Happy),
    ("joyful", Emotion::Happy),
    ("cheerful", Emotion::Happy),
    ("playful", Emotion::Happy),
    ("glad", Emotion::Happy),
    ("funny", Emotion::Happy),
    ("sad", Emotion::Sad),
    ("sadness", Emotion::Sad),
    ("melancholy", Emotion::Sad),
    ("lonely", Emotion::Sad),
    ("gloomy", Emotion::Sad),
    ("excited", Emotion::Excited),
    ("excitement", Emotion::Excited),
    ("thrilled", Emotion::Excited),
    ("adventurous", Emotion::Excited),
    ("energetic", Emotion::Excited),
    ("triumphant", Emotion::Excited),
    ("calm", Emotion::Calm),
    ("peaceful", Emotion::Calm),
    ("serene", Emotion::Calm),
    ("relaxed", Emotion::Calm),
    ("sleepy", Emotion::Calm),
    ("neutral", Emotion::Calm),
    ("mysterious", Emotion::Mysterious),
    ("mystery", Emotion::Mysterious),
    ("curious", Emotion::Mysterious),
    ("wonder", Emotion::Mysterious),
    ("magical", Emotion::Mysterious),
    ("loving", Emotion::Loving),
    ("love", Emotion::Loving),
    ("warm", Emotion::Loving),
    ("tender", Emotion::Loving),
    ("grateful", Emotion::Loving),
    ("scared", Emotion::Scared),
    ("afraid", Emotion::Scared),
    ("fear", Emotion::Scared),
    ("fearful", Emotion::Scared),
    ("nervous", Emotion::Scared),
    ("tense", Emotion::Scared),
    ("worried", Emotion::Scared),
];

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Excited,
        Emotion::Calm,
        Emotion::Mysterious,
        Emotion::Loving,
        Emotion::Scared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Excited => "excited",
            Emotion::Calm => "calm",
            Emotion::Mysterious => "mysterious",
            Emotion::Loving => "loving",
            Emotion::Scared => "scared",
        }
    }

    /// Snaps free-form model output onto the vocabulary. Returns `None` for
    /// terms with no known neighbour.
    pub fn snap(raw: &str) -> Option<Emotion> {
        let cleaned: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphabetic() || c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        if let Some((_, e)) = EMOTION_SYNONYMS.iter().find(|(k, _)| *k == cleaned) {
            return Some(*e);
        }
        // "very happy", "a little scared": first word that is a known term wins
        cleaned.split_whitespace().find_map(|word| {
            EMOTION_SYNONYMS
                .iter()
                .find(|(k, _)| *k == word)
                .map(|(_, e)| *e)
        })
    }

    pub fn speech_style(&self) -> SpeechStyle {
        match self {
            Emotion::Happy => SpeechStyle::Cheerfully,
            Emotion::Sad => SpeechStyle::Sadly,
            Emotion::Excited => SpeechStyle::Excitedly,
            Emotion::Calm => SpeechStyle::Calmly,
            Emotion::Mysterious => SpeechStyle::Mysteriously,
            Emotion::Loving => SpeechStyle::Warmly,
            Emotion::Scared => SpeechStyle::Mysteriously,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStyle {
    #[default]
    Warmly,
    Cheerfully,
    Excitedly,
    Calmly,
    Mysteriously,
    Sadly,
}

impl SpeechStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechStyle::Warmly => "warmly",
            SpeechStyle::Cheerfully => "cheerfully",
            SpeechStyle::Excitedly => "excitedly",
            SpeechStyle::Calmly => "calmly",
            SpeechStyle::Mysteriously => "mysteriously",
            SpeechStyle::Sadly => "sadly",
        }
    }
}

// --- Generation status ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum GenerationStatus {
    #[default]
    Pending,
    Generating,
    Complete,
    Error(String),
}

impl GenerationStatus {
    /// pending|error|complete -> generating. A completed artifact may be regenerated.
    pub fn begin(&mut self) -> Result<()> {
        match self {
            GenerationStatus::Generating => {
                Err(StoryError::Precondition("generation already in progress".into()).into())
            }
            _ => {
                *self = GenerationStatus::Generating;
                Ok(())
            }
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        self.finish(GenerationStatus::Complete)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.finish(GenerationStatus::Error(message.into()))
    }

    fn finish(&mut self, next: GenerationStatus) -> Result<()> {
        if *self != GenerationStatus::Generating {
            return Err(StoryError::Precondition(format!(
                "cannot move from {:?} to {:?}",
                self, next
            ))
            .into());
        }
        *self = next;
        Ok(())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, GenerationStatus::Error(_))
    }
}

// --- Scene ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Scene {
    pub order: usize,
    pub narration_text: String,
    pub visual_description: String,
    pub emotion: Emotion,
    pub duration_estimate_seconds: u32,
    #[serde(default)]
    pub character_names: BTreeSet<String>,
    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_status: GenerationStatus,
    #[serde(default)]
    pub audio_status: GenerationStatus,
}

impl Scene {
    pub fn new(order: usize, narration_text: &str, visual_description: &str) -> Self {
        Self {
            order,
            narration_text: narration_text.to_string(),
            visual_description: visual_description.to_string(),
            emotion: Emotion::default(),
            duration_estimate_seconds: MIN_SCENE_SECONDS,
            character_names: BTreeSet::new(),
            image_prompt: None,
            image_url: None,
            audio_url: None,
            image_status: GenerationStatus::Pending,
            audio_status: GenerationStatus::Pending,
        }
    }

    /// Replaces the text fields. The derived prompt is dropped so the next
    /// image run rebuilds it; attached artifacts stay until regenerated.
    pub fn edit_text(&mut self, narration_text: Option<&str>, visual_description: Option<&str>) {
        if let Some(text) = narration_text {
            self.narration_text = text.to_string();
        }
        if let Some(visual) = visual_description {
            self.visual_description = visual.to_string();
            self.image_prompt = None;
        }
    }
}

pub fn clamp_duration(seconds: f64) -> u32 {
    if !seconds.is_finite() {
        return MIN_SCENE_SECONDS;
    }
    (seconds.round() as i64).clamp(MIN_SCENE_SECONDS as i64, MAX_SCENE_SECONDS as i64) as u32
}

/// Sorts by current order and rewrites orders as 1..N.
pub fn renumber(scenes: &mut [Scene]) {
    scenes.sort_by_key(|s| s.order);
    for (i, scene) in scenes.iter_mut().enumerate() {
        scene.order = i + 1;
    }
}

pub fn is_contiguous(scenes: &[Scene]) -> bool {
    let mut orders: Vec<usize> = scenes.iter().map(|s| s.order).collect();
    orders.sort_unstable();
    orders.iter().enumerate().all(|(i, o)| *o == i + 1)
}

fn position_of(scenes: &[Scene], order: usize) -> Result<usize> {
    scenes
        .iter()
        .position(|s| s.order == order)
        .ok_or_else(|| StoryError::NotFound(format!("scene {}", order)).into())
}

/// Moves the scene currently at `from` so that it ends up at `to`.
pub fn move_scene(scenes: &mut Vec<Scene>, from: usize, to: usize) -> Result<()> {
    renumber(scenes);
    let idx = position_of(scenes, from)?;
    if to == 0 || to > scenes.len() {
        return Err(StoryError::Precondition(format!(
            "target position {} outside 1..={}",
            to,
            scenes.len()
        ))
        .into());
    }
    let scene = scenes.remove(idx);
    scenes.insert(to - 1, scene);
    for (i, s) in scenes.iter_mut().enumerate() {
        s.order = i + 1;
    }
    Ok(())
}

pub fn remove_scene(scenes: &mut Vec<Scene>, order: usize) -> Result<Scene> {
    renumber(scenes);
    let idx = position_of(scenes, order)?;
    let removed = scenes.remove(idx);
    renumber(scenes);
    Ok(removed)
}

/// Inserts `scene` at position `at` (1-based, `len + 1` appends).
pub fn insert_scene(scenes: &mut Vec<Scene>, at: usize, scene: Scene) -> Result<()> {
    renumber(scenes);
    if at == 0 || at > scenes.len() + 1 {
        return Err(StoryError::Precondition(format!("insert position {} out of range", at)).into());
    }
    scenes.insert(at - 1, scene);
    for (i, s) in scenes.iter_mut().enumerate() {
        s.order = i + 1;
    }
    Ok(())
}

// --- Characters ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CharacterStatus {
    Protagonist,
    #[default]
    Supporting,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CharacterDescriptor {
    pub name: String,
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub main_colors: String,
    #[serde(default)]
    pub clothing: String,
    #[serde(default)]
    pub accessories: String,
    #[serde(default)]
    pub full_description: String,
    #[serde(default)]
    pub status: CharacterStatus,
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub reference_status: GenerationStatus,
}

/// Characters keyed by name, kept in extraction order.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CharacterRoster {
    pub characters: IndexMap<String, CharacterDescriptor>,
}

impl CharacterRoster {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    /// Case-insensitive lookup; scene character lists rarely match casing exactly.
    pub fn get(&self, name: &str) -> Option<&CharacterDescriptor> {
        self.characters.get(name).or_else(|| {
            self.characters
                .values()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        })
    }

    pub fn upsert(&mut self, descriptor: CharacterDescriptor) {
        self.characters.insert(descriptor.name.clone(), descriptor);
    }

    pub fn first_with_reference(&self) -> Option<&CharacterDescriptor> {
        self.characters.values().find(|c| c.reference_image.is_some())
    }
}

// --- Video assembly ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClipSource {
    pub order: usize,
    pub image_url: Option<String>,
    pub duration_seconds: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VideoAssemblyJob {
    pub clips: Vec<ClipSource>,
    pub narration_track: Option<String>,
}

impl VideoAssemblyJob {
    pub fn from_scenes(scenes: &[Scene], narration_track: Option<String>) -> Self {
        let mut ordered: Vec<&Scene> = scenes.iter().collect();
        ordered.sort_by_key(|s| s.order);
        Self {
            clips: ordered
                .into_iter()
                .map(|s| ClipSource {
                    order: s.order,
                    image_url: s.image_url.clone(),
                    duration_seconds: s.duration_estimate_seconds,
                })
                .collect(),
            narration_track,
        }
    }

    pub fn total_seconds(&self) -> u32 {
        self.clips.iter().map(|c| c.duration_seconds).sum()
    }

    /// Fails unless there is at least one clip and every clip has an image.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.clips.is_empty() {
            return Err(StoryError::Precondition("no scenes to assemble".into()).into());
        }
        let missing: Vec<String> = self
            .clips
            .iter()
            .filter(|c| c.image_url.is_none())
            .map(|c| c.order.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StoryError::Precondition(format!("scenes without image: {}", missing.join(", "))).into());
        }
        Ok(())
    }
}

// --- Batch runs ---

/// Aggregate outcome of a sequential per-item batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub complete: usize,
    pub error: usize,
    pub skipped: usize,
}

/// Checked between items; a running call is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenes(n: usize) -> Vec<Scene> {
        (1..=n)
            .map(|i| Scene::new(i, &format!("text {}", i), &format!("visual {}", i)))
            .collect()
    }

    #[test]
    fn test_emotion_snapping() {
        assert_eq!(Emotion::snap("Joyful"), Some(Emotion::Happy));
        assert_eq!(Emotion::snap("  SCARED! "), Some(Emotion::Scared));
        assert_eq!(Emotion::snap("a little nervous"), Some(Emotion::Scared));
        assert_eq!(Emotion::snap("curious"), Some(Emotion::Mysterious));
        assert_eq!(Emotion::snap("bureaucratic"), None);
        assert_eq!(Emotion::snap(""), None);
        for e in Emotion::ALL {
            assert_eq!(Emotion::snap(e.as_str()), Some(e));
        }
    }

    #[test]
    fn test_clamp_duration() {
        assert_eq!(clamp_duration(3.0), 10);
        assert_eq!(clamp_duration(45.0), 30);
        assert_eq!(clamp_duration(17.4), 17);
        assert_eq!(clamp_duration(f64::NAN), 10);
    }

    #[test]
    fn test_status_transitions() {
        let mut status = GenerationStatus::default();
        assert!(status.complete().is_err());
        status.begin().unwrap();
        assert!(status.begin().is_err());
        status.fail("boom").unwrap();
        assert!(status.is_error());
        status.begin().unwrap();
        status.complete().unwrap();
        assert_eq!(status, GenerationStatus::Complete);
    }

    #[test]
    fn test_move_scene_keeps_permutation() {
        let mut list = scenes(5);
        move_scene(&mut list, 5, 1).unwrap();
        assert!(is_contiguous(&list));
        assert_eq!(list[0].narration_text, "text 5");
        move_scene(&mut list, 2, 4).unwrap();
        assert!(is_contiguous(&list));
        assert_eq!(list[3].narration_text, "text 1");
        assert!(move_scene(&mut list, 1, 9).is_err());
    }

    #[test]
    fn test_remove_and_insert_renumber() {
        let mut list = scenes(4);
        let removed = remove_scene(&mut list, 2).unwrap();
        assert_eq!(removed.narration_text, "text 2");
        assert!(is_contiguous(&list));
        insert_scene(&mut list, 1, Scene::new(99, "new", "new")).unwrap();
        assert!(is_contiguous(&list));
        assert_eq!(list[0].narration_text, "new");
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_renumber_from_gappy_source() {
        let mut list = vec![Scene::new(7, "b", "b"), Scene::new(3, "a", "a"), Scene::new(12, "c", "c")];
        renumber(&mut list);
        let orders: Vec<usize> = list.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(list[0].narration_text, "a");
    }

    #[test]
    fn test_edit_text_keeps_artifacts() {
        let mut scene = Scene::new(1, "old", "old visual");
        scene.image_prompt = Some("prompt".into());
        scene.image_url = Some("img.png".into());
        scene.edit_text(None, Some("new visual"));
        assert_eq!(scene.image_prompt, None);
        assert_eq!(scene.image_url.as_deref(), Some("img.png"));
    }

    #[test]
    fn test_roster_first_with_reference() {
        let mut roster = CharacterRoster::default();
        roster.upsert(CharacterDescriptor { name: "Owl".into(), ..Default::default() });
        roster.upsert(CharacterDescriptor {
            name: "Fox".into(),
            reference_image: Some("fox.png".into()),
            ..Default::default()
        });
        assert_eq!(roster.first_with_reference().unwrap().name, "Fox");
        assert_eq!(roster.get("fox").unwrap().name, "Fox");
    }
}
