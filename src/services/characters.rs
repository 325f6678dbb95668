//! Character descriptors and their reference illustrations.

use crate::core::io::Storage;
use crate::core::model::{
    BatchReport, CancelFlag, CharacterDescriptor, CharacterRoster, CharacterStatus, GenerationStatus,
};
use crate::core::store::{StoryStore, UsageKind};
use crate::services::image::{extension_of, ImageClient};
use crate::services::llm::{chat_with_retry, LlmClient};
use crate::utils::json_repair::parse_object;
use crate::utils::retry::{with_backoff, RetryPolicy};
use anyhow::Result;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Deserialize)]
struct RawRoster {
    #[serde(default)]
    characters: Vec<RawCharacter>,
}

#[derive(Deserialize)]
struct RawCharacter {
    name: String,
    #[serde(default)]
    species: String,
    #[serde(default, alias = "mainColors", alias = "colors")]
    main_colors: Value,
    #[serde(default)]
    clothing: String,
    #[serde(default)]
    accessories: String,
    #[serde(default, alias = "fullDescription", alias = "description")]
    full_description: String,
    #[serde(default, alias = "role")]
    status: String,
}

fn flatten_colors(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

impl From<RawCharacter> for CharacterDescriptor {
    fn from(raw: RawCharacter) -> Self {
        let status = if raw.status.trim().eq_ignore_ascii_case("protagonist")
            || raw.status.to_lowercase().contains("main")
        {
            CharacterStatus::Protagonist
        } else {
            CharacterStatus::Supporting
        };
        CharacterDescriptor {
            name: raw.name.trim().to_string(),
            species: raw.species,
            main_colors: flatten_colors(raw.main_colors),
            clothing: raw.clothing,
            accessories: raw.accessories,
            full_description: raw.full_description,
            status,
            reference_image: None,
            reference_status: GenerationStatus::Pending,
        }
    }
}

/// File-name safe form of a character name.
pub fn slug(name: &str) -> String {
    let s: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if s.is_empty() {
        "character".to_string()
    } else {
        s
    }
}

pub fn parse_roster(raw: &str) -> Result<CharacterRoster> {
    let parsed: RawRoster = parse_object(raw)?;
    let mut roster = CharacterRoster::default();
    for character in parsed.characters {
        if character.name.trim().is_empty() {
            continue;
        }
        roster.upsert(character.into());
    }
    Ok(roster)
}

pub struct CharacterRegistry<'a> {
    llm: &'a dyn LlmClient,
    images: &'a dyn ImageClient,
    storage: &'a dyn Storage,
    text_retry: RetryPolicy,
    image_retry: RetryPolicy,
    visual_style: String,
    artifact_root: String,
}

impl<'a> CharacterRegistry<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        images: &'a dyn ImageClient,
        storage: &'a dyn Storage,
        text_retry: RetryPolicy,
        image_retry: RetryPolicy,
        visual_style: &str,
        artifact_root: &str,
    ) -> Self {
        Self {
            llm,
            images,
            storage,
            text_retry,
            image_retry,
            visual_style: visual_style.to_string(),
            artifact_root: artifact_root.to_string(),
        }
    }

    /// Never fails: an unusable reply leaves the story without references.
    pub async fn extract_characters(&self, text: &str) -> CharacterRoster {
        let prompt = format!(
            "List every recurring character in the story below.\n\
             For each give name, species, main_colors, clothing, accessories, \
             full_description (fixed visual traits only, one or two sentences) and \
             status (\"protagonist\" for the main character, otherwise \"supporting\").\n\
             Return only JSON: {{ \"characters\": [ {{ \"name\": \"...\", \"species\": \"...\", \
             \"main_colors\": \"...\", \"clothing\": \"...\", \"accessories\": \"...\", \
             \"full_description\": \"...\", \"status\": \"protagonist\" }} ] }}\n\n\
             Story:\n{}",
            text
        );
        let reply = match chat_with_retry(
            self.llm,
            &self.text_retry,
            "You are a character designer for illustrated children's books. Reply with JSON only.",
            &prompt,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Character extraction failed, continuing without references: {:#}", e);
                return CharacterRoster::default();
            }
        };
        match parse_roster(&reply) {
            Ok(roster) => {
                info!("Extracted {} characters", roster.len());
                roster
            }
            Err(e) => {
                warn!("Character list unparseable, continuing without references: {:#}", e);
                CharacterRoster::default()
            }
        }
    }

    fn reference_prompt(&self, d: &CharacterDescriptor) -> String {
        let mut traits = vec![d.full_description.clone()];
        for (label, value) in [
            ("species", &d.species),
            ("main colors", &d.main_colors),
            ("clothing", &d.clothing),
            ("accessories", &d.accessories),
        ] {
            if !value.trim().is_empty() {
                traits.push(format!("{}: {}", label, value.trim()));
            }
        }
        format!(
            "Character reference sheet of {}, full body, neutral pose, plain light background. {}. Style: {}.",
            d.name,
            traits
                .into_iter()
                .filter(|t| !t.trim().is_empty())
                .collect::<Vec<_>>()
                .join(". "),
            self.visual_style
        )
    }

    /// Generates and stores the reference image, updating the descriptor's
    /// status either way. Returns the artifact path.
    pub async fn generate_reference(&self, story_id: &str, descriptor: &mut CharacterDescriptor) -> Result<String> {
        descriptor.reference_status.begin()?;
        let prompt = self.reference_prompt(descriptor);
        let label = format!("reference for {}", descriptor.name);
        let result = with_backoff(&self.image_retry, &label, |_| self.images.generate(&prompt)).await;

        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                descriptor.reference_status.fail(format!("{:#}", e))?;
                return Err(e);
            }
        };
        let path = Path::new(&self.artifact_root)
            .join(story_id)
            .join("characters")
            .join(format!("{}.{}", slug(&descriptor.name), extension_of(&bytes)))
            .to_string_lossy()
            .to_string();
        if let Err(e) = self.storage.write(&path, &bytes).await {
            descriptor.reference_status.fail(format!("{:#}", e))?;
            return Err(e);
        }
        descriptor.reference_image = Some(path.clone());
        descriptor.reference_status.complete()?;
        Ok(path)
    }

    /// Generates references for every character still lacking one. Each
    /// outcome is persisted on its own; one failure does not stop the rest.
    pub async fn generate_missing_references(
        &self,
        store: &dyn StoryStore,
        story_id: &str,
        cancel: &CancelFlag,
    ) -> Result<BatchReport> {
        let roster = store.load_characters(story_id).await?;
        let mut report = BatchReport::default();
        for mut descriptor in roster.characters.into_values() {
            if cancel.is_cancelled() {
                info!("Reference generation cancelled");
                break;
            }
            if descriptor.reference_image.is_some() && descriptor.reference_status == GenerationStatus::Complete {
                report.skipped += 1;
                continue;
            }
            if descriptor.reference_status == GenerationStatus::Generating {
                // left over from an interrupted run
                descriptor.reference_status = GenerationStatus::Pending;
            }
            match self.generate_reference(story_id, &mut descriptor).await {
                Ok(path) => {
                    info!("Reference for {} saved to {}", descriptor.name, path);
                    store.increment_usage(story_id, UsageKind::Image).await?;
                    report.complete += 1;
                }
                Err(e) => {
                    error!("Reference for {} failed: {:#}", descriptor.name, e);
                    report.error += 1;
                }
            }
            store.upsert_character(story_id, &descriptor).await?;
        }
        Ok(report)
    }
}
