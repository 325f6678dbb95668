//! Splits narration text into an ordered list of scenes.

use crate::core::error::StoryError;
use crate::core::model::{clamp_duration, Emotion, Scene};
use crate::services::llm::{chat_with_retry, LlmClient};
use crate::utils::json_repair::{
    find_array_for_key, find_balanced, find_first_object, repair_unescaped_quotes, strip_code_fences,
};
use crate::utils::retry::RetryPolicy;
use crate::utils::text::word_count;
use anyhow::Result;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// Narration pace used when the model omits a duration.
const WORDS_PER_SECOND: f64 = 2.5;

/// Allowed scene counts for a target duration in minutes.
pub fn scene_count_bounds(duration_minutes: u32, explicit: Option<usize>) -> RangeInclusive<usize> {
    if let Some(n) = explicit.filter(|n| *n > 0) {
        return n..=n;
    }
    match duration_minutes {
        0..=3 => 6..=8,
        4..=6 => 8..=12,
        _ => 12..=15,
    }
}

#[derive(Debug, Deserialize)]
struct RawDecomposition {
    scenes: Vec<RawScene>,
}

#[derive(Debug, Deserialize)]
struct RawScene {
    #[serde(default, alias = "scene_number", alias = "sceneNumber", alias = "number")]
    order: Option<Value>,
    #[serde(default, alias = "narration", alias = "narrationText", alias = "text")]
    narration_text: String,
    #[serde(
        default,
        alias = "visualDescription",
        alias = "visual",
        alias = "description",
        alias = "illustration"
    )]
    visual_description: String,
    #[serde(default, alias = "mood")]
    emotion: Option<String>,
    #[serde(
        default,
        alias = "durationEstimateSeconds",
        alias = "duration_estimate_seconds",
        alias = "durationEstimate",
        alias = "duration_seconds",
        alias = "duration"
    )]
    duration_estimate: Option<Value>,
    #[serde(default, alias = "characterNames", alias = "character_names")]
    characters: Vec<String>,
    #[serde(default, alias = "imagePrompt")]
    image_prompt: Option<String>,
}

/// Tries, in order: fenced/prose-wrapped object, quote-repaired object, then
/// the scenes array on its own. Returns the last error when all fail.
fn parse_scenes(raw: &str) -> Result<Vec<RawScene>> {
    let stripped = strip_code_fences(raw);

    if let Some(object) = find_first_object(&stripped) {
        match serde_json::from_str::<RawDecomposition>(object) {
            Ok(parsed) => return Ok(parsed.scenes),
            Err(e) => debug!("direct decomposition parse failed: {}", e),
        }
        let repaired = repair_unescaped_quotes(object);
        match serde_json::from_str::<RawDecomposition>(&repaired) {
            Ok(parsed) => return Ok(parsed.scenes),
            Err(e) => debug!("repaired decomposition parse failed: {}", e),
        }
    }

    let array = find_array_for_key(&stripped, "scenes")
        .or_else(|| find_balanced(&stripped, '[', ']'))
        .ok_or_else(|| StoryError::Parse("no scenes object or array in response".into()))?;
    serde_json::from_str::<Vec<RawScene>>(array)
        .or_else(|_| serde_json::from_str::<Vec<RawScene>>(&repair_unescaped_quotes(array)))
        .map_err(|e| StoryError::Parse(format!("scenes array unparseable: {}", e)).into())
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn normalize(raw: Vec<RawScene>) -> Result<Vec<Scene>> {
    // Source numbering only decides the sequence; output is always 1..N.
    let mut indexed: Vec<(f64, usize, RawScene)> = raw
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let key = s.order.as_ref().and_then(number_of).unwrap_or(i as f64 + 1.0);
            (key, i, s)
        })
        .collect();
    indexed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut scenes = Vec::with_capacity(indexed.len());
    for (_, _, raw) in indexed {
        let narration = raw.narration_text.trim().to_string();
        if narration.is_empty() {
            warn!("dropping scene without narration text");
            continue;
        }

        let emotion = match raw.emotion.as_deref() {
            Some(label) => Emotion::snap(label).unwrap_or_else(|| {
                warn!("unknown emotion {:?}, using {}", label, Emotion::default().as_str());
                Emotion::default()
            }),
            None => Emotion::default(),
        };

        let seconds = raw
            .duration_estimate
            .as_ref()
            .and_then(number_of)
            .unwrap_or_else(|| word_count(&narration) as f64 / WORDS_PER_SECOND);

        let visual = raw.visual_description.trim();
        let character_names: BTreeSet<String> = raw
            .characters
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let mut scene = Scene::new(
            scenes.len() + 1,
            &narration,
            if visual.is_empty() { &narration } else { visual },
        );
        scene.emotion = emotion;
        scene.duration_estimate_seconds = clamp_duration(seconds);
        scene.character_names = character_names;
        scene.image_prompt = raw.image_prompt.filter(|p| !p.trim().is_empty());
        scenes.push(scene);
    }

    if scenes.is_empty() {
        return Err(StoryError::Parse("response contained no usable scenes".into()).into());
    }
    Ok(scenes)
}

/// Merges the adjacent pair with the least combined narration until the
/// list fits `max`. Text is concatenated, never dropped.
fn merge_to_fit(scenes: &mut Vec<Scene>, max: usize) {
    while scenes.len() > max && scenes.len() > 1 {
        let idx = (0..scenes.len() - 1)
            .min_by_key(|&i| scenes[i].narration_text.len() + scenes[i + 1].narration_text.len())
            .unwrap_or(0);
        let next = scenes.remove(idx + 1);
        let target = &mut scenes[idx];
        target.narration_text = format!("{} {}", target.narration_text, next.narration_text);
        target.visual_description = format!("{} Then, {}", target.visual_description, next.visual_description);
        target.duration_estimate_seconds =
            clamp_duration((target.duration_estimate_seconds + next.duration_estimate_seconds) as f64);
        target.character_names.extend(next.character_names);
        target.image_prompt = None;
    }
    for (i, s) in scenes.iter_mut().enumerate() {
        s.order = i + 1;
    }
}

pub struct SceneDecomposer<'a> {
    llm: &'a dyn LlmClient,
    retry: RetryPolicy,
}

impl<'a> SceneDecomposer<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub fn build_prompt(text: &str, bounds: &RangeInclusive<usize>, character_names: &[String]) -> String {
        let count = if bounds.start() == bounds.end() {
            format!("exactly {}", bounds.start())
        } else {
            format!("between {} and {}", bounds.start(), bounds.end())
        };
        let vocabulary = Emotion::ALL.map(|e| e.as_str()).join(", ");
        let known = if character_names.is_empty() {
            String::from("(none registered yet)")
        } else {
            character_names.join(", ")
        };
        format!(
            "Split the story below into {count} scenes, in reading order.\n\
             Every sentence of the story must belong to exactly one scene; do not rewrite the narration.\n\
             For each scene give:\n\
             - \"order\": scene number starting at 1\n\
             - \"narration\": the exact story text of the scene\n\
             - \"visual_description\": what the illustration shows (setting, action, composition)\n\
             - \"emotion\": one of [{vocabulary}]\n\
             - \"duration_seconds\": narration length estimate between 10 and 30\n\
             - \"characters\": names of characters visible in the illustration. Known characters: {known}. \
             Use \"protagonist\" for an unnamed main character.\n\
             Return only JSON: {{ \"scenes\": [ {{ \"order\": 1, \"narration\": \"...\", \"visual_description\": \"...\", \
             \"emotion\": \"calm\", \"duration_seconds\": 15, \"characters\": [\"...\"] }} ] }}\n\n\
             Story:\n{text}"
        )
    }

    /// Parses and normalizes a model reply against the scene-count bounds.
    pub fn parse_response(raw: &str, bounds: &RangeInclusive<usize>) -> Result<Vec<Scene>> {
        let mut scenes = normalize(parse_scenes(raw)?)?;
        if scenes.len() > *bounds.end() {
            info!("model returned {} scenes, merging down to {}", scenes.len(), bounds.end());
            merge_to_fit(&mut scenes, *bounds.end());
        }
        if scenes.len() < *bounds.start() {
            return Err(StoryError::Parse(format!(
                "model returned {} scenes, expected at least {}",
                scenes.len(),
                bounds.start()
            ))
            .into());
        }
        Ok(scenes)
    }

    pub async fn decompose(
        &self,
        text: &str,
        duration_minutes: u32,
        target_scene_count: Option<usize>,
        character_names: &[String],
    ) -> Result<Vec<Scene>> {
        if text.trim().is_empty() {
            return Err(StoryError::Precondition("narration text is empty".into()).into());
        }
        let bounds = scene_count_bounds(duration_minutes, target_scene_count);
        info!("Decomposing narration into {:?} scenes", bounds);

        let prompt = Self::build_prompt(text, &bounds, character_names);
        let reply = chat_with_retry(
            self.llm,
            &self.retry,
            "You are a storyboard editor. Reply with valid JSON only.",
            &prompt,
        )
        .await?;
        Self::parse_response(&reply, &bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorClass;
    use crate::core::model::is_contiguous;
    use async_trait::async_trait;

    fn scene_json(n: usize, emotion: &str, duration: &str) -> String {
        format!(
            r#"{{"order": {n}, "narration": "Scene {n} text.", "visual_description": "Picture {n}", "emotion": "{emotion}", "duration_seconds": {duration}, "characters": ["Pip"]}}"#
        )
    }

    fn response(n: usize) -> String {
        let scenes: Vec<String> = (1..=n).map(|i| scene_json(i, "happy", "15")).collect();
        format!(r#"{{"scenes": [{}]}}"#, scenes.join(","))
    }

    #[test]
    fn test_bounds_by_tier() {
        assert_eq!(scene_count_bounds(1, None), 6..=8);
        assert_eq!(scene_count_bounds(3, None), 6..=8);
        assert_eq!(scene_count_bounds(5, None), 8..=12);
        assert_eq!(scene_count_bounds(10, None), 12..=15);
        assert_eq!(scene_count_bounds(10, Some(4)), 4..=4);
        assert_eq!(scene_count_bounds(10, Some(0)), 12..=15);
    }

    #[test]
    fn test_fenced_response_with_trailing_prose() -> Result<()> {
        let raw = format!(
            "Sure! Here is the storyboard:\n```json\n{}\n```\nI hope this {{helps}}!",
            response(6)
        );
        let scenes = SceneDecomposer::parse_response(&raw, &(6..=8))?;
        assert_eq!(scenes.len(), 6);
        assert_eq!(scenes[5].narration_text, "Scene 6 text.");
        Ok(())
    }

    #[test]
    fn test_unescaped_quote_is_repaired() -> Result<()> {
        let mut body = response(6);
        body = body.replacen(
            "Scene 3 text.",
            r#"The owl said "hush" and the forest went still."#,
            1,
        );
        assert!(serde_json::from_str::<Value>(&body).is_err());
        let scenes = SceneDecomposer::parse_response(&body, &(6..=8))?;
        assert_eq!(scenes[2].narration_text, "The owl said \"hush\" and the forest went still.");
        Ok(())
    }

    #[test]
    fn test_quoted_list_in_narration_is_repaired() -> Result<()> {
        let body = response(6).replacen(
            "Scene 2 text.",
            r#"She counted "one", "two", "three" and smiled."#,
            1,
        );
        let scenes = SceneDecomposer::parse_response(&body, &(6..=8))?;
        assert_eq!(scenes.len(), 6);
        assert_eq!(scenes[1].narration_text, r#"She counted "one", "two", "three" and smiled."#);
        assert_eq!(scenes[1].visual_description, "Picture 2");
        Ok(())
    }

    #[test]
    fn test_scenes_array_fallback() -> Result<()> {
        // trailing comma breaks the object; the array itself is intact
        let scenes: Vec<String> = (1..=6).map(|i| scene_json(i, "calm", "12")).collect();
        let raw = format!(r#"{{"title": "x", "scenes": [{}], }}"#, scenes.join(","));
        let parsed = SceneDecomposer::parse_response(&raw, &(6..=8))?;
        assert_eq!(parsed.len(), 6);
        Ok(())
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = SceneDecomposer::parse_response("I cannot help with that.", &(6..=8)).unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::Parse);
        let err = SceneDecomposer::parse_response(r#"{"scenes": [{"order": 1, "narration": "#, &(6..=8)).unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::Parse);
    }

    #[test]
    fn test_normalization_clamps_and_snaps() -> Result<()> {
        let raw = format!(
            r#"{{"scenes": [{}, {}, {}, {}, {}, {}]}}"#,
            scene_json(1, "joyful", "3"),
            scene_json(2, "bureaucratic", "99"),
            scene_json(3, "Scared", "\"20 seconds\""),
            scene_json(4, "calm", "null"),
            scene_json(5, "sad", "10"),
            scene_json(6, "excited", "30"),
        );
        let scenes = SceneDecomposer::parse_response(&raw, &(6..=8))?;
        assert_eq!(scenes[0].emotion, Emotion::Happy);
        assert_eq!(scenes[0].duration_estimate_seconds, 10);
        assert_eq!(scenes[1].emotion, Emotion::Calm);
        assert_eq!(scenes[1].duration_estimate_seconds, 30);
        assert_eq!(scenes[2].emotion, Emotion::Scared);
        assert_eq!(scenes[2].duration_estimate_seconds, 20);
        // missing duration estimated from 3 words, then clamped
        assert_eq!(scenes[3].duration_estimate_seconds, 10);
        for s in &scenes {
            assert!(Emotion::ALL.contains(&s.emotion));
            assert!((10..=30).contains(&s.duration_estimate_seconds));
        }
        Ok(())
    }

    #[test]
    fn test_source_numbering_is_rewritten() -> Result<()> {
        let raw = format!(
            r#"{{"scenes": [{}, {}, {}, {}, {}, {}]}}"#,
            scene_json(10, "calm", "12"),
            scene_json(30, "calm", "12"),
            scene_json(20, "calm", "12"),
            scene_json(40, "calm", "12"),
            scene_json(50, "calm", "12"),
            scene_json(60, "calm", "12"),
        );
        let scenes = SceneDecomposer::parse_response(&raw, &(6..=8))?;
        assert!(is_contiguous(&scenes));
        assert_eq!(scenes[1].narration_text, "Scene 20 text.");
        assert_eq!(scenes[2].narration_text, "Scene 30 text.");
        Ok(())
    }

    #[test]
    fn test_count_stays_within_tier() -> Result<()> {
        for minutes in 1..=20u32 {
            let bounds = scene_count_bounds(minutes, None);
            for returned in [*bounds.start(), *bounds.end(), *bounds.end() + 4] {
                let scenes = SceneDecomposer::parse_response(&response(returned), &bounds)?;
                assert!(bounds.contains(&scenes.len()), "{} min -> {}", minutes, scenes.len());
                assert!(is_contiguous(&scenes));
            }
            let err = SceneDecomposer::parse_response(&response(bounds.start() - 1), &bounds).unwrap_err();
            assert_eq!(StoryError::classify(&err), ErrorClass::Parse);
        }
        Ok(())
    }

    #[test]
    fn test_merge_keeps_all_text() {
        let mut scenes: Vec<Scene> = (1..=4).map(|i| Scene::new(i, &format!("t{}", i), "v")).collect();
        merge_to_fit(&mut scenes, 2);
        assert_eq!(scenes.len(), 2);
        let joined: Vec<String> = scenes.iter().map(|s| s.narration_text.clone()).collect();
        assert_eq!(joined.join(" "), "t1 t2 t3 t4");
    }

    #[derive(Debug)]
    struct FixedLlm(String);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_decompose_uses_explicit_count() -> Result<()> {
        let llm = FixedLlm(response(4));
        let decomposer = SceneDecomposer::new(&llm, RetryPolicy::default());
        let scenes = decomposer.decompose("Once upon a time.", 10, Some(4), &[]).await?;
        assert_eq!(scenes.len(), 4);

        let err = decomposer.decompose("  ", 10, None, &[]).await.unwrap_err();
        assert_eq!(StoryError::classify(&err), ErrorClass::Precondition);
        Ok(())
    }
}
