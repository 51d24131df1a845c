use super::{Attribution, VisionAgent};
use crate::core::cache::CacheStore;
use crate::core::state::{BBox, Bubble, BubbleType, Comic, Page, Panel, Speaker};
use crate::services::decode::extract_json;
use crate::services::error::AgentError;
use crate::services::llm::LlmClient;
use crate::utils::raster;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const PANEL_SYSTEM_PROMPT: &str = r#"You are a comic panel analyser. Given an image of a comic page, identify every
panel and return them in reading order (left-to-right, top-to-bottom for Western
comics; right-to-left for manga).

Respond ONLY with a JSON array. Each element must have these integer fields:
  order  - 1-based reading order index
  x      - left edge in pixels
  y      - top edge in pixels
  w      - width in pixels
  h      - height in pixels

No markdown, no explanation. Raw JSON only."#;

const BUBBLE_SYSTEM_PROMPT: &str = r#"You are a comic book OCR specialist. Given a panel image, find every speech
bubble, thought bubble, narration box, and sound-effect text.

For each one, return a JSON object with:
  order      - 1-based reading order within the panel
  type       - one of: "speech", "thought", "narration", "sfx"
  x, y, w, h - bounding box in pixels (integers)
  text       - the verbatim text inside the bubble (preserve punctuation)
  confidence - float 0.0-1.0, your OCR confidence for the text

Respond ONLY with a JSON array. No markdown, no explanation."#;

const ATTRIBUTION_SYSTEM_PROMPT: &str = r#"You are a comic character recognition agent. Given a panel image and a list of
speech/thought/narration bubbles with their texts, assign each bubble to the
character who is speaking or thinking it.

Rules:
- Use visual proximity (a tail pointing toward a character) and context to
  attribute each bubble.
- Assign a stable speaker_id: reuse IDs you have already seen (provided in the
  known_speakers list) when the same character appears again.
- Use "narrator" as the speaker_id for narration boxes with no visual speaker.
- Infer a human-readable label (best-guess character name or a descriptor like
  "tall man in hat") for any new character.

Respond ONLY with a JSON object:
{
  "attributions": [
    {"bubble_id": "...", "speaker_id": "char_N", "label": "..."}
  ],
  "new_speakers": [
    {"speaker_id": "char_N", "label": "...", "gender": "...", "age_group": "..."}
  ]
}
No markdown, no explanation."#;

const EMOTION_SYSTEM_PROMPT: &str = r#"You are a comic voice director. Given a list of speech bubbles (with text and
speaker labels), infer the emotion for each bubble.

Choose one emotion per bubble from:
  neutral, happy, sad, angry, excited, scared, surprised, disgusted, sarcastic,
  whispering, shouting

Respond ONLY with a JSON array:
[
  {"bubble_id": "...", "emotion": "..."}
]
No markdown, no explanation."#;

const SOUND_DIRECTOR_SYSTEM_PROMPT: &str = r#"You are a sound director for a comic audiobook. Given a list of panels with
their bubble texts, generate a short sound prompt for each panel.

The prompt should describe the ambient background sounds only (no dialogue, no
music unless it is diegetic). Keep it under 15 words. Be specific about
environment, mood, and any notable sound effects.

Respond ONLY with a JSON array:
[
  {"panel_id": "...", "prompt": "..."}
]
No markdown, no explanation."#;

#[derive(Deserialize)]
struct PanelBox {
    order: u32,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

#[derive(Deserialize)]
struct BubbleItem {
    order: u32,
    #[serde(rename = "type", default)]
    bubble_type: BubbleType,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    #[serde(default)]
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Deserialize)]
struct AttributionResponse {
    #[serde(default)]
    attributions: Vec<AttributionItem>,
    #[serde(default)]
    new_speakers: Vec<NewSpeaker>,
}

#[derive(Deserialize)]
struct AttributionItem {
    bubble_id: String,
    speaker_id: String,
}

#[derive(Deserialize)]
struct NewSpeaker {
    speaker_id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    gender: String,
    #[serde(default)]
    age_group: String,
}

#[derive(Deserialize)]
struct EmotionItem {
    bubble_id: String,
    emotion: String,
}

#[derive(Deserialize)]
struct SfxPromptItem {
    panel_id: String,
    prompt: String,
}

#[derive(Serialize)]
struct KnownSpeaker<'a> {
    speaker_id: &'a str,
    label: &'a str,
}

#[derive(Serialize)]
struct BubbleSummary<'a> {
    bubble_id: &'a str,
    text: &'a str,
    #[serde(rename = "type")]
    bubble_type: BubbleType,
}

/// Vision agent backed by a multimodal chat model.
pub struct LlmVisionAgent {
    llm: Arc<dyn LlmClient>,
    store: Arc<CacheStore>,
}

impl LlmVisionAgent {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<CacheStore>) -> Self {
        Self { llm, store }
    }

    async fn crop_panel(&self, page_bytes: Arc<Vec<u8>>, bbox: BBox, out: &Path) -> Result<(), AgentError> {
        let png = tokio::task::spawn_blocking(move || raster::crop_png(&page_bytes, &bbox))
            .await
            .map_err(|e| AgentError::Transport(format!("crop task failed: {}", e)))??;
        self.store
            .storage()
            .write(out, &png)
            .await
            .map_err(AgentError::storage)
    }
}

#[async_trait]
impl VisionAgent for LlmVisionAgent {
    async fn detect_panels(&self, page: &Page, comic_id: &str) -> Result<Vec<Panel>, AgentError> {
        let context = format!("panel_detection page={}", page.page_id);
        let raw = self
            .llm
            .chat(
                PANEL_SYSTEM_PROMPT,
                "Detect all panels on this comic page.",
                std::slice::from_ref(&page.image_path),
            )
            .await?;
        let mut boxes: Vec<PanelBox> = extract_json(&raw, &context)?;
        boxes.sort_by_key(|b| b.order);

        let page_bytes = Arc::new(
            self.store
                .storage()
                .read(Path::new(&page.image_path))
                .await
                .map_err(AgentError::storage)?,
        );
        let out_dir = self.store.panels_dir(comic_id);

        // Reported orders may repeat or skip; position decides the id
        let mut panels = Vec::with_capacity(boxes.len());
        for (i, b) in boxes.into_iter().enumerate() {
            let bbox = BBox { x: b.x, y: b.y, w: b.w, h: b.h };
            let mut panel = Panel::new(&page.page_id, i as u32 + 1, bbox);
            let out = out_dir.join(format!("{}.png", panel.panel_id));
            self.crop_panel(page_bytes.clone(), bbox, &out).await?;
            panel.image_path = out.to_string_lossy().to_string();
            panels.push(panel);
        }
        debug!("{}: {} panels", page.page_id, panels.len());
        Ok(panels)
    }

    async fn detect_bubbles(&self, panel: &Panel) -> Result<Vec<Bubble>, AgentError> {
        let context = format!("bubble_ocr panel={}", panel.panel_id);
        let raw = self
            .llm
            .chat(
                BUBBLE_SYSTEM_PROMPT,
                "Find all bubbles and extract their text.",
                std::slice::from_ref(&panel.image_path),
            )
            .await?;
        let mut items: Vec<BubbleItem> = extract_json(&raw, &context)?;
        items.sort_by_key(|b| b.order);

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let bbox = BBox { x: item.x, y: item.y, w: item.w, h: item.h };
                let mut bubble = Bubble::new(&panel.panel_id, i as u32 + 1, bbox);
                bubble.bubble_type = item.bubble_type;
                bubble.text = item.text;
                bubble.ocr_confidence = item.confidence.clamp(0.0, 1.0);
                bubble
            })
            .collect())
    }

    async fn attribute_speakers(
        &self,
        panel: &Panel,
        known: &[Speaker],
    ) -> Result<Attribution, AgentError> {
        let context = format!("speaker_attribution panel={}", panel.panel_id);
        let payload = serde_json::json!({
            "known_speakers": known
                .iter()
                .map(|s| KnownSpeaker { speaker_id: &s.speaker_id, label: &s.inferred_label })
                .collect::<Vec<_>>(),
            "bubbles": panel
                .bubbles
                .iter()
                .map(|b| BubbleSummary { bubble_id: &b.bubble_id, text: &b.text, bubble_type: b.bubble_type })
                .collect::<Vec<_>>(),
        });
        let raw = self
            .llm
            .chat(
                ATTRIBUTION_SYSTEM_PROMPT,
                &payload.to_string(),
                std::slice::from_ref(&panel.image_path),
            )
            .await?;
        let response: AttributionResponse = extract_json(&raw, &context)?;

        Ok(Attribution {
            speakers: response
                .attributions
                .into_iter()
                .map(|a| (a.bubble_id, a.speaker_id))
                .collect(),
            new_speakers: response
                .new_speakers
                .into_iter()
                .map(|ns| Speaker {
                    speaker_id: ns.speaker_id,
                    inferred_label: ns.label,
                    gender: ns.gender,
                    age_group: ns.age_group,
                    ..Default::default()
                })
                .collect(),
        })
    }

    async fn tag_emotions(
        &self,
        bubbles: &[Bubble],
        speakers: &[Speaker],
    ) -> Result<HashMap<String, String>, AgentError> {
        let labels: HashMap<&str, &str> = speakers
            .iter()
            .map(|s| (s.speaker_id.as_str(), s.inferred_label.as_str()))
            .collect();
        let list: Vec<serde_json::Value> = bubbles
            .iter()
            .filter(|b| !b.text.trim().is_empty())
            .map(|b| {
                let speaker = b
                    .speaker_id
                    .as_deref()
                    .and_then(|id| labels.get(id).copied())
                    .unwrap_or("unknown");
                serde_json::json!({"bubble_id": b.bubble_id, "text": b.text, "speaker": speaker})
            })
            .collect();
        if list.is_empty() {
            return Ok(HashMap::new());
        }

        let raw = self
            .llm
            .chat(EMOTION_SYSTEM_PROMPT, &serde_json::Value::Array(list).to_string(), &[])
            .await?;
        let items: Vec<EmotionItem> = extract_json(&raw, "emotion_tagging")?;
        Ok(items.into_iter().map(|e| (e.bubble_id, e.emotion)).collect())
    }

    async fn generate_sfx_prompts(&self, comic: &Comic) -> Result<HashMap<String, String>, AgentError> {
        let summary: Vec<serde_json::Value> = comic
            .panels()
            .map(|panel| {
                let texts: Vec<&str> = panel
                    .bubbles
                    .iter()
                    .map(|b| b.text.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .collect();
                serde_json::json!({"panel_id": panel.panel_id, "bubble_texts": texts})
            })
            .collect();
        if summary.is_empty() {
            return Ok(HashMap::new());
        }

        let raw = self
            .llm
            .chat(SOUND_DIRECTOR_SYSTEM_PROMPT, &serde_json::Value::Array(summary).to_string(), &[])
            .await?;
        let items: Vec<SfxPromptItem> = extract_json(&raw, "sound_director")?;
        Ok(items.into_iter().map(|i| (i.panel_id, i.prompt)).collect())
    }
}
