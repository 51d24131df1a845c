use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reserved speaker id for narration boxes. Never has a visual region.
pub const NARRATOR_ID: &str = "narrator";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BubbleType {
    #[default]
    Speech,
    Thought,
    Narration,
    Sfx,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    #[default]
    Queued,
    PdfToImages,
    PanelDetection,
    BubbleOcr,
    SpeakerAttribution,
    VoiceAssignment,
    TtsGeneration,
    SfxGeneration,
    Normalization,
    Done,
    Failed,
}

impl ProcessingStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStage::Done | ProcessingStage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::Queued => "queued",
            ProcessingStage::PdfToImages => "pdf_to_images",
            ProcessingStage::PanelDetection => "panel_detection",
            ProcessingStage::BubbleOcr => "bubble_ocr",
            ProcessingStage::SpeakerAttribution => "speaker_attribution",
            ProcessingStage::VoiceAssignment => "voice_assignment",
            ProcessingStage::TtsGeneration => "tts_generation",
            ProcessingStage::SfxGeneration => "sfx_generation",
            ProcessingStage::Normalization => "normalization",
            ProcessingStage::Done => "done",
            ProcessingStage::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel coordinates: top-left corner plus width and height.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Speaker {
    pub speaker_id: String,
    #[serde(default)]
    pub inferred_label: String,
    #[serde(default)]
    pub voice_id: String,
    #[serde(default)]
    pub gender: String, // "male", "female", "unknown"
    #[serde(default)]
    pub age_group: String, // "child", "teen", "adult", "elder"
    #[serde(default)]
    pub personality_tags: Vec<String>,
}

impl Speaker {
    pub fn new(speaker_id: impl Into<String>) -> Self {
        Self {
            speaker_id: speaker_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Bubble {
    pub bubble_id: String,
    pub order_index: u32,
    #[serde(default)]
    pub bubble_type: BubbleType,
    pub bbox: BBox,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub speaker_id: Option<String>,
    #[serde(default)]
    pub emotion_tag: String,
    #[serde(default)]
    pub tts_audio_path: Option<String>,
    #[serde(default = "default_confidence")]
    pub ocr_confidence: f32,
}

impl Bubble {
    pub fn new(panel_id: &str, order_index: u32, bbox: BBox) -> Self {
        Self {
            bubble_id: bubble_id(panel_id, order_index),
            order_index,
            bubble_type: BubbleType::Speech,
            bbox,
            text: String::new(),
            language: default_language(),
            speaker_id: None,
            emotion_tag: String::new(),
            tts_audio_path: None,
            ocr_confidence: default_confidence(),
        }
    }

    fn place(&mut self, panel_id: &str, order_index: u32) {
        self.order_index = order_index;
        self.bubble_id = bubble_id(panel_id, order_index);
    }

    /// Bubbles that are read aloud. Sound-effect lettering is not spoken.
    pub fn is_speakable(&self) -> bool {
        self.bubble_type != BubbleType::Sfx && !self.text.trim().is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Panel {
    pub panel_id: String,
    pub order_index: u32,
    pub bbox: BBox,
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub normalized_image_path: Option<String>,
    #[serde(default)]
    pub normalization_fill_model: Option<String>,
    #[serde(default)]
    pub sfx_audio_path: Option<String>,
    #[serde(default)]
    pub bubbles: Vec<Bubble>,
}

impl Panel {
    pub fn new(page_id: &str, order_index: u32, bbox: BBox) -> Self {
        Self {
            panel_id: panel_id(page_id, order_index),
            order_index,
            bbox,
            image_path: String::new(),
            normalized_image_path: None,
            normalization_fill_model: None,
            sfx_audio_path: None,
            bubbles: Vec::new(),
        }
    }

    fn place(&mut self, page_id: &str, order_index: u32) {
        self.order_index = order_index;
        self.panel_id = panel_id(page_id, order_index);
        for bubble in self.bubbles.iter_mut() {
            bubble.place(&self.panel_id, bubble.order_index);
        }
    }

    /// Sorts by reported order (ties keep their given order) and renumbers
    /// 1..=n, re-deriving the ids.
    pub fn set_bubbles(&mut self, mut bubbles: Vec<Bubble>) {
        bubbles.sort_by_key(|b| b.order_index);
        for (i, bubble) in bubbles.iter_mut().enumerate() {
            bubble.place(&self.panel_id, i as u32 + 1);
        }
        self.bubbles = bubbles;
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Page {
    pub page_id: String,
    pub page_number: u32,
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl Page {
    pub fn new(comic_id: &str, page_number: u32, image_path: impl Into<String>) -> Self {
        Self {
            page_id: page_id(comic_id, page_number),
            page_number,
            image_path: image_path.into(),
            panels: Vec::new(),
        }
    }

    /// Same ordering rule as [`Panel::set_bubbles`].
    pub fn set_panels(&mut self, mut panels: Vec<Panel>) {
        panels.sort_by_key(|p| p.order_index);
        for (i, panel) in panels.iter_mut().enumerate() {
            panel.place(&self.page_id, i as u32 + 1);
        }
        self.panels = panels;
    }
}

/// Root of the manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Comic {
    pub comic_id: String,
    #[serde(default)]
    pub title: String,
    pub pdf_hash: String,
    #[serde(default)]
    pub speakers: Vec<Speaker>,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default = "default_language")]
    pub source_language: String,
    #[serde(default = "default_languages")]
    pub available_languages: Vec<String>,
    #[serde(default)]
    pub normalization_enabled: bool,
    #[serde(default)]
    pub created_at: String,
}

impl Comic {
    pub fn new(comic_id: impl Into<String>, pdf_hash: impl Into<String>) -> Self {
        Self {
            comic_id: comic_id.into(),
            title: String::new(),
            pdf_hash: pdf_hash.into(),
            speakers: Vec::new(),
            pages: Vec::new(),
            source_language: default_language(),
            available_languages: default_languages(),
            normalization_enabled: false,
            created_at: String::new(),
        }
    }

    pub fn panels(&self) -> impl Iterator<Item = &Panel> {
        self.pages.iter().flat_map(|p| p.panels.iter())
    }

    pub fn panels_mut(&mut self) -> impl Iterator<Item = &mut Panel> {
        self.pages.iter_mut().flat_map(|p| p.panels.iter_mut())
    }

    /// Adds speakers whose id is not already known. First-seen id wins.
    pub fn merge_speakers(&mut self, new_speakers: Vec<Speaker>) -> usize {
        let mut added = 0;
        for speaker in new_speakers {
            if !self.speakers.iter().any(|s| s.speaker_id == speaker.speaker_id) {
                self.speakers.push(speaker);
                added += 1;
            }
        }
        added
    }
}

/// Processing status and playback token for one run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub comic_id: String,
    pub pdf_hash: String,
    pub manifest_path: String,
    pub playback_token: String,
    #[serde(default)]
    pub processing_stage: ProcessingStage,
    #[serde(default)]
    pub progress_pct: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub normalization_enabled: bool,
    /// Inclusive, 1-based, always resolved against the document's page count.
    #[serde(default)]
    pub page_range: Option<(u32, u32)>,
    #[serde(default)]
    pub story_bible_path: Option<String>,
}

/// Client-side player state. Not persisted by the pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlaybackState {
    pub comic_id: String,
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub current_panel: u32,
    #[serde(default)]
    pub current_bubble: u32,
    #[serde(default = "default_voice_volume")]
    pub voice_volume: f32,
    #[serde(default = "default_sfx_volume")]
    pub sfx_volume: f32,
    #[serde(default = "default_speed")]
    pub playback_speed: f32,
    #[serde(default = "default_language")]
    pub language: String,
}

impl PlaybackState {
    pub fn new(comic_id: impl Into<String>) -> Self {
        Self {
            comic_id: comic_id.into(),
            current_page: 0,
            current_panel: 0,
            current_bubble: 0,
            voice_volume: default_voice_volume(),
            sfx_volume: default_sfx_volume(),
            playback_speed: default_speed(),
            language: default_language(),
        }
    }
}

// --- Story track ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct CharacterProfile {
    pub character_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub arc_summary: String,
    #[serde(default)]
    pub voice_tone_rules: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age_group: String,
}

impl CharacterProfile {
    /// Seed speaker for attribution. Voice is assigned later.
    pub fn to_speaker(&self) -> Speaker {
        Speaker {
            speaker_id: self.character_id.clone(),
            inferred_label: self.name.clone(),
            voice_id: String::new(),
            gender: self.gender.clone(),
            age_group: self.age_group.clone(),
            personality_tags: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct StoryEvent {
    #[serde(default)]
    pub pages: Vec<u32>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tone: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SfxCue {
    pub page: u32,
    pub panel_order: u32,
    pub prompt: String,
}

/// Partial analysis of one window of pages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct StoryFragment {
    #[serde(default)]
    pub page_range: (u32, u32),
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub events: Vec<StoryEvent>,
    #[serde(default)]
    pub sfx_palette: Vec<SfxCue>,
    #[serde(default)]
    pub unresolved: Vec<String>,
}

/// Reduced union of every fragment for a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct StoryBible {
    pub comic_id: String,
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub per_panel_sfx: HashMap<String, String>,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub tone_summary: String,
    #[serde(default)]
    pub narrator_voice_style: String,
    #[serde(default)]
    pub created_at: String,
}

impl StoryBible {
    pub fn seed_speakers(&self) -> Vec<Speaker> {
        self.characters.iter().map(CharacterProfile::to_speaker).collect()
    }
}

// --- Identifiers ---

pub fn page_id(comic_id: &str, page_number: u32) -> String {
    format!("{}_pg{:04}", comic_id, page_number)
}

pub fn panel_id(page_id: &str, order_index: u32) -> String {
    format!("{}_p{:03}", page_id, order_index)
}

pub fn bubble_id(panel_id: &str, order_index: u32) -> String {
    format!("{}_b{:03}", panel_id, order_index)
}

fn default_language() -> String {
    "en".to_string()
}
fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}
fn default_confidence() -> f32 {
    1.0
}
fn default_voice_volume() -> f32 {
    1.0
}
fn default_sfx_volume() -> f32 {
    0.4
}
fn default_speed() -> f32 {
    1.0
}
