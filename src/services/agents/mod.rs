//! Seams between the pipeline and the external analysis services.
//!
//! Every call is an opaque, possibly slow, possibly failing function with a
//! typed result. The orchestrator only ever sees these traits.

pub mod audio;
pub mod normalizer;
pub mod story;
pub mod vision;

use crate::core::state::{
    Bubble, CharacterProfile, Comic, Page, Panel, Speaker, StoryBible, StoryFragment,
};
use crate::services::error::AgentError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use audio::OpenRouterAudioAgent;
pub use normalizer::ImageNormalizer;
pub use story::LlmStoryAgent;
pub use vision::LlmVisionAgent;

/// Result of speaker attribution for one panel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribution {
    /// bubble_id -> speaker_id
    pub speakers: HashMap<String, String>,
    /// Characters not present in the known list.
    pub new_speakers: Vec<Speaker>,
}

#[async_trait]
pub trait VisionAgent: Send + Sync {
    /// Panels of one page with cropped images written. Order is as reported.
    async fn detect_panels(&self, page: &Page, comic_id: &str) -> Result<Vec<Panel>, AgentError>;

    async fn detect_bubbles(&self, panel: &Panel) -> Result<Vec<Bubble>, AgentError>;

    async fn attribute_speakers(
        &self,
        panel: &Panel,
        known: &[Speaker],
    ) -> Result<Attribution, AgentError>;

    /// bubble_id -> emotion
    async fn tag_emotions(
        &self,
        bubbles: &[Bubble],
        speakers: &[Speaker],
    ) -> Result<HashMap<String, String>, AgentError>;

    /// panel_id -> ambience prompt
    async fn generate_sfx_prompts(&self, comic: &Comic) -> Result<HashMap<String, String>, AgentError>;
}

#[async_trait]
pub trait StoryAgent: Send + Sync {
    async fn analyse_page_range(
        &self,
        page_paths: &[String],
        page_range: (u32, u32),
        comic_id: &str,
        known: &[CharacterProfile],
    ) -> Result<StoryFragment, AgentError>;

    /// Reduces every fragment into one bible. Implementations persist it.
    async fn synthesise_story_bible(
        &self,
        fragments: &[StoryFragment],
        comic_id: &str,
    ) -> Result<StoryBible, AgentError>;
}

#[async_trait]
pub trait AudioAgent: Send + Sync {
    /// Returns the path of the written speech file.
    async fn synthesize_speech(
        &self,
        bubble: &Bubble,
        voice_id: &str,
        comic_id: &str,
    ) -> Result<String, AgentError>;

    /// Returns the path of the written ambience file.
    async fn generate_ambience(
        &self,
        panel: &Panel,
        prompt: &str,
        comic_id: &str,
    ) -> Result<String, AgentError>;
}

#[async_trait]
pub trait PanelNormalizer: Send + Sync {
    /// Returns the normalised image path and the model that filled the canvas.
    async fn normalise_panel(&self, panel: &Panel, comic_id: &str) -> Result<(String, String), AgentError>;
}

#[derive(Clone)]
pub struct Agents {
    pub vision: Arc<dyn VisionAgent>,
    pub story: Arc<dyn StoryAgent>,
    pub audio: Arc<dyn AudioAgent>,
    pub normalizer: Arc<dyn PanelNormalizer>,
}
