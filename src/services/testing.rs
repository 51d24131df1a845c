//! Scripted agents and a rasterizer for driving whole runs in tests.

use crate::core::io::{NativeStorage, Storage};
use crate::core::state::{
    BBox, Bubble, BubbleType, CharacterProfile, Comic, Page, Panel, ProcessingStage, RunRecord,
    Speaker, StoryBible, StoryFragment, NARRATOR_ID,
};
use crate::services::agents::{
    Attribution, AudioAgent, PanelNormalizer, StoryAgent, VisionAgent,
};
use crate::services::error::AgentError;
use crate::services::renderer::Rasterizer;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Two panels per page, three bubbles per panel: speech, sound effect, narration.
#[derive(Default)]
pub struct MockVision {
    pub fail_ocr: bool,
    pub panic_in_ocr: bool,
    /// Reports repeated and skipped order values.
    pub sloppy_orders: bool,
    /// Awaited once before the first panel detection.
    pub wait_before_panels: Option<Arc<Notify>>,
    pub sfx_prompt_calls: Mutex<usize>,
    pub attribution_calls: Mutex<usize>,
    pub known_at_first_attribution: Mutex<Vec<String>>,
}

#[async_trait]
impl VisionAgent for MockVision {
    async fn detect_panels(&self, page: &Page, _comic_id: &str) -> Result<Vec<Panel>, AgentError> {
        if let Some(gate) = &self.wait_before_panels {
            gate.notified().await;
            // Leave a permit for the next page
            gate.notify_one();
        }
        let orders: &[u32] = if self.sloppy_orders { &[3, 1, 3] } else { &[2, 1] };
        Ok(orders
            .iter()
            .copied()
            .map(|n| {
                let mut panel = Panel::new(&page.page_id, n, BBox { x: 0, y: 0, w: 100, h: 100 });
                panel.image_path = format!("panels/{}.png", panel.panel_id);
                panel
            })
            .collect())
    }

    async fn detect_bubbles(&self, panel: &Panel) -> Result<Vec<Bubble>, AgentError> {
        if self.fail_ocr {
            return Err(AgentError::Transport("ocr exploded".to_string()));
        }
        if self.panic_in_ocr {
            panic!("ocr crashed");
        }
        let orders = if self.sloppy_orders { [7, 2, 2] } else { [2, 1, 3] };
        let scripted = [
            (orders[0], BubbleType::Sfx, "BOOM"),
            (orders[1], BubbleType::Speech, "Hello"),
            (orders[2], BubbleType::Narration, "Meanwhile"),
        ];
        Ok(scripted
            .into_iter()
            .map(|(n, kind, text)| {
                let mut bubble = Bubble::new(&panel.panel_id, n, BBox::default());
                bubble.bubble_type = kind;
                bubble.text = text.to_string();
                bubble
            })
            .collect())
    }

    async fn attribute_speakers(
        &self,
        panel: &Panel,
        known: &[Speaker],
    ) -> Result<Attribution, AgentError> {
        {
            let mut calls = self.attribution_calls.lock().unwrap();
            if *calls == 0 {
                *self.known_at_first_attribution.lock().unwrap() =
                    known.iter().map(|s| s.speaker_id.clone()).collect();
            }
            *calls += 1;
        }
        let mut attribution = Attribution::default();
        for bubble in &panel.bubbles {
            match bubble.bubble_type {
                BubbleType::Speech => {
                    attribution
                        .speakers
                        .insert(bubble.bubble_id.clone(), "char_0".to_string());
                }
                BubbleType::Narration => {
                    attribution
                        .speakers
                        .insert(bubble.bubble_id.clone(), NARRATOR_ID.to_string());
                }
                _ => {}
            }
        }
        attribution.new_speakers.push(Speaker {
            speaker_id: "char_0".to_string(),
            inferred_label: "Hero".to_string(),
            gender: "male".to_string(),
            age_group: "adult".to_string(),
            ..Default::default()
        });
        Ok(attribution)
    }

    async fn tag_emotions(
        &self,
        bubbles: &[Bubble],
        _speakers: &[Speaker],
    ) -> Result<HashMap<String, String>, AgentError> {
        Ok(bubbles
            .iter()
            .map(|b| (b.bubble_id.clone(), "happy".to_string()))
            .collect())
    }

    async fn generate_sfx_prompts(&self, comic: &Comic) -> Result<HashMap<String, String>, AgentError> {
        *self.sfx_prompt_calls.lock().unwrap() += 1;
        Ok(comic
            .panels()
            .map(|p| (p.panel_id.clone(), "city street at night".to_string()))
            .collect())
    }
}

#[derive(Default)]
pub struct MockStory {
    pub fail: bool,
    /// Window calls succeed; the bible synthesis fails.
    pub fail_synthesis: bool,
    /// Adds an ambience cue for the first panel of page 1.
    pub with_sfx_cues: bool,
    /// Window analysis blocks until notified.
    pub gate: Option<Arc<Notify>>,
    /// Notified when the track reaches its end, successful or not.
    pub finished: Option<Arc<Notify>>,
    pub ranges: Mutex<Vec<(u32, u32)>>,
    pub synthesis_calls: Mutex<usize>,
}

impl MockStory {
    fn signal_finished(&self) {
        if let Some(finished) = &self.finished {
            finished.notify_one();
        }
    }
}

#[async_trait]
impl StoryAgent for MockStory {
    async fn analyse_page_range(
        &self,
        _page_paths: &[String],
        page_range: (u32, u32),
        _comic_id: &str,
        _known: &[CharacterProfile],
    ) -> Result<StoryFragment, AgentError> {
        self.ranges.lock().unwrap().push(page_range);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            self.signal_finished();
            return Err(AgentError::Transport("story model down".to_string()));
        }
        Ok(StoryFragment {
            page_range,
            characters: vec![CharacterProfile {
                character_id: "char_001".to_string(),
                name: "Captain".to_string(),
                gender: "male".to_string(),
                age_group: "elder".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    async fn synthesise_story_bible(
        &self,
        fragments: &[StoryFragment],
        comic_id: &str,
    ) -> Result<StoryBible, AgentError> {
        *self.synthesis_calls.lock().unwrap() += 1;
        if self.fail_synthesis {
            self.signal_finished();
            return Err(AgentError::schema("story_synthesis", "truncated JSON"));
        }
        let mut bible = StoryBible {
            comic_id: comic_id.to_string(),
            genre: "adventure".to_string(),
            ..Default::default()
        };
        for fragment in fragments {
            for character in &fragment.characters {
                if !bible
                    .characters
                    .iter()
                    .any(|c| c.character_id == character.character_id)
                {
                    bible.characters.push(character.clone());
                }
            }
        }
        if self.with_sfx_cues {
            bible.per_panel_sfx.insert(
                format!("{}_pg0001_p001", comic_id),
                "waves against the hull".to_string(),
            );
        }
        self.signal_finished();
        Ok(bible)
    }
}

/// Records every call; writes nothing.
#[derive(Default)]
pub struct MockAudio {
    /// `(bubble_id, voice_id)`
    pub speech: Mutex<Vec<(String, String)>>,
    /// `(panel_id, prompt)`
    pub ambience: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AudioAgent for MockAudio {
    async fn synthesize_speech(
        &self,
        bubble: &Bubble,
        voice_id: &str,
        _comic_id: &str,
    ) -> Result<String, AgentError> {
        self.speech
            .lock()
            .unwrap()
            .push((bubble.bubble_id.clone(), voice_id.to_string()));
        Ok(format!("voice/{}.mp3", bubble.bubble_id))
    }

    async fn generate_ambience(
        &self,
        panel: &Panel,
        prompt: &str,
        _comic_id: &str,
    ) -> Result<String, AgentError> {
        self.ambience
            .lock()
            .unwrap()
            .push((panel.panel_id.clone(), prompt.to_string()));
        Ok(format!("sfx/{}.wav", panel.panel_id))
    }
}

pub struct MockNormalizer;

#[async_trait]
impl PanelNormalizer for MockNormalizer {
    async fn normalise_panel(&self, panel: &Panel, _comic_id: &str) -> Result<(String, String), AgentError> {
        Ok((format!("normalised/{}.png", panel.panel_id), "mock-fill".to_string()))
    }
}

/// Reports `total` pages and returns page paths without rendering anything.
pub struct MockRasterizer {
    total: u32,
}

impl MockRasterizer {
    pub fn new(total: u32) -> Self {
        Self { total }
    }
}

#[async_trait]
impl Rasterizer for MockRasterizer {
    async fn page_count(&self, _pdf: &Path) -> Result<u32> {
        Ok(self.total)
    }

    async fn render_batch(
        &self,
        _pdf: &Path,
        out_dir: &Path,
        first: u32,
        last: u32,
        _dpi: u32,
    ) -> Result<Vec<PathBuf>> {
        Ok((first..=last)
            .map(|n| out_dir.join(format!("page_{:04}.png", n)))
            .collect())
    }
}

pub type StageHistory = Arc<Mutex<Vec<(ProcessingStage, u8)>>>;

/// Native storage that also logs every run record it persists.
struct RecordingStorage {
    inner: NativeStorage,
    history: StageHistory,
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        if path.ends_with("cache_record.json") {
            let record: RunRecord = serde_json::from_slice(content)?;
            self.history
                .lock()
                .unwrap()
                .push((record.processing_stage, record.progress_pct));
        }
        self.inner.write(path, content).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }
}

pub fn record_writes() -> (Arc<dyn Storage>, StageHistory) {
    let history: StageHistory = Arc::new(Mutex::new(Vec::new()));
    let storage = RecordingStorage {
        inner: NativeStorage::new(),
        history: history.clone(),
    };
    (Arc::new(storage), history)
}
