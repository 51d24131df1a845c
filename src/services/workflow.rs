use crate::core::cache::{now_iso, CacheStore};
use crate::core::config::Settings;
use crate::core::state::{
    Comic, Page, ProcessingStage, RunRecord, Speaker, StoryBible, NARRATOR_ID,
};
use crate::services::agents::Agents;
use crate::services::renderer::{Rasterizer, Renderer};
use crate::services::story_track::StoryTrackHandle;
use crate::services::voices::{assign_voices, resolve_voice};
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_SFX_PROMPT: &str = "soft ambient background, comic book";

/// What to process for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pdf_path: PathBuf,
    pub title: String,
    pub normalization_enabled: bool,
    /// `(start, end)` as asked for. An open end means "to the last page".
    pub page_range: Option<(u32, Option<u32>)>,
}

/// Drives one run through every stage in order.
pub struct WorkflowManager {
    settings: Settings,
    store: Arc<CacheStore>,
    rasterizer: Arc<dyn Rasterizer>,
    agents: Agents,
}

impl WorkflowManager {
    pub fn new(
        settings: Settings,
        store: Arc<CacheStore>,
        rasterizer: Arc<dyn Rasterizer>,
        agents: Agents,
    ) -> Self {
        Self {
            settings,
            store,
            rasterizer,
            agents,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Records progress. The percentage never goes backwards within a run.
    async fn advance(&self, record: &mut RunRecord, stage: ProcessingStage, pct: u8) -> Result<()> {
        let pct = pct.max(record.progress_pct);
        self.store.update_stage(record, stage, pct, None).await
    }

    /// Runs the pipeline. On failure the record is left `failed` with the
    /// last progress reached and the error, and the error is returned.
    pub async fn run(&self, record: &mut RunRecord, request: RunRequest) -> Result<Comic> {
        let mut track: Option<StoryTrackHandle> = None;
        match self.execute(record, &request, &mut track).await {
            Ok(comic) => Ok(comic),
            Err(e) => {
                if let Some(handle) = track.as_mut() {
                    handle.cancel_and_wait().await;
                }
                let message = format!("{:#}", e);
                error!("Run {} failed: {}", record.comic_id, message);
                let pct = record.progress_pct;
                if let Err(persist_err) = self
                    .store
                    .update_stage(record, ProcessingStage::Failed, pct, Some(message))
                    .await
                {
                    error!(
                        "Could not persist failure for {}: {:#}",
                        record.comic_id, persist_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        record: &mut RunRecord,
        request: &RunRequest,
        track: &mut Option<StoryTrackHandle>,
    ) -> Result<Comic> {
        let config = self.settings.current();
        let comic_id = record.comic_id.clone();
        let vision = &self.agents.vision;

        // Render
        self.advance(record, ProcessingStage::PdfToImages, 0).await?;
        let renderer = Renderer::new(self.rasterizer.clone(), &config.render);
        let rendered = renderer
            .render(&request.pdf_path, &self.store.pages_dir(&comic_id), request.page_range)
            .await
            .context("Rendering failed")?;
        record.page_range = rendered.range;
        self.advance(record, ProcessingStage::PdfToImages, 10).await?;

        let mut comic = Comic::new(&comic_id, &record.pdf_hash);
        comic.title = request.title.clone();
        comic.normalization_enabled = request.normalization_enabled;
        comic.created_at = now_iso();
        comic.pages = rendered
            .pages
            .iter()
            .map(|(n, path)| Page::new(&comic_id, *n, path.to_string_lossy().to_string()))
            .collect();
        info!("Run {}: {} pages rendered", comic_id, comic.pages.len());

        // Story track
        *track = self.launch_story_track(&comic);

        // Panels
        self.advance(record, ProcessingStage::PanelDetection, 10).await?;
        for page in comic.pages.iter_mut() {
            let panels = vision
                .detect_panels(page, &comic_id)
                .await
                .with_context(|| format!("Panel detection failed on {}", page.page_id))?;
            page.set_panels(panels);
        }
        self.advance(record, ProcessingStage::PanelDetection, 25).await?;

        // Bubbles
        self.advance(record, ProcessingStage::BubbleOcr, 25).await?;
        for panel in comic.panels_mut() {
            let bubbles = vision
                .detect_bubbles(panel)
                .await
                .with_context(|| format!("Bubble OCR failed on {}", panel.panel_id))?;
            panel.set_bubbles(bubbles);
        }
        self.advance(record, ProcessingStage::BubbleOcr, 40).await?;

        // Checkpoint A
        let mut bible = take_if_ready(track, "attribution");
        if let Some(b) = &bible {
            let seeded = comic.merge_speakers(b.seed_speakers());
            info!("Seeded attribution with {} characters from the story bible", seeded);
        }

        // Attribution
        self.advance(record, ProcessingStage::SpeakerAttribution, 40).await?;
        for pi in 0..comic.pages.len() {
            for qi in 0..comic.pages[pi].panels.len() {
                let attribution = {
                    let panel = &comic.pages[pi].panels[qi];
                    vision
                        .attribute_speakers(panel, &comic.speakers)
                        .await
                        .with_context(|| format!("Speaker attribution failed on {}", panel.panel_id))?
                };
                for bubble in comic.pages[pi].panels[qi].bubbles.iter_mut() {
                    if let Some(speaker_id) = attribution.speakers.get(&bubble.bubble_id) {
                        bubble.speaker_id = Some(speaker_id.clone());
                    }
                }
                comic.merge_speakers(attribution.new_speakers);
            }
        }
        let narrated = comic
            .panels()
            .flat_map(|p| p.bubbles.iter())
            .any(|b| b.speaker_id.as_deref() == Some(NARRATOR_ID));
        if narrated {
            let mut narrator = Speaker::new(NARRATOR_ID);
            narrator.inferred_label = "Narrator".to_string();
            comic.merge_speakers(vec![narrator]);
        }
        self.advance(record, ProcessingStage::SpeakerAttribution, 55).await?;

        // Voices and emotions
        self.advance(record, ProcessingStage::VoiceAssignment, 55).await?;
        assign_voices(&mut comic.speakers);
        for page in comic.pages.iter_mut() {
            for panel in page.panels.iter_mut() {
                if panel.bubbles.iter().all(|b| b.text.trim().is_empty()) {
                    continue;
                }
                let emotions = vision
                    .tag_emotions(&panel.bubbles, &comic.speakers)
                    .await
                    .with_context(|| format!("Emotion tagging failed on {}", panel.panel_id))?;
                for bubble in panel.bubbles.iter_mut() {
                    if let Some(emotion) = emotions.get(&bubble.bubble_id) {
                        bubble.emotion_tag = emotion.clone();
                    }
                }
            }
        }
        self.advance(record, ProcessingStage::VoiceAssignment, 65).await?;

        // Speech
        self.advance(record, ProcessingStage::TtsGeneration, 65).await?;
        for page in comic.pages.iter_mut() {
            for panel in page.panels.iter_mut() {
                for bubble in panel.bubbles.iter_mut() {
                    if !bubble.is_speakable() {
                        continue;
                    }
                    let voice = resolve_voice(&comic.speakers, bubble.speaker_id.as_deref());
                    let path = self
                        .agents
                        .audio
                        .synthesize_speech(bubble, voice, &comic_id)
                        .await
                        .with_context(|| format!("Speech synthesis failed on {}", bubble.bubble_id))?;
                    bubble.tts_audio_path = Some(path);
                }
            }
        }
        self.advance(record, ProcessingStage::TtsGeneration, 80).await?;

        // Checkpoint B, then ambience
        self.advance(record, ProcessingStage::SfxGeneration, 80).await?;
        if bible.is_none() {
            bible = take_if_ready(track, "ambience");
        }
        let prompts: HashMap<String, String> = match &bible {
            Some(b) if !b.per_panel_sfx.is_empty() => {
                info!("Using {} ambience cues from the story bible", b.per_panel_sfx.len());
                b.per_panel_sfx.clone()
            }
            _ => vision
                .generate_sfx_prompts(&comic)
                .await
                .context("Sound prompt generation failed")?,
        };
        for panel in comic.panels_mut() {
            let prompt = prompts
                .get(&panel.panel_id)
                .map(String::as_str)
                .unwrap_or(DEFAULT_SFX_PROMPT);
            let path = self
                .agents
                .audio
                .generate_ambience(panel, prompt, &comic_id)
                .await
                .with_context(|| format!("Ambience generation failed on {}", panel.panel_id))?;
            panel.sfx_audio_path = Some(path);
        }
        self.advance(record, ProcessingStage::SfxGeneration, 90).await?;

        // Normalisation
        if request.normalization_enabled {
            self.advance(record, ProcessingStage::Normalization, 90).await?;
            for panel in comic.panels_mut() {
                let (path, fill_model) = self
                    .agents
                    .normalizer
                    .normalise_panel(panel, &comic_id)
                    .await
                    .with_context(|| format!("Normalisation failed on {}", panel.panel_id))?;
                panel.normalized_image_path = Some(path);
                panel.normalization_fill_model = Some(fill_model);
            }
        }
        self.advance(record, ProcessingStage::Normalization, 95).await?;

        // Join
        if let Some(handle) = track.as_mut() {
            let joined = handle.join_for_persistence().await;
            if bible.is_none() {
                bible = joined;
            }
        }

        self.store.save_manifest(&comic).await?;
        if let Some(b) = &bible {
            record.story_bible_path = Some(self.persist_bible(b).await?);
        }
        self.advance(record, ProcessingStage::Done, 100).await?;
        info!("Run {} done", comic_id);
        Ok(comic)
    }

    /// `None` when the track is disabled, there is nothing to analyse, or the
    /// launch itself failed.
    fn launch_story_track(&self, comic: &Comic) -> Option<StoryTrackHandle> {
        let config = self.settings.current();
        if !config.story_track.enabled {
            info!("Story track disabled");
            return None;
        }
        if comic.pages.is_empty() {
            return None;
        }
        let pages: Vec<(u32, String)> = comic
            .pages
            .iter()
            .map(|p| (p.page_number, p.image_path.clone()))
            .collect();
        match StoryTrackHandle::spawn(
            self.agents.story.clone(),
            pages,
            comic.comic_id.clone(),
            config.story_track.pages_per_agent,
            config.story_track.overlap_pages,
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("{:#}; continuing without story context", e);
                None
            }
        }
    }

    async fn persist_bible(&self, bible: &StoryBible) -> Result<String> {
        let path = self.store.story_bible_path(&bible.comic_id);
        if !self.store.storage().exists(&path).await? {
            self.store.save_story_bible(bible).await?;
        }
        Ok(path.to_string_lossy().to_string())
    }
}

/// Non-blocking look at the story track.
fn take_if_ready(track: &mut Option<StoryTrackHandle>, checkpoint: &str) -> Option<StoryBible> {
    let handle = track.as_mut()?;
    if !handle.is_finished() {
        info!("Story track still running at {} checkpoint", checkpoint);
        return None;
    }
    match handle.try_take()? {
        Ok(bible) => {
            info!("Story bible ready at {} checkpoint", checkpoint);
            Some(bible)
        }
        Err(e) => {
            warn!("{:#}; continuing without story context", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::services::testing::{
        record_writes, MockAudio, MockNormalizer, MockRasterizer, MockStory, MockVision,
    };
    use tokio::sync::Notify;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        store: Arc<CacheStore>,
        vision: Arc<MockVision>,
        story: Arc<MockStory>,
        audio: Arc<MockAudio>,
        history: Arc<std::sync::Mutex<Vec<(ProcessingStage, u8)>>>,
        workflow: WorkflowManager,
    }

    fn fixture(config: Config, vision: MockVision, story: MockStory, pages: u32) -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let (storage, history) = record_writes();
        let store = Arc::new(CacheStore::new(temp_dir.path(), storage));
        let vision = Arc::new(vision);
        let story = Arc::new(story);
        let audio = Arc::new(MockAudio::default());
        let agents = Agents {
            vision: vision.clone(),
            story: story.clone(),
            audio: audio.clone(),
            normalizer: Arc::new(MockNormalizer),
        };
        let workflow = WorkflowManager::new(
            Settings::new(config),
            store.clone(),
            Arc::new(MockRasterizer::new(pages)),
            agents,
        );
        Fixture {
            _temp_dir: temp_dir,
            store,
            vision,
            story,
            audio,
            history,
            workflow,
        }
    }

    fn request(normalization_enabled: bool) -> RunRequest {
        RunRequest {
            pdf_path: PathBuf::from("in.pdf"),
            title: "Test".to_string(),
            normalization_enabled,
            page_range: None,
        }
    }

    async fn new_record(store: &CacheStore) -> RunRecord {
        let mut record = store.create_record("hash", "Test").await.unwrap();
        store.save_record(&mut record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_full_run_without_story_track() -> Result<()> {
        let mut config = Config::default();
        config.story_track.enabled = false;
        let f = fixture(config, MockVision::default(), MockStory::default(), 2);
        let mut record = new_record(&f.store).await;

        let comic = f.workflow.run(&mut record, request(false)).await?;

        assert_eq!(record.processing_stage, ProcessingStage::Done);
        assert_eq!(record.progress_pct, 100);
        assert_eq!(record.page_range, Some((1, 2)));
        assert!(record.story_bible_path.is_none());

        // Panels sorted and ids derived from position
        let page = &comic.pages[0];
        assert_eq!(page.page_id, format!("{}_pg0001", record.comic_id));
        let orders: Vec<u32> = page.panels.iter().map(|p| p.order_index).collect();
        assert_eq!(orders, vec![1, 2]);
        let bubbles = &page.panels[0].bubbles;
        assert_eq!(bubbles[0].order_index, 1);
        assert_eq!(bubbles[0].speaker_id.as_deref(), Some("char_0"));
        assert_eq!(bubbles[0].emotion_tag, "happy");

        // Narrator registered, voices assigned
        let narrator = comic.speakers.iter().find(|s| s.speaker_id == NARRATOR_ID).unwrap();
        assert_eq!(narrator.voice_id, "sage");
        let hero = comic.speakers.iter().find(|s| s.speaker_id == "char_0").unwrap();
        assert_eq!(hero.voice_id, "echo");

        // Sfx bubbles are never spoken
        let speech = f.audio.speech.lock().unwrap().clone();
        assert!(speech.iter().all(|(id, _)| !id.ends_with("_b002")));
        assert!(speech.iter().any(|(id, voice)| id.ends_with("_b001") && voice == "echo"));
        assert!(speech.iter().any(|(id, voice)| id.ends_with("_b003") && voice == "sage"));

        // Ambience prompts came from the sound director
        assert_eq!(*f.vision.sfx_prompt_calls.lock().unwrap(), 1);
        let ambience = f.audio.ambience.lock().unwrap().clone();
        assert_eq!(ambience.len(), 4);
        assert!(ambience.iter().all(|(_, prompt)| prompt == "city street at night"));

        let saved = f.store.load_manifest(&record.comic_id).await?.unwrap();
        assert_eq!(saved, comic);
        assert!(comic.panels().all(|p| p.normalized_image_path.is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreliable_orders_are_made_dense() -> Result<()> {
        let mut config = Config::default();
        config.story_track.enabled = false;
        let vision = MockVision {
            sloppy_orders: true,
            ..Default::default()
        };
        let f = fixture(config, vision, MockStory::default(), 1);
        let mut record = new_record(&f.store).await;

        let comic = f.workflow.run(&mut record, request(false)).await?;

        let page = &comic.pages[0];
        let orders: Vec<u32> = page.panels.iter().map(|p| p.order_index).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        for panel in &page.panels {
            let orders: Vec<u32> = panel.bubbles.iter().map(|b| b.order_index).collect();
            assert_eq!(orders, vec![1, 2, 3]);
            assert!(panel.bubbles.iter().all(|b| b.bubble_id.starts_with(&panel.panel_id)));
            // Tied speech and narration keep their relative order
            assert_eq!(panel.bubbles[0].text, "Hello");
            assert_eq!(panel.bubbles[1].text, "Meanwhile");
        }

        let mut ids: Vec<String> = comic
            .panels()
            .flat_map(|p| p.bubbles.iter().map(|b| b.bubble_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 9);

        // Every spoken bubble got its own clip
        let mut spoken: Vec<String> = f
            .audio
            .speech
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        spoken.sort();
        spoken.dedup();
        assert_eq!(spoken.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_never_decreases() -> Result<()> {
        let f = fixture(Config::default(), MockVision::default(), MockStory::default(), 1);
        let mut record = new_record(&f.store).await;
        f.workflow.run(&mut record, request(true)).await?;

        let history = f.history.lock().unwrap().clone();
        assert!(history.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(history.last(), Some(&(ProcessingStage::Done, 100)));
        assert!(history.contains(&(ProcessingStage::Normalization, 90)));
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_bible_seeds_attribution_and_ambience() -> Result<()> {
        let story_done = Arc::new(Notify::new());
        let vision = MockVision {
            wait_before_panels: Some(story_done.clone()),
            ..Default::default()
        };
        let story = MockStory {
            with_sfx_cues: true,
            finished: Some(story_done),
            ..Default::default()
        };
        let f = fixture(Config::default(), vision, story, 3);
        let mut record = new_record(&f.store).await;

        let comic = f.workflow.run(&mut record, request(false)).await?;

        // The known list offered for the first panel already had the bible's character
        let known = f.vision.known_at_first_attribution.lock().unwrap().clone();
        assert_eq!(known, vec!["char_001".to_string()]);
        assert!(comic.speakers.iter().any(|s| s.inferred_label == "Captain"));

        // Bible cues replace the sound director
        assert_eq!(*f.vision.sfx_prompt_calls.lock().unwrap(), 0);
        let first_panel = format!("{}_pg0001_p001", record.comic_id);
        let ambience = f.audio.ambience.lock().unwrap().clone();
        assert!(ambience.contains(&(first_panel, "waves against the hull".to_string())));
        assert!(ambience.iter().any(|(_, p)| p == DEFAULT_SFX_PROMPT));

        let expected = f.store.story_bible_path(&record.comic_id);
        assert_eq!(record.story_bible_path, Some(expected.to_string_lossy().to_string()));
        assert!(f.store.load_story_bible(&record.comic_id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_story_track_failure_is_isolated() -> Result<()> {
        let story_done = Arc::new(Notify::new());
        let vision = MockVision {
            wait_before_panels: Some(story_done.clone()),
            ..Default::default()
        };
        let story = MockStory {
            fail: true,
            finished: Some(story_done),
            ..Default::default()
        };
        let f = fixture(Config::default(), vision, story, 2);
        let mut record = new_record(&f.store).await;

        f.workflow.run(&mut record, request(false)).await?;
        assert_eq!(record.processing_stage, ProcessingStage::Done);
        assert!(record.story_bible_path.is_none());
        assert_eq!(*f.vision.sfx_prompt_calls.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_bible_synthesis_is_isolated() -> Result<()> {
        let story_done = Arc::new(Notify::new());
        let vision = MockVision {
            wait_before_panels: Some(story_done.clone()),
            ..Default::default()
        };
        let story = MockStory {
            fail_synthesis: true,
            with_sfx_cues: true,
            finished: Some(story_done),
            ..Default::default()
        };
        let f = fixture(Config::default(), vision, story, 2);
        let mut record = new_record(&f.store).await;

        f.workflow.run(&mut record, request(false)).await?;
        assert_eq!(record.processing_stage, ProcessingStage::Done);
        assert_eq!(record.progress_pct, 100);
        assert!(record.story_bible_path.is_none());
        assert!(f.store.load_story_bible(&record.comic_id).await?.is_none());
        assert_eq!(*f.story.synthesis_calls.lock().unwrap(), 1);

        // Attribution ran unseeded and the sound director supplied the prompts
        assert!(f.vision.known_at_first_attribution.lock().unwrap().is_empty());
        assert_eq!(*f.vision.sfx_prompt_calls.lock().unwrap(), 1);
        let ambience = f.audio.ambience.lock().unwrap().clone();
        assert!(ambience.iter().all(|(_, prompt)| prompt == "city street at night"));
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_story_track_is_cancelled_at_join() -> Result<()> {
        let story = MockStory {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        };
        let f = fixture(Config::default(), MockVision::default(), story, 2);
        let mut record = new_record(&f.store).await;

        f.workflow.run(&mut record, request(false)).await?;
        assert_eq!(record.processing_stage, ProcessingStage::Done);
        assert!(record.story_bible_path.is_none());
        assert_eq!(*f.story.synthesis_calls.lock().unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_primary_failure_marks_failed() {
        let vision = MockVision {
            fail_ocr: true,
            ..Default::default()
        };
        let story = MockStory {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        };
        let f = fixture(Config::default(), vision, story, 2);
        let mut record = new_record(&f.store).await;

        let err = f.workflow.run(&mut record, request(false)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Bubble OCR failed"));

        let saved = f.store.load_record(&record.comic_id).await.unwrap().unwrap();
        assert_eq!(saved.processing_stage, ProcessingStage::Failed);
        assert_eq!(saved.progress_pct, 25);
        assert!(saved.error_message.unwrap().contains("ocr exploded"));
        assert_eq!(*f.story.synthesis_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_normalization_fills_panel_fields() -> Result<()> {
        let mut config = Config::default();
        config.story_track.enabled = false;
        let f = fixture(config, MockVision::default(), MockStory::default(), 1);
        let mut record = new_record(&f.store).await;

        let comic = f.workflow.run(&mut record, request(true)).await?;
        assert!(comic.normalization_enabled);
        for panel in comic.panels() {
            assert_eq!(
                panel.normalized_image_path.as_deref(),
                Some(format!("normalised/{}.png", panel.panel_id).as_str())
            );
            assert_eq!(panel.normalization_fill_model.as_deref(), Some("mock-fill"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_range_completes_with_no_pages() -> Result<()> {
        let f = fixture(Config::default(), MockVision::default(), MockStory::default(), 3);
        let mut record = new_record(&f.store).await;
        let mut req = request(false);
        req.page_range = Some((7, None));

        let comic = f.workflow.run(&mut record, req).await?;
        assert!(comic.pages.is_empty());
        assert_eq!(record.page_range, None);
        assert_eq!(record.processing_stage, ProcessingStage::Done);
        assert!(f.story.ranges.lock().unwrap().is_empty());
        Ok(())
    }
}
