use super::StoryAgent;
use crate::core::cache::{now_iso, CacheStore};
use crate::core::state::{CharacterProfile, StoryBible, StoryFragment};
use crate::services::decode::extract_json;
use crate::services::error::AgentError;
use crate::services::llm::LlmClient;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

const PAGE_RANGE_SYSTEM_PROMPT: &str = r#"You are a comic story analyst. Given a sequence of comic page images and a list
of already-known character profiles, analyse the pages and return a structured
JSON summary.

Your response MUST be a single JSON object with this exact schema:
{
  "page_range": [<first_page_int>, <last_page_int>],
  "characters": [
    {
      "character_id": "char_001",
      "name": "<inferred name or label>",
      "description": "<physical appearance>",
      "personality": "<personality traits>",
      "arc_summary": "<how this character changes across these pages>",
      "voice_tone_rules": "<speaking style cues>",
      "gender": "male|female|unknown",
      "age_group": "child|teen|adult|elder"
    }
  ],
  "events": [
    {"pages": [<int>, ...], "summary": "<event summary>", "tone": "<tone>"}
  ],
  "sfx_palette": [
    {"page": <int>, "panel_order": <int>, "prompt": "<sound prompt, at most 12 words>"}
  ],
  "unresolved": ["<open question or ambiguity string>", ...]
}

Rules:
- Reuse character_ids from known_characters when the same character appears.
- Only create a new character_id when a genuinely new character appears.
- sfx_palette should have one entry per panel with a short sound prompt.
- Respond ONLY with the JSON object. No markdown, no explanation."#;

const STORY_DIRECTOR_SYSTEM_PROMPT: &str = r#"You are a senior story director for a comic audiobook production. You have
received a list of story fragments, each analysing a sub-range of pages.

Your task is to synthesise these fragments into a unified story bible.

Return ONLY a JSON object with this exact schema:
{
  "comic_id": "<comic_id>",
  "characters": [
    {
      "character_id": "char_001",
      "name": "<canonical name>",
      "description": "<merged physical appearance>",
      "personality": "<merged personality traits>",
      "arc_summary": "<full story arc across all pages>",
      "voice_tone_rules": "<speaking style cues>",
      "gender": "male|female|unknown",
      "age_group": "child|teen|adult|elder"
    }
  ],
  "per_panel_sfx": {
    "<panel_id>": "<sound prompt, at most 12 words>"
  },
  "genre": "<inferred genre>",
  "tone_summary": "<overall tone of the story>",
  "narrator_voice_style": "<style cues for the narrator voice>"
}

Rules for per_panel_sfx keys:
  panel_id format = "{comic_id}_pg{page:04d}_p{panel_order:03d}"
  e.g. "mycomic_pg0001_p001"

Rules for characters:
  - Deduplicate: if two fragments give the same character different IDs,
    reconcile them under one canonical ID (prefer earlier-appearing ID).
  - Merge descriptions and arc summaries coherently.

No markdown, no explanation. Raw JSON only."#;

/// Story agent backed by a multimodal chat model. The reduction step writes
/// the bible to the run's directory.
pub struct LlmStoryAgent {
    llm: Arc<dyn LlmClient>,
    store: Arc<CacheStore>,
}

impl LlmStoryAgent {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<CacheStore>) -> Self {
        Self { llm, store }
    }
}

#[async_trait]
impl StoryAgent for LlmStoryAgent {
    async fn analyse_page_range(
        &self,
        page_paths: &[String],
        page_range: (u32, u32),
        _comic_id: &str,
        known: &[CharacterProfile],
    ) -> Result<StoryFragment, AgentError> {
        let context = format!("page_range_agent pages={}-{}", page_range.0, page_range.1);
        let known_json = serde_json::to_string_pretty(known)
            .map_err(|e| AgentError::schema(&context, e.to_string()))?;
        let user_text = format!(
            "Page range: {}-{}\nKnown characters:\n{}\n\nAnalyse these comic pages and return the structured JSON.",
            page_range.0, page_range.1, known_json
        );

        let raw = self.llm.chat(PAGE_RANGE_SYSTEM_PROMPT, &user_text, page_paths).await?;
        let mut fragment: StoryFragment = extract_json(&raw, &context)?;
        // Labels come from the caller, not the model
        fragment.page_range = page_range;
        Ok(fragment)
    }

    async fn synthesise_story_bible(
        &self,
        fragments: &[StoryFragment],
        comic_id: &str,
    ) -> Result<StoryBible, AgentError> {
        let fragments_json = serde_json::to_string_pretty(fragments)
            .map_err(|e| AgentError::schema("story_director", e.to_string()))?;
        let user_text = format!(
            "comic_id: {}\n\nStory fragments:\n{}\n\nSynthesise these fragments into a unified story bible.",
            comic_id, fragments_json
        );

        let raw = self.llm.chat(STORY_DIRECTOR_SYSTEM_PROMPT, &user_text, &[]).await?;
        let mut bible: StoryBible = extract_json(&raw, "story_director")?;
        bible.comic_id = comic_id.to_string();
        bible.created_at = now_iso();

        let path = self
            .store
            .save_story_bible(&bible)
            .await
            .map_err(AgentError::storage)?;
        info!(
            "Story bible for {}: {} characters, {} panel cues -> {}",
            comic_id,
            bible.characters.len(),
            bible.per_panel_sfx.len(),
            path.display()
        );
        Ok(bible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use anyhow::Result;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FixedLlm {
        response: String,
        users: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat(&self, _system: &str, user: &str, _images: &[String]) -> Result<String, AgentError> {
            self.users.lock().unwrap().push(user.to_string());
            Ok(self.response.clone())
        }
    }

    fn fixed(response: &str) -> Arc<FixedLlm> {
        Arc::new(FixedLlm {
            response: response.to_string(),
            users: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_fragment_keeps_requested_range() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(CacheStore::new(temp_dir.path(), Arc::new(NativeStorage::new())));
        let llm = fixed(r#"{"page_range": [1, 3], "characters": [{"character_id": "char_001", "name": "Ada"}],
            "sfx_palette": [{"page": 9, "panel_order": 1, "prompt": "rain"}]}"#);
        let agent = LlmStoryAgent::new(llm.clone(), store);

        let fragment = agent.analyse_page_range(&[], (9, 18), "c", &[]).await?;
        assert_eq!(fragment.page_range, (9, 18));
        assert_eq!(fragment.characters[0].name, "Ada");
        assert_eq!(fragment.sfx_palette[0].prompt, "rain");
        assert!(llm.users.lock().unwrap()[0].starts_with("Page range: 9-18"));
        Ok(())
    }

    #[tokio::test]
    async fn test_synthesis_persists_bible() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(CacheStore::new(temp_dir.path(), Arc::new(NativeStorage::new())));
        let llm = fixed(r#"```json
            {"comic_id": "wrong", "characters": [], "per_panel_sfx": {"c_pg0001_p001": "wind"}, "genre": "noir"}
            ```"#);
        let agent = LlmStoryAgent::new(llm, store.clone());

        let bible = agent.synthesise_story_bible(&[StoryFragment::default()], "c").await?;
        assert_eq!(bible.comic_id, "c");
        assert!(!bible.created_at.is_empty());
        assert_eq!(store.load_story_bible("c").await?, Some(bible));
        Ok(())
    }
}
