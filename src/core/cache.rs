//! Content-addressed run cache.
//!
//! Layout under the storage root:
//!
//! ```text
//! index.json                      pdf_hash -> comic_id
//! {comic_id}/cache_record.json    RunRecord
//! {comic_id}/manifest.json        Comic
//! {comic_id}/story_bible.json     StoryBible (when the story track succeeded)
//! {comic_id}/source.pdf           uploaded document
//! {comic_id}/pages/               rendered page PNGs
//! {comic_id}/panels/              cropped panel PNGs (+ normalised/)
//! {comic_id}/audio/voice/         per-bubble speech
//! {comic_id}/audio/sfx/           per-panel ambience
//! ```

use crate::core::io::Storage;
use crate::core::state::{Comic, ProcessingStage, RunRecord, StoryBible};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub fn hash_pdf(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct CacheStore {
    root: PathBuf,
    storage: Arc<dyn Storage>,
    index_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.into(),
            storage,
            index_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn comic_dir(&self, comic_id: &str) -> PathBuf {
        self.root.join(comic_id)
    }

    pub fn record_path(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("cache_record.json")
    }

    pub fn manifest_path(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("manifest.json")
    }

    pub fn story_bible_path(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("story_bible.json")
    }

    pub fn source_pdf_path(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("source.pdf")
    }

    pub fn pages_dir(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("pages")
    }

    pub fn panels_dir(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("panels")
    }

    pub fn normalised_dir(&self, comic_id: &str) -> PathBuf {
        self.panels_dir(comic_id).join("normalised")
    }

    pub fn voice_dir(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("audio").join("voice")
    }

    pub fn sfx_dir(&self, comic_id: &str) -> PathBuf {
        self.comic_dir(comic_id).join("audio").join("sfx")
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(path).await?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.storage.write(path, content.as_bytes()).await
    }

    async fn load_index(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.read_json(&self.index_path()).await?.unwrap_or_default())
    }

    pub async fn lookup_by_hash(&self, pdf_hash: &str) -> Result<Option<String>> {
        Ok(self.load_index().await?.get(pdf_hash).cloned())
    }

    /// Creates a fresh record and registers it in the index straight away.
    /// The record itself is not persisted until `save_record`.
    pub async fn create_record(&self, pdf_hash: &str, title: &str) -> Result<RunRecord> {
        let comic_id = Uuid::now_v7().to_string();
        let now = now_iso();
        let record = RunRecord {
            comic_id: comic_id.clone(),
            pdf_hash: pdf_hash.to_string(),
            manifest_path: self.manifest_path(&comic_id).to_string_lossy().to_string(),
            playback_token: Uuid::new_v4().simple().to_string(),
            processing_stage: ProcessingStage::Queued,
            progress_pct: 0,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            title: title.to_string(),
            normalization_enabled: false,
            page_range: None,
            story_bible_path: None,
        };

        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        index.insert(pdf_hash.to_string(), comic_id);
        self.write_json(&self.index_path(), &index).await?;

        Ok(record)
    }

    pub async fn save_record(&self, record: &mut RunRecord) -> Result<()> {
        record.updated_at = now_iso();
        self.write_json(&self.record_path(&record.comic_id), record).await
    }

    pub async fn load_record(&self, comic_id: &str) -> Result<Option<RunRecord>> {
        self.read_json(&self.record_path(comic_id)).await
    }

    pub async fn load_record_by_token(&self, token: &str) -> Result<Option<RunRecord>> {
        // Linear scan. The index is small and token lookups are rare.
        let index = self.load_index().await?;
        for comic_id in index.values() {
            if let Some(record) = self.load_record(comic_id).await? {
                if record.playback_token == token {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Overwrites stage, progress and error, then persists the record.
    pub async fn update_stage(
        &self,
        record: &mut RunRecord,
        stage: ProcessingStage,
        progress_pct: u8,
        error: Option<String>,
    ) -> Result<()> {
        record.processing_stage = stage;
        record.progress_pct = progress_pct.min(100);
        record.error_message = error;
        self.save_record(record).await
    }

    pub async fn save_manifest(&self, comic: &Comic) -> Result<()> {
        self.write_json(&self.manifest_path(&comic.comic_id), comic).await
    }

    pub async fn load_manifest(&self, comic_id: &str) -> Result<Option<Comic>> {
        self.read_json(&self.manifest_path(comic_id)).await
    }

    pub async fn save_story_bible(&self, bible: &StoryBible) -> Result<PathBuf> {
        let path = self.story_bible_path(&bible.comic_id);
        self.write_json(&path, bible).await?;
        Ok(path)
    }

    pub async fn load_story_bible(&self, comic_id: &str) -> Result<Option<StoryBible>> {
        self.read_json(&self.story_bible_path(comic_id)).await
    }

    pub async fn save_source_pdf(&self, comic_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.source_pdf_path(comic_id);
        self.storage.write(&path, bytes).await?;
        Ok(path)
    }
}
