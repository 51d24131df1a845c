//! Submission, status and retrieval of runs.
//!
//! Each accepted submission becomes one spawned pipeline task. The service
//! keeps a map of the runs still in flight so it can refuse conflicting
//! requests and let callers wait for completion.

use crate::core::cache::{hash_pdf, CacheStore};
use crate::core::config::{ConfigDiff, Settings};
use crate::core::state::{Comic, ProcessingStage, RunRecord, StoryBible};
use crate::services::error::RunError;
use crate::services::workflow::{RunRequest, WorkflowManager};
use futures_util::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub title: String,
    pub normalization: bool,
    pub force_reprocess: bool,
    /// 1-based, inclusive.
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub comic_id: String,
    pub stage: ProcessingStage,
    pub progress_pct: u8,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub comic_id: String,
    pub stage: ProcessingStage,
    pub progress_pct: u8,
    pub error: Option<String>,
}

impl From<&RunRecord> for RunStatus {
    fn from(record: &RunRecord) -> Self {
        Self {
            comic_id: record.comic_id.clone(),
            stage: record.processing_stage,
            progress_pct: record.progress_pct,
            error: record.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackInfo {
    pub comic_id: String,
    pub token: String,
}

pub struct RunService {
    settings: Settings,
    store: Arc<CacheStore>,
    workflow: Arc<WorkflowManager>,
    /// comic_id -> flips to `true` when the task ends
    running: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
    /// Held from the index lookup until the new run is registered.
    admission: Mutex<()>,
}

impl RunService {
    pub fn new(settings: Settings, workflow: Arc<WorkflowManager>) -> Self {
        Self {
            settings,
            store: workflow.store().clone(),
            workflow,
            running: Arc::new(Mutex::new(HashMap::new())),
            admission: Mutex::new(()),
        }
    }

    pub async fn is_running(&self, comic_id: &str) -> bool {
        self.running.lock().await.contains_key(comic_id)
    }

    async fn record(&self, comic_id: &str) -> Result<RunRecord, RunError> {
        self.store
            .load_record(comic_id)
            .await?
            .ok_or_else(|| RunError::NotFound(format!("Comic not found: {}", comic_id)))
    }

    pub async fn submit(&self, bytes: &[u8], options: SubmitOptions) -> Result<SubmitOutcome, RunError> {
        if bytes.is_empty() {
            return Err(RunError::InvalidInput("Empty upload".to_string()));
        }
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(RunError::InvalidInput("Upload is not a PDF document".to_string()));
        }
        let page_range = requested_range(options.page_start, options.page_end)?;
        let pdf_hash = hash_pdf(bytes);

        let _admission = self.admission.lock().await;
        if !options.force_reprocess {
            if let Some(existing) = self.store.lookup_by_hash(&pdf_hash).await? {
                if let Some(record) = self.store.load_record(&existing).await? {
                    if record.processing_stage == ProcessingStage::Done {
                        info!("Cache hit for {}: {}", pdf_hash, record.comic_id);
                        return Ok(outcome(&record, true));
                    }
                    if self.is_running(&record.comic_id).await {
                        info!("{} is already being processed", record.comic_id);
                        return Ok(outcome(&record, false));
                    }
                }
            }
        }

        self.start(bytes, &pdf_hash, &options.title, options.normalization, page_range)
            .await
    }

    /// Creates a fresh record for the document and launches its pipeline.
    async fn start(
        &self,
        bytes: &[u8],
        pdf_hash: &str,
        title: &str,
        normalization: bool,
        page_range: Option<(u32, Option<u32>)>,
    ) -> Result<SubmitOutcome, RunError> {
        let mut record = self.store.create_record(pdf_hash, title).await?;
        record.normalization_enabled = normalization;
        let pdf_path = self.store.save_source_pdf(&record.comic_id, bytes).await?;
        self.store.save_record(&mut record).await?;

        let request = RunRequest {
            pdf_path,
            title: title.to_string(),
            normalization_enabled: normalization,
            page_range,
        };
        let queued = outcome(&record, false);
        self.launch(record, request).await;
        Ok(queued)
    }

    async fn launch(&self, record: RunRecord, request: RunRequest) {
        let comic_id = record.comic_id.clone();
        let (done_tx, done_rx) = watch::channel(false);
        let workflow = self.workflow.clone();
        let store = self.store.clone();
        let running = self.running.clone();

        // Held across the spawn so the task cannot deregister before it is registered
        let mut guard = self.running.lock().await;
        let task_id = comic_id.clone();
        tokio::spawn(async move {
            let mut record = record;
            let result = AssertUnwindSafe(workflow.run(&mut record, request))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Pipeline for {} ended with an error: {:#}", task_id, e),
                Err(_) => {
                    error!("Pipeline for {} panicked", task_id);
                    let pct = record.progress_pct;
                    let message = Some("Pipeline task panicked".to_string());
                    if let Err(e) = store
                        .update_stage(&mut record, ProcessingStage::Failed, pct, message)
                        .await
                    {
                        error!("Could not persist failure for {}: {:#}", task_id, e);
                    }
                }
            }
            running.lock().await.remove(&task_id);
            let _ = done_tx.send(true);
        });
        guard.insert(comic_id.clone(), done_rx);
        info!("Launched pipeline for {}", comic_id);
    }

    /// Resolves once the run's task has ended. Immediate for runs that are
    /// not in flight.
    pub async fn wait(&self, comic_id: &str) {
        let receiver = self.running.lock().await.get(comic_id).cloned();
        if let Some(mut done) = receiver {
            // A closed channel also means the task is gone
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub async fn status(&self, comic_id: &str) -> Result<RunStatus, RunError> {
        Ok(RunStatus::from(&self.record(comic_id).await?))
    }

    pub async fn manifest(&self, comic_id: &str) -> Result<Comic, RunError> {
        let record = self.record(comic_id).await?;
        if record.processing_stage != ProcessingStage::Done {
            return Err(RunError::Conflict(format!(
                "Processing not complete. Stage: {}",
                record.processing_stage
            )));
        }
        self.store
            .load_manifest(comic_id)
            .await?
            .ok_or_else(|| RunError::NotFound("Manifest not found on disk".to_string()))
    }

    pub async fn playback(&self, comic_id: &str) -> Result<PlaybackInfo, RunError> {
        let record = self.record(comic_id).await?;
        Ok(PlaybackInfo {
            comic_id: record.comic_id,
            token: record.playback_token,
        })
    }

    pub async fn resolve_token(&self, token: &str) -> Result<String, RunError> {
        self.store
            .load_record_by_token(token)
            .await?
            .map(|record| record.comic_id)
            .ok_or_else(|| RunError::NotFound("Invalid playback token".to_string()))
    }

    /// Runs the stored document again under a new identity. `normalization`
    /// overrides the previous run's choice when given.
    pub async fn reprocess(
        &self,
        comic_id: &str,
        normalization: Option<bool>,
    ) -> Result<SubmitOutcome, RunError> {
        let record = self.record(comic_id).await?;
        let _admission = self.admission.lock().await;
        if self.is_running(comic_id).await {
            return Err(RunError::Conflict(format!(
                "{} is still being processed. Stage: {}",
                comic_id, record.processing_stage
            )));
        }
        // An earlier reprocess of the same document may still be running
        if let Some(latest) = self.store.lookup_by_hash(&record.pdf_hash).await? {
            if latest != comic_id && self.is_running(&latest).await {
                return Err(RunError::Conflict(format!(
                    "{} is already being reprocessed as {}",
                    comic_id, latest
                )));
            }
        }
        let source = self.store.source_pdf_path(comic_id);
        if !self.store.storage().exists(&source).await? {
            return Err(RunError::Unsupported(
                "Original document is not retained; re-upload it with force_reprocess".to_string(),
            ));
        }
        let bytes = self.store.storage().read(&source).await?;
        let page_range = record.page_range.map(|(start, end)| (start, Some(end)));
        self.start(
            &bytes,
            &record.pdf_hash,
            &record.title,
            normalization.unwrap_or(record.normalization_enabled),
            page_range,
        )
        .await
    }

    pub async fn story_bible(&self, comic_id: &str) -> Result<StoryBible, RunError> {
        self.record(comic_id).await?;
        self.store
            .load_story_bible(comic_id)
            .await?
            .ok_or_else(|| RunError::NotFound(format!("No story bible for {}", comic_id)))
    }

    pub fn reload_config(&self) -> Result<ConfigDiff, RunError> {
        let diff = self.settings.reload()?;
        info!("Config reloaded; changed: {:?}", diff.changed);
        if !diff.restart_required.is_empty() {
            warn!("Restart to apply: {:?}", diff.restart_required);
        }
        Ok(diff)
    }
}

fn outcome(record: &RunRecord, cached: bool) -> SubmitOutcome {
    SubmitOutcome {
        comic_id: record.comic_id.clone(),
        stage: record.processing_stage,
        progress_pct: record.progress_pct,
        cached,
    }
}

/// `page_end` alone starts at the first page; `page_start` alone runs to the
/// last page once the count is known.
fn requested_range(
    page_start: Option<u32>,
    page_end: Option<u32>,
) -> Result<Option<(u32, Option<u32>)>, RunError> {
    match (page_start, page_end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) if start.max(1) > end => Err(RunError::InvalidInput(format!(
            "page_start {} is after page_end {}",
            start, end
        ))),
        (start, end) => Ok(Some((start.unwrap_or(1).max(1), end))),
    }
}
