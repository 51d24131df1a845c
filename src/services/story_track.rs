//! Whole-document story analysis that runs beside the primary pipeline.
//!
//! Pages are split into overlapping windows, every window is analysed
//! concurrently, then one reduction call merges the fragments into a
//! [`StoryBible`]. The pipeline never waits on this work: it peeks at the
//! handle at its checkpoints and cancels it if it is still running at the end.

use crate::core::state::StoryBible;
use crate::services::agents::StoryAgent;
use crate::services::error::AgentError;
use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 0-based inclusive windows over `total` pages.
pub fn plan_windows(total: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    if total == 0 {
        return windows;
    }
    let mut start = 0;
    loop {
        let end = (start + window - 1).min(total - 1);
        windows.push((start, end));
        if end == total - 1 {
            break;
        }
        start += step;
    }
    windows
}

/// Analyses every window concurrently, then reduces. Any failing call fails
/// the whole track.
///
/// `pages` holds `(page_number, image_path)` in page order; window labels use
/// the real page numbers.
pub async fn run_story_track(
    agent: &dyn StoryAgent,
    pages: &[(u32, String)],
    comic_id: &str,
    window: usize,
    overlap: usize,
) -> Result<StoryBible, AgentError> {
    let windows = plan_windows(pages.len(), window, overlap);
    info!(
        "Story track for {}: {} pages in {} windows",
        comic_id,
        pages.len(),
        windows.len()
    );

    let calls = windows.iter().map(|&(start, end)| {
        let slice = &pages[start..=end];
        let paths: Vec<String> = slice.iter().map(|(_, p)| p.clone()).collect();
        let range = (slice[0].0, slice[slice.len() - 1].0);
        async move {
            let fragment = agent.analyse_page_range(&paths, range, comic_id, &[]).await?;
            debug!("Story window {}-{} analysed", range.0, range.1);
            Ok::<_, AgentError>(fragment)
        }
    });
    let fragments = futures_util::future::try_join_all(calls).await?;

    agent.synthesise_story_bible(&fragments, comic_id).await
}

/// Observable state of the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryTrackState {
    Pending,
    Ready,
    Failed,
    /// The result was handed over (or the task was cancelled).
    Taken,
}

enum Slot {
    Running(JoinHandle<Result<StoryBible, AgentError>>),
    Finished(Result<StoryBible>),
    Taken,
}

pub struct StoryTrackHandle {
    slot: Slot,
}

impl StoryTrackHandle {
    /// Spawns the track on the current tokio runtime. Fails only when there is
    /// no runtime to spawn on.
    pub fn spawn(
        agent: Arc<dyn StoryAgent>,
        pages: Vec<(u32, String)>,
        comic_id: String,
        window: usize,
        overlap: usize,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("Cannot launch story track: {}", e))?;
        let task = runtime.spawn(async move {
            run_story_track(agent.as_ref(), &pages, &comic_id, window, overlap).await
        });
        Ok(Self::from_task(task))
    }

    pub fn from_task(task: JoinHandle<Result<StoryBible, AgentError>>) -> Self {
        Self {
            slot: Slot::Running(task),
        }
    }

    fn settle(joined: Result<Result<StoryBible, AgentError>, tokio::task::JoinError>) -> Result<StoryBible> {
        match joined {
            Ok(Ok(bible)) => Ok(bible),
            Ok(Err(e)) => Err(anyhow!("story track failed: {}", e)),
            Err(e) if e.is_cancelled() => Err(anyhow!("story track was cancelled")),
            Err(e) => Err(anyhow!("story track panicked: {}", e)),
        }
    }

    /// Moves a completed task's output into the slot without waiting.
    fn poll(&mut self) {
        if let Slot::Running(task) = &mut self.slot {
            if task.is_finished() {
                if let Some(joined) = task.now_or_never() {
                    self.slot = Slot::Finished(Self::settle(joined));
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.slot {
            Slot::Running(task) => task.is_finished(),
            Slot::Finished(_) | Slot::Taken => true,
        }
    }

    pub fn state(&mut self) -> StoryTrackState {
        self.poll();
        match &self.slot {
            Slot::Running(_) => StoryTrackState::Pending,
            Slot::Finished(Ok(_)) => StoryTrackState::Ready,
            Slot::Finished(Err(_)) => StoryTrackState::Failed,
            Slot::Taken => StoryTrackState::Taken,
        }
    }

    /// Never waits. `None` while the task is still running or after the
    /// result was already handed over.
    pub fn try_take(&mut self) -> Option<Result<StoryBible>> {
        self.poll();
        match std::mem::replace(&mut self.slot, Slot::Taken) {
            Slot::Finished(result) => Some(result),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Aborts a running task and waits for it to wind down. Cancellation and
    /// task errors are both accepted outcomes.
    pub async fn cancel_and_wait(&mut self) {
        if let Slot::Running(task) = std::mem::replace(&mut self.slot, Slot::Taken) {
            task.abort();
            match task.await {
                Ok(_) => debug!("Story track finished before cancellation took effect"),
                Err(e) if e.is_cancelled() => debug!("Story track cancelled"),
                Err(e) => warn!("Story track ended with an error during cancellation: {}", e),
            }
        }
    }

    /// End-of-run join: a finished, untaken result is returned; a running
    /// task is cancelled.
    pub async fn join_for_persistence(&mut self) -> Option<StoryBible> {
        if !self.is_finished() {
            self.cancel_and_wait().await;
            return None;
        }
        match self.try_take()? {
            Ok(bible) => Some(bible),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        }
    }
}

impl Drop for StoryTrackHandle {
    fn drop(&mut self) {
        if let Slot::Running(task) = &self.slot {
            task.abort();
        }
    }
}
