use super::AudioAgent;
use crate::core::cache::CacheStore;
use crate::core::config::Settings;
use crate::core::state::{Bubble, Panel};
use crate::services::error::AgentError;
use crate::services::llm::{OpenRouterClient, SpeechRequest};
use crate::utils::audio::{scan_wav, silent_wav, PLACEHOLDER_SAMPLE_RATE};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const SFX_DURATION_SECS: u32 = 4;

#[derive(Serialize)]
struct SfxRequest<'a> {
    prompt: &'a str,
    duration: u32,
}

/// Speech through the OpenRouter speech endpoint; ambience through the
/// optional external generator.
pub struct OpenRouterAudioAgent {
    tts: OpenRouterClient,
    http: reqwest::Client,
    settings: Settings,
    store: Arc<CacheStore>,
}

impl OpenRouterAudioAgent {
    pub fn new(settings: Settings, store: Arc<CacheStore>) -> Result<Self, AgentError> {
        let tts = OpenRouterClient::new(settings.clone())?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self {
            tts,
            http,
            settings,
            store,
        })
    }

    async fn fetch_ambience(&self, base_url: &str, prompt: &str) -> Result<Vec<u8>, AgentError> {
        let url = format!("{}/generate", base_url.trim_end_matches('/'));
        let timeout = Duration::from_secs(self.settings.current().openrouter.timeout_seconds);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&SfxRequest {
                prompt,
                duration: SFX_DURATION_SECS,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(AgentError::empty(format!("sfx_api prompt={:?}", prompt)));
        }
        Ok(bytes.to_vec())
    }
}

/// File extension for generated ambience. Anything that is not a WAV is
/// assumed to be MP3.
pub fn ambience_extension(bytes: &[u8]) -> &'static str {
    match scan_wav(bytes) {
        Ok(info) => {
            debug!("ambience clip: {:.1}s", info.duration_secs());
            "wav"
        }
        Err(_) => "mp3",
    }
}

#[async_trait]
impl AudioAgent for OpenRouterAudioAgent {
    async fn synthesize_speech(
        &self,
        bubble: &Bubble,
        voice_id: &str,
        comic_id: &str,
    ) -> Result<String, AgentError> {
        let emotion = if bubble.emotion_tag.is_empty() {
            "neutral"
        } else {
            bubble.emotion_tag.as_str()
        };
        let instructions = format!("Speak with a {} tone.", emotion);
        let model = self.settings.current().models.tts.clone();
        let audio = self
            .tts
            .speech(&SpeechRequest {
                model: &model,
                input: &bubble.text,
                voice: voice_id,
                instructions: &instructions,
                response_format: "mp3",
            })
            .await?;

        let path = self
            .store
            .voice_dir(comic_id)
            .join(format!("{}.mp3", bubble.bubble_id));
        self.store
            .storage()
            .write(&path, &audio)
            .await
            .map_err(AgentError::storage)?;
        Ok(path.to_string_lossy().to_string())
    }

    async fn generate_ambience(
        &self,
        panel: &Panel,
        prompt: &str,
        comic_id: &str,
    ) -> Result<String, AgentError> {
        let sfx_api_url = self.settings.current().sfx_api_url.clone();
        let audio = match sfx_api_url {
            Some(url) => self.fetch_ambience(&url, prompt).await?,
            None => {
                warn!("No sfx_api_url configured; writing silent ambience for {}", panel.panel_id);
                silent_wav(SFX_DURATION_SECS, PLACEHOLDER_SAMPLE_RATE)
            }
        };

        let path = self.store.sfx_dir(comic_id).join(format!(
            "{}.{}",
            panel.panel_id,
            ambience_extension(&audio)
        ));
        self.store
            .storage()
            .write(&path, &audio)
            .await
            .map_err(AgentError::storage)?;
        Ok(path.to_string_lossy().to_string())
    }
}
