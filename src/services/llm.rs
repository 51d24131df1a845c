use crate::core::config::{Config, Settings};
use crate::services::error::AgentError;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    /// `images` are local file paths sent inline ahead of the user text.
    async fn chat(&self, system: &str, user: &str, images: &[String]) -> Result<String, AgentError>;
}

/// Reads key, endpoint, timeout and model from the shared settings on every
/// request, so a reload takes effect on the next call.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    settings: Settings,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Serialize)]
pub struct SpeechRequest<'a> {
    pub model: &'a str,
    pub input: &'a str,
    pub voice: &'a str,
    pub instructions: &'a str,
    pub response_format: &'a str,
}

#[derive(Serialize)]
pub struct ImageGenerationRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub n: u32,
    pub size: String,
    pub image: String,
}

#[derive(Deserialize)]
pub struct ImageGenerationResponse {
    #[serde(default)]
    pub data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
pub struct GeneratedImage {
    pub b64_json: Option<String>,
    pub url: Option<String>,
}

pub fn encode_png_data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

async fn image_data_url(path: &str) -> Result<String, AgentError> {
    let bytes = tokio::fs::read(Path::new(path)).await?;
    Ok(encode_png_data_url(&bytes))
}

impl OpenRouterClient {
    pub fn new(settings: Settings) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self { settings, client })
    }

    fn post(&self, config: &Config, endpoint: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!(
                "{}{}",
                config.openrouter.base_url.trim_end_matches('/'),
                endpoint
            ))
            .timeout(Duration::from_secs(config.openrouter.timeout_seconds))
            .header("Authorization", format!("Bearer {}", config.openrouter.api_key))
            .header("X-Title", "comic2audiobook")
    }

    /// Chat completion against the configured vision model. Returns the
    /// model name alongside the request.
    fn chat_request(&self, system: &str, user_content: MessageContent) -> (String, reqwest::RequestBuilder) {
        let config = self.settings.current();
        let model = config.models.vision.clone();
        let body = ChatRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: MessageContent::Text(system.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_content,
                },
            ],
        };
        (model, self.post(&config, "/chat/completions").json(&body))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    /// Raw audio bytes from the speech endpoint.
    pub async fn speech(&self, request: &SpeechRequest<'_>) -> Result<Vec<u8>, AgentError> {
        let config = self.settings.current();
        let resp = self.post(&config, "/audio/speech").json(request).send().await?;
        let resp = Self::check(resp).await?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(AgentError::empty("audio/speech"));
        }
        Ok(bytes.to_vec())
    }

    pub async fn image_generation(
        &self,
        request: &ImageGenerationRequest<'_>,
    ) -> Result<Vec<u8>, AgentError> {
        let config = self.settings.current();
        let resp = self.post(&config, "/images/generations").json(request).send().await?;
        let resp = Self::check(resp).await?;
        let body: ImageGenerationResponse = resp.json().await?;
        let first = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::empty("images/generations"))?;

        if let Some(b64) = first.b64_json {
            return base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| AgentError::schema("images/generations", e.to_string()));
        }
        if let Some(url) = first.url {
            let resp = Self::check(self.client.get(url).send().await?).await?;
            return Ok(resp.bytes().await?.to_vec());
        }
        Err(AgentError::empty("images/generations"))
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat(&self, system: &str, user: &str, images: &[String]) -> Result<String, AgentError> {
        let user_content = if images.is_empty() {
            MessageContent::Text(user.to_string())
        } else {
            let mut parts = Vec::with_capacity(images.len() + 1);
            for path in images {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_data_url(path).await?,
                    },
                });
            }
            parts.push(ContentPart::Text {
                text: user.to_string(),
            });
            MessageContent::Parts(parts)
        };

        let (model, request) = self.chat_request(system, user_content);
        let resp = request.send().await?;
        let resp = Self::check(resp).await?;

        let response_text = resp.text().await?;
        let result: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| AgentError::schema("chat/completions", e.to_string()))?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AgentError::empty(format!("chat/completions model={}", model)))
    }
}
