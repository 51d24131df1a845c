use super::PanelNormalizer;
use crate::core::cache::CacheStore;
use crate::core::config::Settings;
use crate::core::state::Panel;
use crate::services::error::AgentError;
use crate::services::llm::{encode_png_data_url, ImageGenerationRequest, OpenRouterClient};
use crate::utils::raster;
use async_trait::async_trait;
use image::DynamicImage;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

/// Recorded when the panel already covers the whole canvas.
pub const FILL_NONE: &str = "none";
/// Recorded when every outpainting model failed and the black bars remain.
pub const FILL_LETTERBOX: &str = "letterbox";

const FILL_PROMPT: &str = "Comic book panel background continuation. \
Match the art style, colour palette, and shading of the source image. \
Fill the blank area seamlessly. No new characters or text.";

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generates a replacement for `reference_png` at the given size.
    async fn outpaint(
        &self,
        model: &str,
        prompt: &str,
        reference_png: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, AgentError>;
}

#[async_trait]
impl ImageGenerator for OpenRouterClient {
    async fn outpaint(
        &self,
        model: &str,
        prompt: &str,
        reference_png: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, AgentError> {
        self.image_generation(&ImageGenerationRequest {
            model,
            prompt,
            n: 1,
            size: format!("{}x{}", width, height),
            image: encode_png_data_url(reference_png),
        })
        .await
    }
}

pub struct ImageNormalizer {
    generator: Arc<dyn ImageGenerator>,
    settings: Settings,
    store: Arc<CacheStore>,
}

impl ImageNormalizer {
    pub fn new(generator: Arc<dyn ImageGenerator>, settings: Settings, store: Arc<CacheStore>) -> Self {
        Self {
            generator,
            settings,
            store,
        }
    }

    /// Tries each model in turn. `None` when all of them failed.
    async fn fill(&self, canvas_png: &[u8], models: [&str; 2], width: u32, height: u32) -> Option<(Vec<u8>, String)> {
        for model in models {
            let generated = match self
                .generator
                .outpaint(model, FILL_PROMPT, canvas_png, width, height)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Outpainting with {} failed: {}", model, e);
                    continue;
                }
            };
            match raster::fit_generated(&generated, width, height) {
                Ok(png) => return Some((png, model.to_string())),
                Err(e) => warn!("Outpainting with {} returned an unreadable image: {}", model, e),
            }
        }
        None
    }
}

#[async_trait]
impl PanelNormalizer for ImageNormalizer {
    async fn normalise_panel(&self, panel: &Panel, comic_id: &str) -> Result<(String, String), AgentError> {
        let config = self.settings.current();
        let (width, height) = (config.panel.target_width, config.panel.target_height);

        let source = self
            .store
            .storage()
            .read(Path::new(&panel.image_path))
            .await
            .map_err(AgentError::storage)?;
        let (canvas_png, needs_fill) = tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&source)?;
            let boxed = raster::letterbox(&img, width, height);
            let rgb = DynamicImage::ImageRgba8(boxed.canvas).to_rgb8();
            raster::encode_png(&DynamicImage::ImageRgb8(rgb)).map(|png| (png, boxed.needs_fill))
        })
        .await
        .map_err(|e| AgentError::Transport(format!("normalise task failed: {}", e)))??;

        let (png, fill_model) = if needs_fill {
            let models = [
                config.models.image_gen_primary.as_str(),
                config.models.image_gen_fallback.as_str(),
            ];
            match self.fill(&canvas_png, models, width, height).await {
                Some(filled) => filled,
                None => (canvas_png, FILL_LETTERBOX.to_string()),
            }
        } else {
            (canvas_png, FILL_NONE.to_string())
        };

        let out = self
            .store
            .normalised_dir(comic_id)
            .join(format!("{}.png", panel.panel_id));
        self.store
            .storage()
            .write(&out, &png)
            .await
            .map_err(AgentError::storage)?;
        debug!("{} normalised ({})", panel.panel_id, fill_model);
        Ok((out.to_string_lossy().to_string(), fill_model))
    }
}
