use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub models: ModelConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub story_track: StoryTrackConfig,

    #[serde(default)]
    pub panel: PanelConfig,

    /// When set, ambience is generated by POSTing to this endpoint.
    #[serde(default)]
    pub sfx_api_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_vision_model")]
    pub vision: String,
    #[serde(default = "default_tts_model")]
    pub tts: String,
    #[serde(default = "default_image_gen_primary")]
    pub image_gen_primary: String,
    #[serde(default = "default_image_gen_fallback")]
    pub image_gen_fallback: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RenderConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoryTrackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pages_per_agent")]
    pub pages_per_agent: usize,
    #[serde(default = "default_overlap_pages")]
    pub overlap_pages: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PanelConfig {
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    #[serde(default = "default_target_height")]
    pub target_height: u32,
}

fn default_storage_root() -> String {
    "storage".to_string()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_timeout() -> u64 {
    120
}
fn default_vision_model() -> String {
    "google/gemini-2.5-flash-lite".to_string()
}
fn default_tts_model() -> String {
    "openai/gpt-audio-mini".to_string()
}
fn default_image_gen_primary() -> String {
    "google/gemini-2.5-flash-image".to_string()
}
fn default_image_gen_fallback() -> String {
    "bytedance-seed/seedream-4.5".to_string()
}
fn default_dpi() -> u32 {
    150
}
fn default_batch_size() -> u32 {
    3
}
fn default_max_workers() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_pages_per_agent() -> usize {
    10
}
fn default_overlap_pages() -> usize {
    2
}
fn default_target_width() -> u32 {
    1280
}
fn default_target_height() -> u32 {
    720
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vision: default_vision_model(),
            tts: default_tts_model(),
            image_gen_primary: default_image_gen_primary(),
            image_gen_fallback: default_image_gen_fallback(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for StoryTrackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pages_per_agent: default_pages_per_agent(),
            overlap_pages: default_overlap_pages(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            target_width: default_target_width(),
            target_height: default_target_height(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            openrouter: OpenRouterConfig::default(),
            models: ModelConfig::default(),
            render: RenderConfig::default(),
            story_track: StoryTrackConfig::default(),
            panel: PanelConfig::default(),
            sfx_api_url: None,
        }
    }
}

impl Config {
    /// Reads `path` if it exists, otherwise starts from defaults. Environment
    /// variables override file values either way.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml_ng::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            log::debug!("{} not found, using defaults", path.display());
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("OPENROUTER_API_KEY") {
            self.openrouter.api_key = key;
        }
        if let Some(url) = var("OPENROUTER_BASE_URL") {
            self.openrouter.base_url = url;
        }
        if let Some(root) = var("STORAGE_ROOT") {
            self.storage_root = root;
        }
        if let Some(url) = var("SFX_API_URL") {
            self.sfx_api_url = if url.trim().is_empty() { None } else { Some(url) };
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_root)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.storage_root)?;
        Ok(())
    }
}

/// A single config shared by every component. `reload` swaps the whole
/// struct; clones of the handle observe the new value on their next read.
#[derive(Clone, Debug)]
pub struct Settings {
    inner: Arc<RwLock<Arc<Config>>>,
    path: Option<PathBuf>,
}

impl Settings {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: None,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
            path: Some(path),
        })
    }

    pub fn current(&self) -> Arc<Config> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the shared config. Returns the previous value.
    pub fn replace(&self, config: Config) -> Arc<Config> {
        let next = Arc::new(config);
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Re-reads the backing file (plus environment) and swaps it in.
    pub fn reload(&self) -> Result<ConfigDiff> {
        let fresh = match &self.path {
            Some(path) => Config::load_from(path)?,
            None => {
                let mut config = Config::default();
                config.apply_env(|key| std::env::var(key).ok());
                config
            }
        };
        let previous = self.replace(fresh);
        Ok(ConfigDiff::between(&previous, &self.current()))
    }
}

/// Top-level config keys that changed across a reload.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConfigDiff {
    pub changed: Vec<String>,
    /// Changed keys that running components captured at startup. They only
    /// apply after a restart.
    pub restart_required: Vec<String>,
}

impl ConfigDiff {
    pub fn between(before: &Config, after: &Config) -> Self {
        let mut changed = Vec::new();
        let mut restart_required = Vec::new();
        if before.storage_root != after.storage_root {
            changed.push("storage_root".to_string());
            restart_required.push("storage_root".to_string());
        }
        if before.openrouter != after.openrouter {
            changed.push("openrouter".to_string());
        }
        if before.models != after.models {
            changed.push("models".to_string());
        }
        if before.render != after.render {
            changed.push("render".to_string());
        }
        if before.story_track != after.story_track {
            changed.push("story_track".to_string());
        }
        if before.panel != after.panel {
            changed.push("panel".to_string());
        }
        if before.sfx_api_url != after.sfx_api_url {
            changed.push("sfx_api_url".to_string());
        }
        Self {
            changed,
            restart_required,
        }
    }
}
