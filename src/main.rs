use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comic2audiobook::core::cache::CacheStore;
use comic2audiobook::core::config::{Config, Settings, DEFAULT_CONFIG_PATH};
use comic2audiobook::core::io::NativeStorage;
use comic2audiobook::core::state::ProcessingStage;
use comic2audiobook::services::agents::{
    Agents, ImageNormalizer, LlmStoryAgent, LlmVisionAgent, OpenRouterAudioAgent,
};
use comic2audiobook::services::llm::{LlmClient, OpenRouterClient};
use comic2audiobook::services::renderer::PopplerRasterizer;
use comic2audiobook::services::runs::{RunService, SubmitOptions};
use comic2audiobook::services::workflow::WorkflowManager;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Turns a comic PDF into a panel-by-panel audiobook manifest.
#[derive(Parser)]
#[command(name = "comic2audiobook", version, about)]
struct Cli {
    /// Config file. Missing files fall back to defaults plus environment.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a PDF and wait for the run to finish.
    Process {
        pdf: PathBuf,

        /// Defaults to the file name.
        #[arg(short, long)]
        title: Option<String>,

        /// Letterbox and outpaint every panel to the target size.
        #[arg(long)]
        normalize: bool,

        /// Ignore a finished run of the same document.
        #[arg(short, long)]
        force: bool,

        /// First page to process (1-based).
        #[arg(long)]
        page_start: Option<u32>,

        /// Last page to process (inclusive).
        #[arg(long)]
        page_end: Option<u32>,
    },
    /// Run a stored document again under a new identity.
    Reprocess {
        comic_id: String,

        #[arg(long)]
        normalize: Option<bool>,
    },
    /// Print a run's status.
    Status { comic_id: String },
    /// Print a finished run's manifest as JSON.
    Manifest { comic_id: String },
    /// Print a run's story bible as JSON.
    Bible { comic_id: String },
    /// Write a config file with default values.
    Init,
}

fn build_service(settings: Settings) -> Result<RunService> {
    let config = settings.current();
    config.ensure_directories()?;
    if config.openrouter.api_key.is_empty() {
        log::warn!("No OpenRouter API key configured; agent calls will be rejected");
    }

    let store = Arc::new(CacheStore::new(
        config.storage_root(),
        Arc::new(NativeStorage::new()),
    ));
    let client = Arc::new(OpenRouterClient::new(settings.clone())?);
    let llm: Arc<dyn LlmClient> = client.clone();
    let agents = Agents {
        vision: Arc::new(LlmVisionAgent::new(llm.clone(), store.clone())),
        story: Arc::new(LlmStoryAgent::new(llm, store.clone())),
        audio: Arc::new(OpenRouterAudioAgent::new(settings.clone(), store.clone())?),
        normalizer: Arc::new(ImageNormalizer::new(client, settings.clone(), store.clone())),
    };
    let workflow = WorkflowManager::new(
        settings.clone(),
        store,
        Arc::new(PopplerRasterizer),
        agents,
    );
    Ok(RunService::new(settings, Arc::new(workflow)))
}

/// Polls the run record until its task ends.
async fn follow(service: &RunService, comic_id: &str) -> Result<()> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    loop {
        let status = service.status(comic_id).await?;
        pb.set_position(status.progress_pct as u64);
        pb.set_message(status.stage.to_string());
        if status.stage.is_terminal() || !service.is_running(comic_id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    service.wait(comic_id).await;

    let status = service.status(comic_id).await?;
    match status.stage {
        ProcessingStage::Done => {
            pb.finish_with_message("done");
            println!("Finished {}", comic_id);
            let playback = service.playback(comic_id).await?;
            println!("Playback token: {}", playback.token);
            Ok(())
        }
        stage => {
            pb.abandon_with_message(stage.to_string());
            bail!(
                "Run {} ended at {} ({}%): {}",
                comic_id,
                stage,
                status.progress_pct,
                status.error.unwrap_or_default()
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let command = match cli.command {
        Command::Init => {
            if cli.config.exists() {
                bail!("{} already exists", cli.config.display());
            }
            Config::default().save_to(&cli.config)?;
            println!("Wrote {}", cli.config.display());
            return Ok(());
        }
        command => command,
    };

    let settings = Settings::from_file(cli.config.clone())?;
    let service = build_service(settings)?;

    match command {
        Command::Process {
            pdf,
            title,
            normalize,
            force,
            page_start,
            page_end,
        } => {
            let bytes = tokio::fs::read(&pdf)
                .await
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let title = title.unwrap_or_else(|| {
                pdf.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
            let outcome = service
                .submit(
                    &bytes,
                    SubmitOptions {
                        title,
                        normalization: normalize,
                        force_reprocess: force,
                        page_start,
                        page_end,
                    },
                )
                .await?;
            if outcome.cached {
                println!("Already processed as {}", outcome.comic_id);
                return Ok(());
            }
            println!("Processing as {}", outcome.comic_id);
            follow(&service, &outcome.comic_id).await?;
        }
        Command::Reprocess { comic_id, normalize } => {
            let outcome = service.reprocess(&comic_id, normalize).await?;
            println!("Reprocessing as {}", outcome.comic_id);
            follow(&service, &outcome.comic_id).await?;
        }
        Command::Status { comic_id } => {
            let status = service.status(&comic_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Manifest { comic_id } => {
            let comic = service.manifest(&comic_id).await?;
            println!("{}", serde_json::to_string_pretty(&comic)?);
        }
        Command::Bible { comic_id } => {
            let bible = service.story_bible(&comic_id).await?;
            println!("{}", serde_json::to_string_pretty(&bible)?);
        }
        Command::Init => {}
    }

    Ok(())
}
