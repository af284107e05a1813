//! OCR Visualizer - run text detection and recognition on an image
//!
//! Prints the recognized words with the run metadata, and can save the
//! detection heatmap next to them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ocr_visualizer::config::{self, AppConfig};
use ocr_visualizer::storage;
use ocr_visualizer::vision::{DetectionVariant, ExecutionStrategy, OcrBackend, RecognitionVariant};
use ocr_visualizer::{OcrApp, UploadedFile};

/// OCR Visualizer - word detection, recognition and confidence heatmaps
#[derive(Parser, Debug)]
#[command(name = "ocr-visualizer")]
#[command(about = "Detect and recognize words in an image")]
struct Args {
    /// Image to process
    #[arg(required_unless_present = "list_models")]
    image: Option<PathBuf>,

    /// Detection model (db_mobilenet_v2, db_resnet50)
    #[arg(long)]
    det: Option<String>,

    /// Recognition model (crnn_vgg16_bn, crnn_mobilenet_v2)
    #[arg(long)]
    reco: Option<String>,

    /// Where inference runs (direct, offloaded)
    #[arg(long)]
    strategy: Option<String>,

    /// Inference timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Configuration file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model cache directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Write the detection heatmap as a grayscale PNG
    #[arg(long)]
    heatmap_out: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// List available models and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_models {
        print_models();
        return Ok(());
    }

    apply_overrides(&mut config, &args)?;
    let Some(image_path) = args.image.as_deref() else {
        anyhow::bail!("No image given");
    };

    let app = OcrApp::from_config(config)?;
    let file = UploadedFile::from_path(image_path)?;
    let report = app.process(file).await;

    if let Some(path) = &args.heatmap_out {
        write_heatmap(&app, path)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.to_text());
    }

    for status in app.model_status() {
        info!("{} slot: {:?}", status.slot, status.state);
    }
    app.shutdown();

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Load configuration from the given file, the default location, or defaults
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let path = storage::default_config_path()?;
            config::load_or_default(&path)
        }
    }
}

/// Command line flags win over the config file
fn apply_overrides(config: &mut AppConfig, args: &Args) -> Result<()> {
    if let Some(name) = &args.det {
        config.models.detection = DetectionVariant::from_name(name)
            .with_context(|| format!("Unknown detection model '{}'", name))?;
    }
    if let Some(name) = &args.reco {
        config.models.recognition = RecognitionVariant::from_name(name)
            .with_context(|| format!("Unknown recognition model '{}'", name))?;
    }
    if let Some(strategy) = &args.strategy {
        config.pipeline.strategy = match strategy.as_str() {
            "direct" => ExecutionStrategy::Direct,
            "offloaded" => ExecutionStrategy::Offloaded,
            other => anyhow::bail!("Unknown strategy '{}' (expected direct or offloaded)", other),
        };
    }
    if let Some(timeout) = args.timeout {
        config.pipeline.timeout_secs = timeout;
    }
    if let Some(dir) = &args.models_dir {
        config.models.models_dir = Some(dir.clone());
    }
    Ok(())
}

fn print_models() {
    println!("Detection models:");
    for variant in DetectionVariant::ALL {
        println!("  {:<20} {}", variant.name(), variant.label());
    }
    println!("Recognition models:");
    for variant in RecognitionVariant::ALL {
        println!("  {:<20} {}", variant.name(), variant.label());
    }
}

fn write_heatmap<B: OcrBackend>(app: &OcrApp<B>, path: &Path) -> Result<()> {
    let state = app.controller().snapshot();
    let Some(heatmap) = state.heatmap else {
        warn!("No heatmap to write");
        return Ok(());
    };
    heatmap
        .to_luma()
        .save(path)
        .with_context(|| format!("Failed to write heatmap to {:?}", path))?;
    info!("Heatmap ({}x{}) written to {:?}", heatmap.width(), heatmap.height(), path);
    Ok(())
}
