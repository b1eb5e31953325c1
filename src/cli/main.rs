//! Vision model runner CLI
//!
//! Runs an exported detection, segmentation or realtime-segmentation model
//! over image files and writes the rendered results.

use super::config::CliConfigBuilder;
use crate::{
    processor::{Task, VisionOutput, VisionProcessor, VisionResult},
    services::{output_path_for, ImageIo},
    tracing_config::{init_cli_tracing, spans},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, Instrument};

/// Run exported vision models on images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "nenn")]
pub struct Cli {
    /// Input image files or directories
    #[arg(value_name = "INPUT", required_unless_present = "show_providers")]
    pub inputs: Vec<PathBuf>,

    /// Descend into sub-directories of directory inputs
    #[arg(short, long)]
    pub recursive: bool,

    /// Task the model was exported for (det, seg, rseg)
    #[arg(long, default_value = "det")]
    pub task: Task,

    /// Directory holding model.onnx and its deploy config
    #[arg(short, long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Output directory [default: next to each input]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Detection score threshold [default: deploy config or 0.5]
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Execution provider in format backend:provider (e.g. onnx:auto, onnx:cuda, tract:cpu)
    #[arg(short, long, default_value = "onnx:auto")]
    pub execution_provider: String,

    /// Number of threads (0 = auto-detect)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Background for rseg: a #rrggbb colour or an image path [default: white]
    #[arg(long, value_name = "COLOR|PATH")]
    pub background: Option<String>,

    /// Frame output for rseg
    #[arg(long, value_enum, default_value_t = CliRsegOutput::Rgb)]
    pub rseg_output: CliRsegOutput,

    /// Temporal smoothing of the rseg alpha matte, in [0, 1)
    #[arg(long, default_value_t = 0.0)]
    pub smoothing: f32,

    /// Maximum number of frames queued for post-processing
    #[arg(long, default_value_t = crate::worker::DEFAULT_MAX_QUEUE_SIZE)]
    pub queue_size: usize,

    /// Print per-image results as JSON lines on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Show backend and execution provider diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliRsegOutput {
    /// Foreground blended over the background
    Rgb,
    /// Foreground with the matte as alpha channel
    Rgba,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let session_id = uuid::Uuid::new_v4().to_string();
    let _tracing_guard =
        init_cli_tracing(cli.verbose, &session_id).context("Failed to initialize tracing")?;

    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    let config = CliConfigBuilder::from_cli(&cli).context("Failed to build configuration")?;
    info!("Task: {}, model: {}", config.task, config.model.model.display());
    info!(
        "Backend: {}, Provider: {}",
        config.backend_type, config.execution_provider
    );

    let session = spans::session(
        &session_id,
        &config.task.to_string(),
        &config.backend_type.to_string(),
    );

    let mut processor = VisionProcessor::new(config).context("Failed to create processor")?;
    processor
        .initialize()
        .instrument(session.clone())
        .await
        .context("Failed to initialize processor")?;

    let start_time = Instant::now();
    let outcome = process_inputs(&cli, &mut processor)
        .instrument(session)
        .await;
    processor
        .shutdown()
        .await
        .context("Post-processing worker did not shut down cleanly")?;

    let (processed, failed) = outcome?;
    info!(
        "Processed {} image(s) in {:.2}s",
        processed,
        start_time.elapsed().as_secs_f64()
    );

    if processed == 0 && failed > 0 {
        anyhow::bail!("All {failed} input(s) failed to process");
    }
    Ok(())
}

/// Print which backends and providers this build can use
fn show_provider_diagnostics() {
    println!("🔍 Backend and Execution Provider Diagnostics");

    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1);
    println!("💻 System: {cpu_count} CPU cores detected");

    #[cfg(feature = "onnx")]
    print_providers("onnx", crate::backends::OnnxBackend::list_providers());
    #[cfg(feature = "tract")]
    print_providers("tract", crate::backends::TractBackend::list_providers());

    println!("\n💡 Usage: nenn --execution-provider onnx:cuda --model-dir DIR image.jpg");
}

#[cfg(any(feature = "onnx", feature = "tract"))]
fn print_providers(backend: &str, providers: Vec<(String, bool, String)>) {
    println!("\n🚀 {backend}:");
    for (name, available, description) in providers {
        let status = if available {
            "✅ Available"
        } else {
            "❌ Not Available"
        };
        println!("  • {}: {status} - {description}", name.to_lowercase());
    }
}

/// Returns `(processed, failed)` counts
async fn process_inputs(cli: &Cli, processor: &mut VisionProcessor) -> Result<(usize, usize)> {
    let files = collect_inputs(&cli.inputs, cli.recursive)?;
    if files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok((0, 0));
    }
    info!("Found {} image file(s) to process", files.len());

    if let Some(dir) = &cli.output {
        if dir.is_file() {
            anyhow::bail!(
                "Output path exists and is a file, not a directory: {}",
                dir.display()
            );
        }
    }

    let progress = if files.len() > 1 {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let batch = spans::batch_processing(files.len());
    let needs_alpha =
        processor.config().task == Task::RSeg && cli.rseg_output == CliRsegOutput::Rgba;
    let suffix = processor.config().task.to_string();

    let mut processed = 0;
    let mut failed = 0;
    for input in &files {
        if let Some(pb) = &progress {
            pb.set_message(format!("{}", input.display()));
        }

        let output_path = output_path_for(input, cli.output.as_deref(), &suffix, needs_alpha);
        let outcome = process_file(processor, input, &output_path, cli.json)
            .instrument(spans::file_processing(input))
            .instrument(batch.clone())
            .await;

        match outcome {
            Ok(()) => {
                processed += 1;
                debug!(output = %output_path.display(), "✅ Processed {}", input.display());
            },
            Err(e) => {
                failed += 1;
                error!("❌ Failed to process {}: {:#}", input.display(), e);
            },
        }

        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress {
        pb.finish_with_message(format!("Completed! Processed: {processed}, Failed: {failed}"));
    }
    if failed > 0 {
        warn!("Some files failed to process. Processed: {processed}, Failed: {failed}");
    }

    Ok((processed, failed))
}

async fn process_file(
    processor: &mut VisionProcessor,
    input: &Path,
    output_path: &Path,
    json: bool,
) -> Result<()> {
    let output = processor
        .process_file(input)
        .await
        .with_context(|| format!("Failed to process {}", input.display()))?;

    ImageIo::save(&output.rendered, output_path)
        .with_context(|| format!("Failed to save {}", output_path.display()))?;

    if json {
        println!("{}", result_record(input, output_path, &output)?);
    }
    Ok(())
}

/// One JSON line describing the result for `input`
fn result_record(input: &Path, output_path: &Path, output: &VisionOutput) -> Result<String> {
    let result = match &output.result {
        VisionResult::Detections(detections) => serde_json::json!({ "detections": detections }),
        VisionResult::Segmentation(segmentation) => serde_json::json!({
            "num_classes": segmentation.num_classes,
            "class_pixel_counts": segmentation.class_pixel_counts(),
        }),
        VisionResult::Composite => serde_json::json!({}),
    };
    let record = serde_json::json!({
        "input": input.display().to_string(),
        "output": output_path.display().to_string(),
        "elapsed_ms": output.elapsed.as_secs_f64() * 1000.0,
        "result": result,
    });
    Ok(serde_json::to_string(&record)?)
}

/// Expand files and directories into a sorted list of image files
fn collect_inputs(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if input.is_file() {
            if ImageIo::is_supported_format(input) {
                files.push(input.clone());
            } else {
                warn!("Skipping unsupported file: {}", input.display());
            }
        } else if input.is_dir() {
            let walker = walkdir::WalkDir::new(input).min_depth(1);
            let walker = if recursive {
                walker
            } else {
                walker.max_depth(1)
            };
            for entry in walker {
                let entry = entry?;
                if entry.file_type().is_file() && ImageIo::is_supported_format(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            anyhow::bail!(
                "Input path does not exist or is not accessible: {}",
                input.display()
            );
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}
