#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Nenn
//!
//! Config-driven inference for exported object detection and semantic
//! segmentation models, with ONNX Runtime and Tract backends.
//!
//! A model directory holds `model.onnx` plus the deploy config written by the
//! exporter (`infer_cfg.json` or `deploy.json`). The config's `Preprocess`
//! list drives resizing and normalization, so the same code runs any model
//! exported this way.
//!
//! ## Features
//!
//! - **Three tasks**: detection (`det`), semantic segmentation (`seg`) and
//!   realtime portrait segmentation (`rseg`) with background compositing
//! - **Multiple Backends**: ONNX Runtime (GPU acceleration) and Tract (Pure Rust)
//! - **Hardware Acceleration**: CUDA, `CoreML`, and CPU execution providers
//! - **Post-processing worker**: `rseg` frames are composited on a dedicated
//!   thread with bounded queueing
//! - **CLI Integration**: Optional command-line interface (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nenn::{ModelFiles, ProcessorConfig, Task, VisionProcessor, VisionResult};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ProcessorConfig::builder()
//!     .task(Task::Det)
//!     .model(ModelFiles::from_dir("models/picodet")?)
//!     .threshold(Some(0.4))
//!     .build()?;
//!
//! let mut processor = VisionProcessor::new(config)?;
//! let output = processor.process_file("street.jpg").await?;
//! if let VisionResult::Detections(detections) = &output.result {
//!     for detection in detections {
//!         println!("{:?} {:.2} {:?}", detection.label, detection.score, detection.bbox);
//!     }
//! }
//! output.rendered.save("street_det.jpg")?;
//! processor.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with GPU acceleration support
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): Command-line interface, progress bars and tracing setup
//! - `webp-support` (default): WebP image format support
//! - `tracing-json`, `tracing-files`: extra log outputs for the CLI
//!
//! ### Library-Only Usage
//!
//! ```toml
//! [dependencies]
//! nenn = { version = "0.1", default-features = false, features = ["onnx"] }
//! ```

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod inference;
pub mod models;
pub mod preprocess;
pub mod processor;
pub mod services;
pub mod tensor;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod visualize;
pub mod worker;

use tokio::io::AsyncRead;

// Public API exports
pub use backends::*;
pub use config::{ExecutionProvider, RuntimeConfig, RuntimeConfigBuilder};
pub use deploy::{DeployConfig, PreprocessOp};
pub use error::{NennError, Result};
pub use inference::{BackendFactory, BackendType, DefaultBackendFactory, InferenceBackend};
pub use models::{
    AlphaMatte, BoundingBox, Detection, Detector, Model, ModelFiles, RealtimeSegmenter,
    SegmentationResult, Segmenter,
};
pub use preprocess::{PreparedInput, Preprocessor, TensorLayout};
pub use processor::{
    ProcessorConfig, ProcessorConfigBuilder, Task, VisionOutput, VisionProcessor, VisionResult,
};
pub use services::ImageIo;
pub use tensor::{Feeds, InferenceOutputs, TensorData};
pub use worker::{
    Background, Compositor, InitOptions, OutputFormat, PostProcessWorkerManager, PostProcessor,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat, TracingOutput};

/// Run a model once on an encoded image
///
/// Builds a processor for `config`, processes the image and shuts the
/// processor down again. Keep a [`VisionProcessor`] around instead when
/// handling more than one image.
///
/// ```rust,no_run
/// use nenn::{run_on_bytes, ModelFiles, ProcessorConfig, Task};
///
/// # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
/// let config = ProcessorConfig::builder()
///     .task(Task::Seg)
///     .model(ModelFiles::from_dir("models/pp_liteseg")?)
///     .build()?;
/// let output = run_on_bytes(&upload, config).await?;
/// output.rendered.save("overlay.png")?;
/// # Ok(())
/// # }
/// ```
pub async fn run_on_bytes(image_bytes: &[u8], config: ProcessorConfig) -> Result<VisionOutput> {
    let image = ImageIo::load_from_bytes(image_bytes)?;

    let mut processor = VisionProcessor::new(config)?;
    let output = processor.process_image(&image).await;
    processor.shutdown().await?;
    output
}

/// Run a model once on an image read from an async stream
pub async fn run_on_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    config: ProcessorConfig,
) -> Result<VisionOutput> {
    let mut buffer = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer).await?;

    run_on_bytes(&buffer, config).await
}
