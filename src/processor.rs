//! Unified vision processor
//!
//! `VisionProcessor` ties a deploy config, an inference backend and the
//! task-specific post-processing together. It is used by the CLI and is the
//! entry point for library users who do not need the individual pieces.

use crate::{
    config::{ExecutionProvider, RuntimeConfig},
    error::{NennError, Result},
    inference::{BackendFactory, BackendType, DefaultBackendFactory},
    models::{
        det::Detection, seg::SegmentationResult, Detector, Model, ModelFiles, RealtimeSegmenter,
        Segmenter,
    },
    services::ImageIo,
    visualize,
    worker::{
        Background, Compositor, InitOptions, OutputFormat, PostProcessWorkerManager,
        DEFAULT_MAX_QUEUE_SIZE,
    },
};
use image::DynamicImage;
use instant::{Duration, Instant};
use log::{debug, info};
use std::path::Path;
use tracing::{info as trace_info, instrument};

/// Kind of model being run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Task {
    /// Object detection
    #[default]
    Det,
    /// Semantic segmentation
    Seg,
    /// Real-time portrait segmentation composited by the worker
    RSeg,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Det => write!(f, "det"),
            Self::Seg => write!(f, "seg"),
            Self::RSeg => write!(f, "rseg"),
        }
    }
}

impl std::str::FromStr for Task {
    type Err = NennError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "det" | "detection" => Ok(Self::Det),
            "seg" | "segmentation" => Ok(Self::Seg),
            "rseg" | "matting" => Ok(Self::RSeg),
            other => Err(NennError::invalid_config(format!(
                "Unknown task '{other}' (expected det, seg or rseg)"
            ))),
        }
    }
}

/// Configuration of a [`VisionProcessor`]
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub task: Task,
    pub model: ModelFiles,
    /// Backend type to use for inference
    pub backend_type: BackendType,
    /// Execution provider for the backend
    pub execution_provider: ExecutionProvider,
    /// Number of intra-op threads (0 = auto)
    pub intra_threads: usize,
    /// Number of inter-op threads (0 = auto)
    pub inter_threads: usize,
    /// Detection score threshold overriding the config's `draw_threshold`
    pub threshold: Option<f32>,
    /// Requests allowed in flight to the post-processing worker
    pub max_queue_size: usize,
    pub background: Background,
    pub rseg_output: OutputFormat,
    /// Weight of the previous frame's alpha, 0 disables smoothing
    pub smoothing: f32,
    /// Outline width of drawn boxes
    pub line_thickness: u32,
    /// Share of the class colour in segmentation overlays
    pub blend_weight: f32,
    pub debug: bool,
}

impl ProcessorConfig {
    /// Create a new processor configuration builder
    #[must_use]
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::new()
    }

    /// Runtime settings handed to the backend
    #[must_use]
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            execution_provider: self.execution_provider,
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
            debug: self.debug,
        }
    }

    fn init_options(&self) -> InitOptions {
        InitOptions {
            background: self.background.clone(),
            output: self.rseg_output,
            smoothing: self.smoothing,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            task: Task::Det,
            model: ModelFiles::new("model.onnx", "infer_cfg.json"),
            backend_type: BackendType::Onnx,
            execution_provider: ExecutionProvider::Auto,
            intra_threads: 0,
            inter_threads: 0,
            threshold: None,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            background: Background::default(),
            rseg_output: OutputFormat::Rgb,
            smoothing: 0.0,
            line_thickness: 2,
            blend_weight: 0.5,
            debug: false,
        }
    }
}

/// Builder for `ProcessorConfig`
#[derive(Debug, Default)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn task(mut self, task: Task) -> Self {
        self.config.task = task;
        self
    }

    #[must_use]
    pub fn model(mut self, model: ModelFiles) -> Self {
        self.config.model = model;
        self
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.config.backend_type = backend_type;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn inter_threads(mut self, threads: usize) -> Self {
        self.config.inter_threads = threads;
        self
    }

    #[must_use]
    pub fn threshold(mut self, threshold: Option<f32>) -> Self {
        self.config.threshold = threshold;
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn background(mut self, background: Background) -> Self {
        self.config.background = background;
        self
    }

    #[must_use]
    pub fn rseg_output(mut self, output: OutputFormat) -> Self {
        self.config.rseg_output = output;
        self
    }

    #[must_use]
    pub fn smoothing(mut self, smoothing: f32) -> Self {
        self.config.smoothing = smoothing;
        self
    }

    #[must_use]
    pub fn line_thickness(mut self, thickness: u32) -> Self {
        self.config.line_thickness = thickness;
        self
    }

    #[must_use]
    pub fn blend_weight(mut self, weight: f32) -> Self {
        self.config.blend_weight = weight;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build the processor configuration
    ///
    /// # Errors
    /// - Threshold, blend weight or smoothing outside their ranges
    /// - Zero queue size
    /// - Invalid thread counts
    pub fn build(self) -> Result<ProcessorConfig> {
        let config = self.config;

        if let Some(threshold) = config.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(NennError::config_value_error(
                    "threshold",
                    threshold,
                    "0.0-1.0",
                    Some(0.5),
                ));
            }
        }
        if config.max_queue_size == 0 {
            return Err(NennError::config_value_error(
                "queue size",
                config.max_queue_size,
                "1 or more",
                Some(DEFAULT_MAX_QUEUE_SIZE),
            ));
        }
        if !(0.0..1.0).contains(&config.smoothing) {
            return Err(NennError::config_value_error(
                "smoothing",
                config.smoothing,
                "0.0-1.0 (exclusive)",
                Some(0.0),
            ));
        }
        if !(0.0..=1.0).contains(&config.blend_weight) {
            return Err(NennError::config_value_error(
                "blend weight",
                config.blend_weight,
                "0.0-1.0",
                Some(0.5),
            ));
        }
        config.to_runtime_config().validate()?;

        Ok(config)
    }
}

/// Task-specific result of one image
#[derive(Debug, Clone)]
pub enum VisionResult {
    Detections(Vec<Detection>),
    Segmentation(SegmentationResult),
    /// The frame was composited by the post-processing worker
    Composite,
}

/// Result plus a rendered image for saving or display
#[derive(Debug, Clone)]
pub struct VisionOutput {
    pub result: VisionResult,
    pub rendered: DynamicImage,
    pub elapsed: Duration,
}

enum Engine {
    Det(Detector),
    Seg(Segmenter),
    RSeg {
        segmenter: RealtimeSegmenter,
        worker: PostProcessWorkerManager,
    },
}

/// Runs one model for one task
pub struct VisionProcessor {
    config: ProcessorConfig,
    backend_factory: Box<dyn BackendFactory>,
    engine: Option<Engine>,
}

impl std::fmt::Debug for VisionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionProcessor")
            .field("config", &self.config)
            .field("initialized", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl VisionProcessor {
    /// Create a new processor with the default backend factory
    ///
    /// # Errors
    /// - Invalid processor configuration
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        Self::with_factory(config, Box::new(DefaultBackendFactory))
    }

    /// Create a new processor with a custom backend factory
    ///
    /// # Errors
    /// - Invalid processor configuration
    pub fn with_factory(
        config: ProcessorConfig,
        backend_factory: Box<dyn BackendFactory>,
    ) -> Result<Self> {
        config.to_runtime_config().validate()?;
        Ok(Self {
            config,
            backend_factory,
            engine: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Load the model and, for `RSeg`, start the post-processing worker
    ///
    /// # Errors
    /// - Model or config loading failures
    /// - Backend initialization errors
    /// - Worker start-up failures
    pub async fn initialize(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }

        info!("Initializing {} processor", self.config.task);
        debug!("Model files: {:?}", self.config.model);
        debug!("Backend type: {}", self.config.backend_type);
        debug!("Execution provider: {}", self.config.execution_provider);

        let backend = self
            .backend_factory
            .create_backend(self.config.backend_type, &self.config.model.model)?;
        let model = Model::load(&self.config.model, backend, &self.config.to_runtime_config())?;

        let engine = match self.config.task {
            Task::Det => Engine::Det(Detector::new(model).with_threshold(self.config.threshold)),
            Task::Seg => Engine::Seg(Segmenter::new(model)),
            Task::RSeg => {
                let worker =
                    PostProcessWorkerManager::spawn(Compositor::new(), self.config.max_queue_size)?;
                worker.init(self.config.init_options()).await?;
                Engine::RSeg {
                    segmenter: RealtimeSegmenter::new(model),
                    worker,
                }
            },
        };

        self.engine = Some(engine);
        info!("{} processor initialized successfully", self.config.task);
        Ok(())
    }

    /// Load an image file and process it
    ///
    /// # Errors
    /// - Image loading failures
    /// - Processing errors (see [`VisionProcessor::process_image`])
    pub async fn process_file<P: AsRef<Path>>(&mut self, input_path: P) -> Result<VisionOutput> {
        let image = ImageIo::load(input_path)?;
        self.process_image(&image).await
    }

    /// Run the configured task on `image`
    ///
    /// # Errors
    /// - Initialization, preprocessing or inference failures
    /// - Post-processing and worker errors
    #[instrument(
        skip(self, image),
        fields(
            task = %self.config.task,
            backend = %self.config.backend_type,
            dimensions = %format!("{}x{}", image.width(), image.height())
        )
    )]
    pub async fn process_image(&mut self, image: &DynamicImage) -> Result<VisionOutput> {
        self.initialize().await?;
        let start = Instant::now();

        let line_thickness = self.config.line_thickness;
        let blend_weight = self.config.blend_weight;
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| NennError::internal("Processor not initialized"))?;

        let (result, rendered) = match engine {
            Engine::Det(detector) => {
                let detections = detector.detect(image)?;
                let mut canvas = image.to_rgb8();
                visualize::draw_detections(&mut canvas, &detections, line_thickness);
                trace_info!(count = detections.len(), "🎯 Detection complete");
                (
                    VisionResult::Detections(detections),
                    DynamicImage::ImageRgb8(canvas),
                )
            },
            Engine::Seg(segmenter) => {
                let segmentation = segmenter.segment(image)?;
                let overlay = visualize::blend_label_map(
                    &image.to_rgb8(),
                    &segmentation.label_map,
                    blend_weight,
                )?;
                trace_info!(
                    classes = segmentation.num_classes,
                    "🎨 Segmentation complete"
                );
                (
                    VisionResult::Segmentation(segmentation),
                    DynamicImage::ImageRgb8(overlay),
                )
            },
            Engine::RSeg { segmenter, worker } => {
                let composited = segmenter.process_frame(image, worker).await?;
                trace_info!(pending = worker.pending(), "🖼️ Frame composited");
                (VisionResult::Composite, composited)
            },
        };

        let elapsed = start.elapsed();
        debug!(
            "Processed {}x{} image in {:.2}ms",
            image.width(),
            image.height(),
            elapsed.as_secs_f64() * 1000.0
        );

        Ok(VisionOutput {
            result,
            rendered,
            elapsed,
        })
    }

    /// Stop the post-processing worker, if one is running
    ///
    /// # Errors
    /// - The worker thread panicked
    pub async fn shutdown(self) -> Result<()> {
        if let Some(Engine::RSeg { worker, .. }) = self.engine {
            worker.shutdown().await?;
        }
        Ok(())
    }
}
