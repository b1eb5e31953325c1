//! ONNX Runtime backend implementation
//!
//! Runs exported detection and segmentation models through ONNX Runtime with
//! support for multiple execution providers (CPU, CUDA, `CoreML`). Feeds are
//! passed by name, so models with auxiliary inputs (`im_shape`,
//! `scale_factor`) work the same way as single-input models.

use crate::config::{ExecutionProvider, RuntimeConfig};
use crate::error::{NennError, Result};
use crate::inference::InferenceBackend;
use crate::tensor::{Feeds, InferenceOutputs, TensorData};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{DynValue, Tensor};
use std::path::{Path, PathBuf};

/// ONNX Runtime backend for running exported vision models
#[derive(Debug)]
pub struct OnnxBackend {
    model_path: PathBuf,
    session: Option<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    initialized: bool,
}

impl OnnxBackend {
    /// List all ONNX Runtime execution providers with availability status and descriptions
    ///
    /// ```rust,no_run
    /// use nenn::backends::OnnxBackend;
    ///
    /// for (name, available, description) in OnnxBackend::list_providers() {
    ///     println!("{}: {} - {}", name, if available { "yes" } else { "no" }, description);
    /// }
    /// ```
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!("🔍 System Hardware Analysis:");
        log::debug!("  - Platform: {os}", os = std::env::consts::OS);
        log::debug!("  - Architecture: {arch}", arch = std::env::consts::ARCH);

        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available =
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false);

        if !coreml_available {
            #[cfg(target_os = "macos")]
            log::warn!("❌ CoreML execution provider is not available on this Mac");
            #[cfg(not(target_os = "macos"))]
            log::debug!("  - Expected: CoreML is only available on macOS");
        }

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available,
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                coreml_available,
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Create a backend for the model at `model_path`; the file is read on `initialize`
    #[must_use]
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            session: None,
            input_names: Vec::new(),
            output_names: Vec::new(),
            initialized: false,
        }
    }

    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn providers_for(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let mut providers = Vec::new();
        let cuda = CUDAExecutionProvider::default();
        let coreml = CoreMLExecutionProvider::default();

        match provider {
            ExecutionProvider::Auto => {
                if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                    log::info!("🚀 CUDA execution provider is available and will be used");
                    providers.push(cuda.build());
                } else {
                    log::debug!("CUDA execution provider is not available");
                }
                if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                    log::info!("🍎 CoreML execution provider is available and will be used");
                    providers.push(coreml.with_subgraphs(true).build());
                } else {
                    log::debug!("CoreML execution provider is not available");
                }
                if providers.is_empty() {
                    log::warn!("⚠️ No hardware acceleration available, falling back to CPU");
                }
            },
            ExecutionProvider::Cpu => {
                log::info!("Using CPU execution provider");
            },
            ExecutionProvider::Cuda => {
                if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                    log::info!("Using CUDA execution provider");
                    providers.push(cuda.build());
                } else {
                    log::warn!(
                        "CUDA execution provider requested but not available, falling back to CPU"
                    );
                }
            },
            ExecutionProvider::CoreMl => {
                if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                    log::info!("🍎 Using CoreML execution provider (explicitly requested)");
                    providers.push(coreml.with_subgraphs(true).build());
                } else {
                    log::error!("🚫 CoreML execution provider requested but not available!");
                    log::error!("  - Falling back to CPU");
                }
            },
        }

        providers
    }

    /// Load and initialize the ONNX model
    fn load_model(&mut self, config: &RuntimeConfig) -> Result<std::time::Duration> {
        let model_load_start = std::time::Instant::now();

        if !self.model_path.is_file() {
            return Err(NennError::model_error_with_context(
                "load",
                &self.model_path,
                "file not found",
                &["check the --model-dir path", "export the model to ONNX first"],
            ));
        }

        let mut session_builder = Session::builder()
            .map_err(|e| NennError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| NennError::inference(format!("Failed to set optimization level: {e}")))?;

        let providers = Self::providers_for(config.execution_provider);
        if !providers.is_empty() {
            log::info!(
                "✅ Hardware acceleration enabled with {count} provider(s)",
                count = providers.len()
            );
            session_builder = session_builder
                .with_execution_providers(providers)
                .map_err(|e| {
                    NennError::inference(format!("Failed to set execution providers: {e}"))
                })?;
        }

        let intra_threads = config.resolved_intra_threads();
        let inter_threads = config.resolved_inter_threads();

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| NennError::inference(format!("Failed to set intra threads: {e}")))?
            .with_inter_threads(inter_threads)
            .map_err(|e| NennError::inference(format!("Failed to set inter threads: {e}")))?
            .commit_from_file(&self.model_path)
            .map_err(|e| {
                NennError::model_error_with_context(
                    "create session for",
                    &self.model_path,
                    &e.to_string(),
                    &["verify the file is a valid ONNX model"],
                )
            })?;

        self.input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        self.output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        log::debug!("✅ ONNX Runtime session created successfully");
        log::debug!("  - Requested provider: {:?}", config.execution_provider);
        log::debug!(
            "  - Threading: {intra_threads} intra-op threads, {inter_threads} inter-op threads"
        );
        log::debug!("  - Inputs: {:?}", self.input_names);
        log::debug!("  - Outputs: {:?}", self.output_names);

        self.session = Some(session);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "📊 Model loading complete: {:.0}ms",
            model_load_time.as_secs_f64() * 1000.0
        );

        Ok(model_load_time)
    }
}

fn to_ort_value(name: &str, tensor: TensorData) -> Result<DynValue> {
    let value = match tensor {
        TensorData::F32(a) => Tensor::from_array(a).map(Tensor::into_dyn),
        TensorData::I64(a) => Tensor::from_array(a).map(Tensor::into_dyn),
        TensorData::I32(a) => Tensor::from_array(a).map(Tensor::into_dyn),
    };
    value.map_err(|e| NennError::inference(format!("Failed to convert input '{name}': {e}")))
}

fn from_ort_value(name: &str, value: &DynValue) -> Result<TensorData> {
    if let Ok(array) = value.try_extract_array::<f32>() {
        return Ok(TensorData::F32(array.to_owned()));
    }
    if let Ok(array) = value.try_extract_array::<i64>() {
        return Ok(TensorData::I64(array.to_owned()));
    }
    if let Ok(array) = value.try_extract_array::<i32>() {
        return Ok(TensorData::I32(array.to_owned()));
    }
    Err(NennError::inference(format!(
        "Output '{name}' has an unsupported element type"
    )))
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &RuntimeConfig) -> Result<Option<instant::Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&mut self, feeds: Feeds) -> Result<InferenceOutputs> {
        use std::time::Instant;

        if !self.initialized {
            return Err(NennError::internal("Backend not initialized"));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| NennError::internal("ONNX session not initialized"))?;

        let inference_start = Instant::now();

        let mut inputs: Vec<(String, DynValue)> = Vec::with_capacity(feeds.len());
        for (name, tensor) in feeds {
            log::debug!("  📋 Feed '{}' {:?} ({})", name, tensor.shape(), tensor.dtype());
            let value = to_ort_value(&name, tensor)?;
            inputs.push((name, value));
        }

        let core_inference_start = Instant::now();
        let outputs = session
            .run(inputs)
            .map_err(|e| NennError::inference(format!("ONNX inference failed: {e}")))?;
        let core_inference_time = core_inference_start.elapsed();
        log::debug!(
            "  ⚡ Core inference: {:.2}ms",
            core_inference_time.as_secs_f64() * 1000.0
        );

        let mut entries = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| NennError::inference(format!("Output '{name}' not found")))?;
            entries.push((name.clone(), from_ort_value(name, value)?));
        }

        log::info!(
            "📊 Inference complete: {:.2}ms total",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(InferenceOutputs::new(entries))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
