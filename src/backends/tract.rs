//! Tract backend implementation
//!
//! Pure Rust inference for exported models. Exported detectors usually
//! declare dynamic input dimensions, so the graph is kept in its inference
//! form and optimized once per distinct set of feed shapes.

use crate::config::RuntimeConfig;
use crate::error::{NennError, Result};
use crate::inference::InferenceBackend;
use crate::tensor::{Feeds, InferenceOutputs, TensorData};
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::{Duration, Instant};

/// Tract backend for running models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model_path: PathBuf,
    graph: Option<InferenceModel>,
    /// Runnable model and the feed shapes it was optimized for
    runnable: Option<(Vec<Vec<usize>>, TractModel)>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    initialized: bool,
}

impl TractBackend {
    /// List the providers this backend can use
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!("🔍 Tract Backend System Analysis:");
        log::debug!("  - Platform: {os}", os = std::env::consts::OS);
        log::debug!("  - Pure Rust: No external dependencies required");

        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference (no external dependencies)".to_string(),
        )]
    }

    #[must_use]
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            graph: None,
            runnable: None,
            input_names: Vec::new(),
            output_names: Vec::new(),
            initialized: false,
        }
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();

        if !self.model_path.is_file() {
            return Err(NennError::model_error_with_context(
                "load",
                &self.model_path,
                "file not found",
                &["check the --model-dir path"],
            ));
        }

        log::info!("🚀 Initializing Tract Backend");
        log::info!("📦 Model: {}", self.model_path.display());

        let graph = onnx().model_for_path(&self.model_path).map_err(|e| {
            NennError::model(format!("Failed to load ONNX model: {e}"))
        })?;

        let inputs = graph
            .input_outlets()
            .map_err(|e| NennError::model(format!("Failed to read model inputs: {e}")))?;
        self.input_names = inputs
            .iter()
            .map(|outlet| graph.node(outlet.node).name.clone())
            .collect();

        let outputs = graph
            .output_outlets()
            .map_err(|e| NennError::model(format!("Failed to read model outputs: {e}")))?;
        self.output_names = outputs
            .iter()
            .map(|outlet| {
                graph
                    .outlet_label(*outlet)
                    .map_or_else(|| graph.node(outlet.node).name.clone(), String::from)
            })
            .collect();

        self.graph = Some(graph);
        self.runnable = None;
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "✅ Tract backend initialized in {:.2}ms",
            model_load_time.as_millis()
        );

        Ok(model_load_time)
    }

    /// Optimize the graph for the given feed shapes, reusing the last plan when they match
    fn runnable_for(&mut self, shapes: &[Vec<usize>], feeds: &[TensorData]) -> Result<&TractModel> {
        let reuse = matches!(&self.runnable, Some((cached, _)) if cached.as_slice() == shapes);
        if !reuse {
            let graph = self
                .graph
                .as_ref()
                .ok_or_else(|| NennError::internal("Tract model not initialized"))?;

            let mut model = graph.clone();
            for (index, tensor) in feeds.iter().enumerate() {
                let shape = tensor.shape().to_vec();
                let fact: InferenceFact = match tensor {
                    TensorData::F32(_) => f32::fact(shape).into(),
                    TensorData::I64(_) => i64::fact(shape).into(),
                    TensorData::I32(_) => i32::fact(shape).into(),
                };
                model = model.with_input_fact(index, fact).map_err(|e| {
                    NennError::model(format!("Failed to set shape of input {index}: {e}"))
                })?;
            }

            log::debug!("Optimizing Tract model for input shapes {shapes:?}");
            let runnable = model
                .into_optimized()
                .map_err(|e| NennError::model(format!("Failed to optimize model: {e}")))?
                .into_runnable()
                .map_err(|e| NennError::model(format!("Failed to create runnable model: {e}")))?;
            self.runnable = Some((shapes.to_vec(), runnable));
        }

        self.runnable
            .as_ref()
            .map(|(_, model)| model)
            .ok_or_else(|| NennError::internal("Tract runnable model missing"))
    }
}

fn to_tvalue(tensor: TensorData) -> TValue {
    match tensor {
        TensorData::F32(a) => Tensor::from(a).into(),
        TensorData::I64(a) => Tensor::from(a).into(),
        TensorData::I32(a) => Tensor::from(a).into(),
    }
}

fn from_tvalue(name: &str, value: &TValue) -> Result<TensorData> {
    let convert = |e: TractError| {
        NennError::inference(format!("Failed to convert output '{name}': {e}"))
    };
    match value.datum_type() {
        DatumType::F32 => Ok(TensorData::F32(
            value.to_array_view::<f32>().map_err(convert)?.to_owned(),
        )),
        DatumType::I64 => Ok(TensorData::I64(
            value.to_array_view::<i64>().map_err(convert)?.to_owned(),
        )),
        DatumType::I32 => Ok(TensorData::I32(
            value.to_array_view::<i32>().map_err(convert)?.to_owned(),
        )),
        other => Err(NennError::inference(format!(
            "Output '{name}' has unsupported type {other:?}"
        ))),
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, config: &RuntimeConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        if config.execution_provider != crate::config::ExecutionProvider::Auto
            && config.execution_provider != crate::config::ExecutionProvider::Cpu
        {
            log::warn!(
                "Tract only runs on CPU, ignoring execution provider '{}'",
                config.execution_provider
            );
        }

        let model_load_time = self.load_model()?;
        Ok(Some(model_load_time))
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&mut self, feeds: Feeds) -> Result<InferenceOutputs> {
        if !self.initialized {
            return Err(NennError::inference("Tract model not initialized"));
        }

        // Tract takes inputs positionally, in declaration order
        let mut ordered = Vec::with_capacity(self.input_names.len());
        let mut feeds = feeds;
        for name in &self.input_names {
            let position = feeds.iter().position(|(n, _)| n == name).ok_or_else(|| {
                NennError::inference(format!("Missing feed for model input '{name}'"))
            })?;
            ordered.push(feeds.swap_remove(position).1);
        }

        let shapes: Vec<Vec<usize>> = ordered.iter().map(|t| t.shape().to_vec()).collect();
        let inference_start = Instant::now();

        let model = self.runnable_for(&shapes, &ordered)?;
        let inputs: TVec<TValue> = ordered.into_iter().map(to_tvalue).collect();
        let outputs = model
            .run(inputs)
            .map_err(|e| NennError::inference(format!("Tract inference failed: {e}")))?;

        let mut entries = Vec::with_capacity(outputs.len());
        for (index, value) in outputs.iter().enumerate() {
            let name = self
                .output_names
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("output_{index}"));
            let data = from_tvalue(&name, value)?;
            entries.push((name, data));
        }

        log::debug!(
            "✅ Tract inference completed in {:.2}ms",
            inference_start.elapsed().as_millis()
        );

        Ok(InferenceOutputs::new(entries))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tract_backend_creation() {
        let backend = TractBackend::new("model.onnx");
        assert!(!backend.is_initialized());
        assert!(backend.input_names().is_empty());
    }

    #[test]
    fn test_tract_backend_uninitialized_run() {
        let mut backend = TractBackend::new("model.onnx");
        assert!(backend.run(Vec::new()).is_err());
    }

    #[test]
    fn test_tract_backend_missing_model() {
        let mut backend = TractBackend::new("/nonexistent/model.onnx");
        let err = backend.initialize(&RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, NennError::Model(_)));
    }

    #[test]
    fn test_tract_provider_list() {
        let providers = TractBackend::list_providers();
        assert_eq!(providers.len(), 1);
        assert!(providers[0].1);
    }
}
