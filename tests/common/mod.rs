//! Shared fixtures for integration tests
#![allow(dead_code)]

use instant::Duration;
use nenn::{
    BackendFactory, BackendType, Feeds, InferenceBackend, InferenceOutputs, ModelFiles, Result,
    RuntimeConfig, TensorData,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Backend returning fixed outputs and recording every feed it receives
#[derive(Clone)]
pub struct ScriptedBackend {
    inputs: Vec<String>,
    outputs: Vec<(String, TensorData)>,
    initialized: bool,
    pub feeds: Arc<Mutex<Vec<Feeds>>>,
}

impl ScriptedBackend {
    pub fn new(inputs: &[&str], outputs: Vec<(&str, TensorData)>) -> Self {
        Self {
            inputs: inputs.iter().map(ToString::to_string).collect(),
            outputs: outputs
                .into_iter()
                .map(|(name, tensor)| (name.to_string(), tensor))
                .collect(),
            initialized: false,
            feeds: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Detector with the usual `im_shape`/`image`/`scale_factor` inputs
    pub fn detector(rows: &[[f32; 6]], bbox_num: i32) -> Self {
        let boxes = ndarray::Array2::from_shape_fn((rows.len(), 6), |(r, c)| rows[r][c]).into_dyn();
        let num = ndarray::arr1(&[bbox_num]).into_dyn();
        Self::new(
            &["im_shape", "image", "scale_factor"],
            vec![
                ("multiclass_nms3_0.tmp_0", boxes.into()),
                ("multiclass_nms3_0.tmp_2", num.into()),
            ],
        )
    }

    /// Single-input model returning `output`
    pub fn single(output: TensorData) -> Self {
        Self::new(&["x"], vec![("output", output)])
    }

    pub fn recorded_feeds(&self) -> Vec<Feeds> {
        self.feeds.lock().unwrap().clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn initialize(&mut self, _config: &RuntimeConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn input_names(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn run(&mut self, feeds: Feeds) -> Result<InferenceOutputs> {
        self.feeds.lock().unwrap().push(feeds);
        Ok(InferenceOutputs::new(self.outputs.clone()))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Factory handing out clones of one scripted backend
pub struct ScriptedFactory(pub ScriptedBackend);

impl BackendFactory for ScriptedFactory {
    fn create_backend(
        &self,
        _backend_type: BackendType,
        _model_path: &Path,
    ) -> Result<Box<dyn InferenceBackend>> {
        Ok(Box::new(self.0.clone()))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Onnx, BackendType::Tract]
    }
}

/// Model directory with a placeholder `model.onnx` and the given deploy config
pub fn model_dir(deploy_config: &str) -> (TempDir, ModelFiles) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("model.onnx"), b"placeholder").unwrap();
    std::fs::write(dir.path().join("infer_cfg.json"), deploy_config).unwrap();
    let files = ModelFiles::from_dir(dir.path()).unwrap();
    (dir, files)
}
