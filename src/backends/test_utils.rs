//! Test utilities and mock backends for testing inference functionality
//!
//! `MockBackend` implements `InferenceBackend` with canned outputs so the
//! model wrappers can be tested without model files, ONNX Runtime or Tract.

use crate::{
    config::RuntimeConfig,
    error::{NennError, Result},
    inference::InferenceBackend,
    tensor::{Feeds, InferenceOutputs, TensorData},
};
use instant::Duration;
use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, Mutex};

/// Mock backend returning fixed outputs
#[derive(Debug, Clone)]
pub struct MockBackend {
    initialized: bool,
    input_names: Vec<String>,
    outputs: Vec<(String, TensorData)>,
    /// Call history for verification in tests
    call_history: Arc<Mutex<Vec<String>>>,
    /// Feeds received by the most recent `run`
    last_feeds: Arc<Mutex<Option<Feeds>>>,
    should_fail_init: bool,
    should_fail_inference: bool,
}

impl MockBackend {
    /// Create a mock with explicit input names and outputs
    #[must_use]
    pub fn new(input_names: &[&str], outputs: Vec<(String, TensorData)>) -> Self {
        Self {
            initialized: false,
            input_names: input_names.iter().map(|s| (*s).to_string()).collect(),
            outputs,
            call_history: Arc::new(Mutex::new(Vec::new())),
            last_feeds: Arc::new(Mutex::new(None)),
            should_fail_init: false,
            should_fail_inference: false,
        }
    }

    /// Detector exported with NMS: `[N, 6]` boxes plus `bbox_num`
    #[must_use]
    pub fn detector(rows: Vec<[f32; 6]>) -> Self {
        let count = rows.len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let boxes = ArrayD::from_shape_vec(IxDyn(&[count, 6]), flat)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0, 6])));
        let bbox_num = ArrayD::from_elem(IxDyn(&[1]), count as i32);

        Self::new(
            &["im_shape", "image", "scale_factor"],
            vec![
                ("multiclass_nms3_0.tmp_0".to_string(), TensorData::from(boxes)),
                ("multiclass_nms3_0.tmp_2".to_string(), TensorData::from(bbox_num)),
            ],
        )
    }

    /// Segmentation model with a single image input and one output
    #[must_use]
    pub fn segmenter(output: TensorData) -> Self {
        Self::new(&["x"], vec![("save_infer_model/scale_0.tmp_0".to_string(), output)])
    }

    /// Portrait matting model producing `[1, 2, H, W]` or `[1, 1, H, W]` scores
    #[must_use]
    pub fn matting(scores: ArrayD<f32>) -> Self {
        Self::new(&["x"], vec![("tmp_75".to_string(), TensorData::from(scores))])
    }

    /// Create a mock backend that will fail during initialization
    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.should_fail_init = true;
        self
    }

    /// Create a mock backend that will fail during inference
    #[must_use]
    pub fn failing_inference(mut self) -> Self {
        self.should_fail_inference = true;
        self
    }

    /// Get the call history for verification in tests
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().unwrap().clone()
    }

    /// Handle to the feeds of the most recent run, shared with clones
    pub fn last_feeds(&self) -> Arc<Mutex<Option<Feeds>>> {
        Arc::clone(&self.last_feeds)
    }

    fn record(&self, call: &str) {
        self.call_history.lock().unwrap().push(call.to_string());
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, _config: &RuntimeConfig) -> Result<Option<Duration>> {
        self.record("initialize");
        if self.should_fail_init {
            return Err(NennError::model("Mock initialization failure"));
        }
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn run(&mut self, feeds: Feeds) -> Result<InferenceOutputs> {
        self.record("run");
        if !self.initialized {
            return Err(NennError::internal("Mock backend not initialized"));
        }
        if self.should_fail_inference {
            return Err(NennError::inference("Mock inference failure"));
        }
        *self.last_feeds.lock().unwrap() = Some(feeds);
        Ok(InferenceOutputs::new(self.outputs.clone()))
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_detector_outputs() {
        let mut backend = MockBackend::detector(vec![[0.0, 0.9, 1.0, 2.0, 3.0, 4.0]]);
        backend.initialize(&RuntimeConfig::default()).unwrap();
        let outputs = backend.run(Vec::new()).unwrap();

        assert_eq!(outputs.first().unwrap().shape(), &[1, 6]);
        assert_eq!(outputs.get_index(1).unwrap().to_i64()[[0]], 1);
        assert_eq!(backend.call_history(), vec!["initialize", "run"]);
    }

    #[test]
    fn test_mock_failures() {
        let mut failing = MockBackend::detector(Vec::new()).failing_init();
        assert!(failing.initialize(&RuntimeConfig::default()).is_err());

        let mut failing = MockBackend::detector(Vec::new()).failing_inference();
        failing.initialize(&RuntimeConfig::default()).unwrap();
        assert!(matches!(failing.run(Vec::new()), Err(NennError::Inference(_))));
    }
}
