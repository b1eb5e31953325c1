//! Model loading and feed construction shared by every task

use crate::{
    config::RuntimeConfig,
    deploy::DeployConfig,
    error::{NennError, Result},
    inference::InferenceBackend,
    preprocess::{PreparedInput, Preprocessor},
    tensor::{Feeds, InferenceOutputs, TensorData},
};
use image::{DynamicImage, GenericImageView};
use instant::Instant;
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Model file name looked up by [`ModelFiles::from_dir`]
pub const MODEL_FILE_NAME: &str = "model.onnx";

/// Config file names looked up by [`ModelFiles::from_dir`], in order of preference
pub const CONFIG_FILE_NAMES: [&str; 3] = ["infer_cfg.json", "deploy.json", "config.json"];

/// Input name that receives `[[h, w]]` of the tensor image
pub const IM_SHAPE_INPUT: &str = "im_shape";

/// Input name that receives `[[scale_y, scale_x]]`
pub const SCALE_FACTOR_INPUT: &str = "scale_factor";

/// Paths of an exported model and its deploy config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub model: PathBuf,
    pub config: PathBuf,
}

impl ModelFiles {
    #[must_use]
    pub fn new<M: Into<PathBuf>, C: Into<PathBuf>>(model: M, config: C) -> Self {
        Self {
            model: model.into(),
            config: config.into(),
        }
    }

    /// Resolve the files of an export directory
    ///
    /// # Errors
    /// - `model.onnx` is missing
    /// - None of the known config file names exists
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let model = dir.join(MODEL_FILE_NAME);
        if !model.is_file() {
            return Err(NennError::model_error_with_context(
                "locate",
                &model,
                "file not found",
                &["export the model to ONNX as model.onnx"],
            ));
        }

        let config = CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                NennError::invalid_config(format!(
                    "No deploy config in '{}' (expected one of {})",
                    dir.display(),
                    CONFIG_FILE_NAMES.join(", ")
                ))
            })?;

        Ok(Self { model, config })
    }
}

/// A deploy config paired with an initialized backend
pub struct Model {
    config: DeployConfig,
    preprocessor: Preprocessor,
    backend: Box<dyn InferenceBackend>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .field("inputs", &self.backend.input_names())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Read the deploy config from `files` and initialize `backend`
    ///
    /// # Errors
    /// - Unreadable or invalid deploy config
    /// - Backend initialization failures
    pub fn load(
        files: &ModelFiles,
        backend: Box<dyn InferenceBackend>,
        runtime: &RuntimeConfig,
    ) -> Result<Self> {
        let config = DeployConfig::from_path(&files.config)?;
        Self::with_backend(config, backend, runtime)
    }

    /// Pair an already parsed config with `backend`
    ///
    /// # Errors
    /// - Invalid deploy config
    /// - Backend initialization failures
    pub fn with_backend(
        config: DeployConfig,
        mut backend: Box<dyn InferenceBackend>,
        runtime: &RuntimeConfig,
    ) -> Result<Self> {
        config.validate()?;
        runtime.validate()?;

        if let Some(load_time) = backend.initialize(runtime)? {
            log::debug!(
                "Model ready in {:.2}ms ({} preprocess steps)",
                load_time.as_secs_f64() * 1000.0,
                config.preprocess.len()
            );
        }

        let preprocessor = Preprocessor::from_deploy(&config);
        Ok(Self {
            config,
            preprocessor,
            backend,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    #[must_use]
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    #[must_use]
    pub fn input_names(&self) -> Vec<String> {
        self.backend.input_names()
    }

    /// Map the prepared image onto the inputs the model declares
    ///
    /// # Errors
    /// - The model declares more than one input that is not a known auxiliary input
    pub fn build_feeds(&self, input: &PreparedInput) -> Result<Feeds> {
        let names = self.backend.input_names();
        if names.is_empty() {
            return Ok(vec![("image".to_string(), TensorData::from(input.tensor.clone()))]);
        }

        let mut feeds = Vec::with_capacity(names.len());
        let mut image_fed = false;
        for name in names {
            let tensor = match name.as_str() {
                IM_SHAPE_INPUT => row_tensor(input.im_shape),
                SCALE_FACTOR_INPUT => row_tensor(input.scale_factor),
                _ if !image_fed => {
                    image_fed = true;
                    TensorData::from(input.tensor.clone())
                },
                _ => {
                    return Err(NennError::inference(format!(
                        "Model input '{name}' has no source (only one image input is supported)"
                    )))
                },
            };
            feeds.push((name, tensor));
        }

        if !image_fed {
            return Err(NennError::inference("Model declares no image input"));
        }
        Ok(feeds)
    }

    /// Preprocess `image`, run the model and return its raw outputs
    ///
    /// # Errors
    /// - Preprocessing, feed construction or inference failures
    pub fn predict(&mut self, image: &DynamicImage) -> Result<(PreparedInput, InferenceOutputs)> {
        let (width, height) = image.dimensions();

        let preprocess_start = Instant::now();
        let input = self.preprocessor.run(image)?;
        log::debug!(
            "Preprocessed {}x{} image into {:?} tensor in {:.2}ms",
            width,
            height,
            input.tensor.shape(),
            preprocess_start.elapsed().as_secs_f64() * 1000.0
        );

        let feeds = self.build_feeds(&input)?;

        let inference_start = Instant::now();
        let outputs = self.backend.run(feeds)?;
        log::debug!(
            "Inference produced {} output(s) in {:.2}ms",
            outputs.len(),
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok((input, outputs))
    }
}

fn row_tensor(values: [f32; 2]) -> TensorData {
    TensorData::from(Array2::from_shape_fn((1, 2), |(_, i)| values[i]).into_dyn())
}
