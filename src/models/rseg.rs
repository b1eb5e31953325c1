//! Real-time portrait segmentation feeding the post-processing worker

use super::model::Model;
use crate::{
    error::{NennError, Result},
    tensor::TensorData,
    worker::{
        protocol::{FrameData, RunPostProcess},
        PostProcessWorkerManager,
    },
};
use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Luma};
use instant::Instant;
use ndarray::{s, ArrayView2};
use serde::{Deserialize, Serialize};

/// Foreground probability per pixel, row-major, values in `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaMatte {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl AlphaMatte {
    /// # Errors
    /// - `values` does not hold `width * height` entries
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self> {
        let matte = Self {
            width,
            height,
            values,
        };
        matte.validate()?;
        Ok(matte)
    }

    /// Check that `values` holds `width * height` entries
    ///
    /// # Errors
    /// - Length mismatch
    pub fn validate(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize;
        if self.values.len() != expected {
            return Err(NennError::postprocess(format!(
                "Alpha matte of {}x{} needs {expected} values, got {}",
                self.width,
                self.height,
                self.values.len()
            )));
        }
        Ok(())
    }

    /// Copy a `[H, W]` view, clamping values to `[0, 1]`
    #[must_use]
    pub fn from_view(view: ArrayView2<'_, f32>) -> Self {
        let (height, width) = view.dim();
        Self {
            width: width as u32,
            height: height as u32,
            values: view.iter().map(|v| v.clamp(0.0, 1.0)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[y as usize * self.width as usize + x as usize]
    }

    /// Bilinear resize to `width` x `height`
    ///
    /// # Errors
    /// - The matte fails [`AlphaMatte::validate`]
    pub fn resized(&self, width: u32, height: u32) -> Result<Self> {
        self.validate()?;
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(self.width, self.height, self.values.clone()).ok_or_else(
                || NennError::postprocess("Alpha matte buffer does not match its dimensions"),
            )?;
        let resized = imageops::resize(&buffer, width, height, imageops::FilterType::Triangle);
        Ok(Self {
            width,
            height,
            values: resized.into_raw(),
        })
    }

    /// 8-bit rendering of the matte
    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y) * 255.0).round().clamp(0.0, 255.0) as u8])
        })
    }
}

/// Extract the alpha matte from a `[1, 2, H, W]` or `[1, 1, H, W]` output
///
/// # Errors
/// - Any other output shape
pub fn alpha_from_output(output: &TensorData) -> Result<AlphaMatte> {
    let scores = output.as_f32()?;
    let channel = match *scores.shape() {
        [1, 2, _, _] => 1,
        [1, 1, _, _] => 0,
        ref shape => {
            return Err(NennError::postprocess(format!(
                "Expected matting output [1, 2, H, W] or [1, 1, H, W], got {shape:?}"
            )))
        },
    };
    let alpha = scores.slice(s![0, channel, .., ..]);
    Ok(AlphaMatte::from_view(alpha))
}

/// Portrait segmenter producing per-frame alpha mattes
#[derive(Debug)]
pub struct RealtimeSegmenter {
    model: Model,
}

impl RealtimeSegmenter {
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Alpha matte of `image` at the model's output resolution
    ///
    /// # Errors
    /// - Preprocessing or inference failures
    /// - Unsupported output shape
    pub fn alpha(&mut self, image: &DynamicImage) -> Result<AlphaMatte> {
        let (_, outputs) = self.model.predict(image)?;
        alpha_from_output(outputs.first()?)
    }

    /// Run the model on `frame` and let the worker composite the result
    ///
    /// # Errors
    /// - Inference failures
    /// - Worker errors, or the worker terminating before it answers
    pub async fn process_frame(
        &mut self,
        frame: &DynamicImage,
        worker: &PostProcessWorkerManager,
    ) -> Result<DynamicImage> {
        let start = Instant::now();
        let alpha = self.alpha(frame)?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        let composited = worker
            .run(RunPostProcess {
                frame: FrameData::from_image(frame),
                alpha,
            })
            .await?;

        tracing::debug!(
            inference_ms,
            total_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Frame composited"
        );
        composited.into_image()
    }
}
