//! Object detection on top of a [`Model`]

use super::model::Model;
use crate::{
    error::{NennError, Result},
    tensor::InferenceOutputs,
};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

/// Score threshold used when neither the caller nor the config sets one
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Axis-aligned box in pixels of the original image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    #[must_use]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clamp to a `width` x `height` image
    #[must_use]
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i64,
    /// Name from the config's `label_list`, if it has one for `class_id`
    pub label: Option<String>,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Detector wrapping a model exported with its NMS step
#[derive(Debug)]
pub struct Detector {
    model: Model,
    threshold: Option<f32>,
}

impl Detector {
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self {
            model,
            threshold: None,
        }
    }

    /// Override the config's `draw_threshold`
    #[must_use]
    pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
        self.threshold = threshold;
        self
    }

    /// Effective score threshold
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
            .or(self.model.config().draw_threshold)
            .unwrap_or(DEFAULT_THRESHOLD)
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Detect objects in `image`
    ///
    /// # Errors
    /// - Preprocessing or inference failures
    /// - Outputs that are not `[N, 6]` boxes
    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let (_, outputs) = self.model.predict(image)?;
        let detections = self.decode(&outputs, image.dimensions())?;
        log::debug!(
            "Kept {} detection(s) at threshold {:.2}",
            detections.len(),
            self.threshold()
        );
        Ok(detections)
    }

    /// Turn raw NMS outputs into detections for an image of `(width, height)`
    ///
    /// # Errors
    /// - The first output is not `[N, 6]` (or `[1, N, 6]`)
    pub fn decode(&self, outputs: &InferenceOutputs, size: (u32, u32)) -> Result<Vec<Detection>> {
        let boxes = outputs.first()?.to_f32();
        let (n, cols) = match *boxes.shape() {
            [n, cols] | [1, n, cols] if cols >= 6 => (n, cols),
            ref shape => {
                return Err(NennError::postprocess(format!(
                    "Expected detection output [N, 6], got {shape:?}"
                )))
            },
        };
        let rows = boxes
            .into_shape_with_order((n, cols))
            .map_err(|e| NennError::postprocess(format!("Bad box tensor: {e}")))?;

        // `bbox_num` counts the valid rows; exporters pad empty results with a dummy row
        let count = outputs
            .get_index(1)
            .and_then(|num| num.to_i64().iter().next().copied())
            .map_or(rows.nrows(), |n| usize::try_from(n).unwrap_or(0).min(rows.nrows()));

        let threshold = self.threshold();
        let (width, height) = size;
        let config = self.model.config();

        let detections = rows
            .outer_iter()
            .take(count)
            .filter_map(|row| {
                let class_id = row[0] as i64;
                let score = row[1];
                if class_id < 0 || score < threshold {
                    return None;
                }
                let bbox = BoundingBox::new(row[2], row[3], row[4], row[5]).clamped(width, height);
                if bbox.area() <= 0.0 {
                    return None;
                }
                Some(Detection {
                    class_id,
                    label: config.label(class_id).map(String::from),
                    score,
                    bbox,
                })
            })
            .collect();

        Ok(detections)
    }
}
