//! Semantic segmentation on top of a [`Model`]

use super::model::Model;
use crate::{
    error::{NennError, Result},
    tensor::TensorData,
    visualize,
};
use image::{imageops, DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use ndarray::{ArrayView2, Axis, Ix2};

/// Per-pixel class labels at the resolution of the input image
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    pub label_map: GrayImage,
    pub num_classes: usize,
}

impl SegmentationResult {
    /// Pseudo-colour rendering of the label map
    #[must_use]
    pub fn colorize(&self) -> RgbImage {
        let palette = visualize::color_map(256);
        RgbImage::from_fn(self.label_map.width(), self.label_map.height(), |x, y| {
            let label = self.label_map.get_pixel(x, y).0[0];
            image::Rgb(palette[usize::from(label)])
        })
    }

    /// Number of pixels per class id, indexed by class
    #[must_use]
    pub fn class_pixel_counts(&self) -> Vec<u64> {
        let mut counts = vec![0_u64; self.num_classes];
        for pixel in self.label_map.pixels() {
            let label = usize::from(pixel.0[0]);
            if label >= counts.len() {
                counts.resize(label + 1, 0);
            }
            counts[label] += 1;
        }
        counts
    }
}

/// Segmenter for models producing class scores or a label map
#[derive(Debug)]
pub struct Segmenter {
    model: Model,
}

impl Segmenter {
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Segment `image` into a label map of the same size
    ///
    /// # Errors
    /// - Preprocessing or inference failures
    /// - Outputs that are neither class scores nor a label map
    pub fn segment(&mut self, image: &DynamicImage) -> Result<SegmentationResult> {
        let (_, outputs) = self.model.predict(image)?;
        let mut result = label_map_from_output(outputs.first()?, image.dimensions())?;
        result.num_classes = result.num_classes.max(self.model.config().label_list.len());
        Ok(result)
    }
}

/// Build a label map of `size` from a `[1, C, H, W]` score tensor or a
/// `[1, H, W]` / `[1, 1, H, W]` label tensor
///
/// # Errors
/// - Unsupported output shape
/// - Labels outside `0..=255`
pub fn label_map_from_output(output: &TensorData, size: (u32, u32)) -> Result<SegmentationResult> {
    let (labels, num_classes) = match *output.shape() {
        [1, channels, _, _] if channels > 1 => {
            let scores = output.to_f32();
            let scores = scores.index_axis(Axis(0), 0);
            let labels = scores.map_axis(Axis(0), |pixel| {
                let mut best = 0;
                for (class, score) in pixel.iter().enumerate() {
                    if *score > pixel[best] {
                        best = class;
                    }
                }
                best as i64
            });
            (labels, channels)
        },
        [1, 1, _, _] | [1, _, _] => {
            let labels = output.to_i64();
            let height = output.shape()[output.shape().len() - 2];
            let width = output.shape()[output.shape().len() - 1];
            let labels = labels
                .into_shape_with_order((height, width))
                .map_err(|e| NennError::postprocess(format!("Bad label map: {e}")))?
                .into_dyn();
            let max = labels.iter().copied().max().unwrap_or(0);
            (labels, usize::try_from(max).unwrap_or(0) + 1)
        },
        ref shape => {
            return Err(NennError::postprocess(format!(
                "Expected segmentation output [1, C, H, W] or [1, H, W], got {shape:?}"
            )))
        },
    };

    let labels = labels
        .into_dimensionality::<Ix2>()
        .map_err(|e| NennError::postprocess(format!("Bad label map: {e}")))?;
    let label_map = to_gray(labels.view())?;

    let (width, height) = size;
    let label_map = if label_map.dimensions() == (width, height) {
        label_map
    } else {
        imageops::resize(&label_map, width, height, imageops::FilterType::Nearest)
    };

    Ok(SegmentationResult {
        label_map,
        num_classes,
    })
}

fn to_gray(labels: ArrayView2<'_, i64>) -> Result<GrayImage> {
    let (height, width) = labels.dim();
    let mut image = GrayImage::new(width as u32, height as u32);
    for ((y, x), label) in labels.indexed_iter() {
        let value = u8::try_from(*label).map_err(|_| {
            NennError::postprocess(format!("Label {label} at ({x}, {y}) is outside 0..=255"))
        })?;
        image.put_pixel(x as u32, y as u32, Luma([value]));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backends::test_utils::MockBackend, config::RuntimeConfig, deploy::DeployConfig};
    use ndarray::{Array4, ArrayD, IxDyn};

    #[test]
    fn test_argmax_over_scores() {
        let mut scores = Array4::<f32>::zeros((1, 3, 2, 2));
        scores[[0, 2, 0, 0]] = 1.0;
        scores[[0, 1, 0, 1]] = 0.7;
        scores[[0, 0, 1, 0]] = 0.2;
        scores[[0, 1, 1, 1]] = 0.4;
        scores[[0, 2, 1, 1]] = 0.5;

        let result = label_map_from_output(&scores.into_dyn().into(), (2, 2)).unwrap();
        assert_eq!(result.num_classes, 3);
        assert_eq!(result.label_map.as_raw(), &vec![2, 1, 0, 2]);
        assert_eq!(result.class_pixel_counts(), vec![1, 1, 2]);
    }

    #[test]
    fn test_label_map_resized_to_original() {
        let labels = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0_i32, 1, 1, 0]).unwrap();
        let result = label_map_from_output(&labels.into(), (4, 4)).unwrap();

        assert_eq!(result.label_map.dimensions(), (4, 4));
        assert_eq!(result.num_classes, 2);
        assert_eq!(result.label_map.get_pixel(0, 0).0[0], 0);
        assert_eq!(result.label_map.get_pixel(3, 0).0[0], 1);
        assert_eq!(result.label_map.get_pixel(0, 3).0[0], 1);
        assert_eq!(result.class_pixel_counts(), vec![8, 8]);
    }

    #[test]
    fn test_invalid_outputs() {
        let labels = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1]), vec![300_i64]).unwrap();
        assert!(label_map_from_output(&labels.into(), (1, 1)).is_err());

        let flat = ArrayD::<f32>::zeros(IxDyn(&[4]));
        assert!(label_map_from_output(&flat.into(), (1, 1)).is_err());
    }

    #[test]
    fn test_segment_counts_config_labels() {
        let config = DeployConfig::from_json_str(
            r#"{
                "Deploy": {
                    "transforms": [{"type": "Normalize"}, {"type": "Permute"}],
                    "label_list": ["background", "road", "car", "sky"]
                }
            }"#,
        )
        .unwrap();
        let output = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![0_i64, 1]).unwrap();
        let model = Model::with_backend(
            config,
            Box::new(MockBackend::segmenter(output.into())),
            &RuntimeConfig::default(),
        )
        .unwrap();
        let mut segmenter = Segmenter::new(model);

        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 2));
        let result = segmenter.segment(&image).unwrap();
        assert_eq!(result.num_classes, 4);
        assert_eq!(result.label_map.dimensions(), (4, 2));
        assert_eq!(result.colorize().get_pixel(3, 0).0, [128, 0, 0]);
    }
}
