//! Config-driven image preprocessing
//!
//! Applies the steps of a [`DeployConfig`] to an image, in the order they are
//! listed, and produces the image tensor plus the shape bookkeeping that
//! detection models take as extra inputs.

use crate::{
    deploy::{ChannelOrder, DeployConfig, NormType, PreprocessOp},
    error::{NennError, Result},
};
use image::{imageops::FilterType, DynamicImage, Rgb, Rgb32FImage, RgbImage};
use ndarray::{Array4, ArrayD};

/// Memory layout of the produced image tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, C, H, W]`, produced when the pipeline ends with `Permute`
    Nchw,
    /// `[1, H, W, C]`
    Nhwc,
}

/// Image tensor and shape metadata ready to be turned into model feeds
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub tensor: ArrayD<f32>,
    pub layout: TensorLayout,
    /// Height and width of the tensor image
    pub im_shape: [f32; 2],
    /// Accumulated `[scale_y, scale_x]` of all resize steps
    pub scale_factor: [f32; 2],
    /// Width and height of the input image
    pub original_size: (u32, u32),
}

impl PreparedInput {
    /// Spatial size `(width, height)` of the tensor image
    #[must_use]
    pub fn tensor_size(&self) -> (u32, u32) {
        (self.im_shape[1] as u32, self.im_shape[0] as u32)
    }
}

/// Pixel buffer of the working image
///
/// Stays 8-bit until a `Normalize` step so resizing behaves like it does on
/// decoded images; after normalization values can leave `[0, 1]`.
enum Pixels {
    Raw(RgbImage),
    Float(Rgb32FImage),
}

impl Pixels {
    fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Raw(image) => image.dimensions(),
            Self::Float(image) => image.dimensions(),
        }
    }
}

/// Working state threaded through the steps
struct Frame {
    pixels: Pixels,
    scale_factor: [f32; 2],
    layout: TensorLayout,
}

/// Applies a list of preprocessing steps
#[derive(Debug, Clone)]
pub struct Preprocessor {
    ops: Vec<PreprocessOp>,
}

impl Preprocessor {
    #[must_use]
    pub fn new(ops: Vec<PreprocessOp>) -> Self {
        Self { ops }
    }

    #[must_use]
    pub fn from_deploy(config: &DeployConfig) -> Self {
        Self::new(config.preprocess.clone())
    }

    #[must_use]
    pub fn ops(&self) -> &[PreprocessOp] {
        &self.ops
    }

    /// Run every step on `image` and build the tensor
    ///
    /// # Errors
    /// - Empty input image
    /// - A crop larger than the image at that point of the pipeline
    /// - Resize results that collapse to zero pixels
    pub fn run(&self, image: &DynamicImage) -> Result<PreparedInput> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(NennError::preprocess("Input image is empty"));
        }

        let mut frame = Frame {
            pixels: Pixels::Raw(rgb),
            scale_factor: [1.0, 1.0],
            layout: TensorLayout::Nhwc,
        };

        for op in &self.ops {
            frame = apply(op, frame)?;
            let (w, h) = frame.pixels.dimensions();
            log::trace!("Applied {} -> {}x{}", op.name(), w, h);
        }

        let (out_w, out_h) = frame.pixels.dimensions();
        Ok(PreparedInput {
            tensor: to_tensor(&frame.pixels, frame.layout),
            layout: frame.layout,
            im_shape: [out_h as f32, out_w as f32],
            scale_factor: frame.scale_factor,
            original_size: (width, height),
        })
    }
}

fn apply(op: &PreprocessOp, mut frame: Frame) -> Result<Frame> {
    match op {
        PreprocessOp::Decode { mode } => {
            if *mode == ChannelOrder::Bgr {
                match &mut frame.pixels {
                    Pixels::Raw(image) => image.pixels_mut().for_each(|p| p.0.swap(0, 2)),
                    Pixels::Float(image) => image.pixels_mut().for_each(|p| p.0.swap(0, 2)),
                }
            }
            Ok(frame)
        },
        PreprocessOp::Resize {
            target_size,
            keep_ratio,
            resize_short,
            interp,
        } => {
            let (w, h) = frame.pixels.dimensions();
            let (w_f, h_f) = (w as f32, h as f32);

            let (scale_y, scale_x) = match (target_size, resize_short) {
                (Some(size), _) => {
                    let (th, tw) = size.hw();
                    if *keep_ratio {
                        let target_min = th.min(tw) as f32;
                        let target_max = th.max(tw) as f32;
                        let im_min = h_f.min(w_f);
                        let im_max = h_f.max(w_f);
                        let scale = (target_min / im_min).min(target_max / im_max);
                        (scale, scale)
                    } else {
                        (th as f32 / h_f, tw as f32 / w_f)
                    }
                },
                (None, Some(short)) => {
                    let scale = *short as f32 / h_f.min(w_f);
                    (scale, scale)
                },
                (None, None) => {
                    return Err(NennError::processing_stage_error(
                        "Resize",
                        "neither target_size nor resize_short is set",
                        None,
                    ));
                },
            };

            let new_w = (w_f * scale_x).round() as u32;
            let new_h = (h_f * scale_y).round() as u32;
            if new_w == 0 || new_h == 0 {
                return Err(NennError::processing_stage_error(
                    "Resize",
                    "resized image has no pixels",
                    Some(&format!("{w}x{h}")),
                ));
            }

            let filter = filter_for(*interp);
            frame.pixels = match frame.pixels {
                Pixels::Raw(image) => {
                    Pixels::Raw(image::imageops::resize(&image, new_w, new_h, filter))
                },
                Pixels::Float(image) => Pixels::Float(resize_float(&image, new_w, new_h, filter)),
            };
            frame.scale_factor[0] *= scale_y;
            frame.scale_factor[1] *= scale_x;
            Ok(frame)
        },
        PreprocessOp::Normalize {
            mean,
            std,
            is_scale,
            norm_type,
        } => {
            let mut image = match frame.pixels {
                Pixels::Raw(image) => Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
                    let p = image.get_pixel(x, y);
                    Rgb([f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
                }),
                Pixels::Float(image) => image,
            };
            let scale = if *is_scale { 1.0 / 255.0 } else { 1.0 };
            for pixel in image.pixels_mut() {
                for (c, value) in pixel.0.iter_mut().enumerate() {
                    *value *= scale;
                    if *norm_type == NormType::MeanStd {
                        let m = mean.get(c).copied().unwrap_or(0.0);
                        let s = std.get(c).copied().unwrap_or(1.0);
                        *value = (*value - m) / s;
                    }
                }
            }
            frame.pixels = Pixels::Float(image);
            Ok(frame)
        },
        PreprocessOp::Crop { crop_size } => {
            let (ch, cw) = crop_size.hw();
            let (w, h) = frame.pixels.dimensions();
            if cw > w || ch > h {
                return Err(NennError::processing_stage_error(
                    "Crop",
                    &format!("crop size {cw}x{ch} exceeds image"),
                    Some(&format!("{w}x{h}")),
                ));
            }
            let x = (w - cw) / 2;
            let y = (h - ch) / 2;
            frame.pixels = match frame.pixels {
                Pixels::Raw(image) => {
                    Pixels::Raw(image::imageops::crop_imm(&image, x, y, cw, ch).to_image())
                },
                Pixels::Float(image) => {
                    Pixels::Float(image::imageops::crop_imm(&image, x, y, cw, ch).to_image())
                },
            };
            Ok(frame)
        },
        PreprocessOp::Permute {} => {
            frame.layout = TensorLayout::Nchw;
            Ok(frame)
        },
    }
}

/// Map OpenCV interpolation codes onto `image` filters
///
/// `image` has no area filter, so `INTER_AREA` (3) uses the triangle filter.
#[must_use]
pub fn filter_for(interp: i32) -> FilterType {
    match interp {
        0 => FilterType::Nearest,
        2 => FilterType::CatmullRom,
        4 => FilterType::Lanczos3,
        _ => FilterType::Triangle,
    }
}

/// Resize normalized data
///
/// `image` clamps float samples to `[0, 1]`, so values are mapped into that
/// range per channel, resized and mapped back.
#[allow(clippy::indexing_slicing)] // channel indices are 0..3
fn resize_float(image: &Rgb32FImage, width: u32, height: u32, filter: FilterType) -> Rgb32FImage {
    let mut lo = [f32::MAX; 3];
    let mut hi = [f32::MIN; 3];
    for pixel in image.pixels() {
        for c in 0..3 {
            lo[c] = lo[c].min(pixel[c]);
            hi[c] = hi[c].max(pixel[c]);
        }
    }
    let span: Vec<f32> = (0..3)
        .map(|c| if hi[c] > lo[c] { hi[c] - lo[c] } else { 1.0 })
        .collect();

    let mut unit = image.clone();
    for pixel in unit.pixels_mut() {
        for (c, value) in pixel.0.iter_mut().enumerate() {
            *value = (*value - lo[c]) / span[c];
        }
    }

    let mut resized = image::imageops::resize(&unit, width, height, filter);
    for pixel in resized.pixels_mut() {
        for (c, value) in pixel.0.iter_mut().enumerate() {
            *value = *value * span[c] + lo[c];
        }
    }
    resized
}

#[allow(clippy::indexing_slicing)] // tensor allocated from the image dimensions
fn to_tensor(pixels: &Pixels, layout: TensorLayout) -> ArrayD<f32> {
    let (w, h) = pixels.dimensions();
    let (w, h) = (w as usize, h as usize);

    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
    };

    let mut put = |x: u32, y: u32, values: [f32; 3]| {
        let (x, y) = (x as usize, y as usize);
        for (c, value) in values.into_iter().enumerate() {
            match layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    };

    match pixels {
        Pixels::Raw(image) => {
            for (x, y, p) in image.enumerate_pixels() {
                put(x, y, [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])]);
            }
        },
        Pixels::Float(image) => {
            for (x, y, p) in image.enumerate_pixels() {
                put(x, y, p.0);
            }
        },
    }

    tensor.into_dyn()
}
