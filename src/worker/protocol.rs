//! Messages exchanged with the post-processing worker
//!
//! Every message is a `{ "type": ..., "data": ... }` envelope carried
//! together with the id of the task it belongs to.

use crate::{
    error::{NennError, Result},
    models::rseg::AlphaMatte,
};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A message tagged with the id of its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub message: T,
}

/// Requests sent to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    InitPostProcess(InitOptions),
    RunPostProcess(RunPostProcess),
    LoadModels(LoadModels),
}

impl Request {
    /// Wire name of the request
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitPostProcess(_) => "INIT_POST_PROCESS",
            Self::RunPostProcess(_) => "RUN_POST_PROCESS",
            Self::LoadModels(_) => "LOAD_MODELS",
        }
    }
}

/// Replies sent back by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    InitPostProcessDone,
    RunPostProcessDone(FrameData),
    LoadModelsDone,
    Error { message: String },
}

/// What the composited frame is laid over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Background {
    Color([u8; 3]),
    Image(FrameData),
}

impl Default for Background {
    fn default() -> Self {
        Self::Color([255, 255, 255])
    }
}

/// Pixel format of composited frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Foreground with the alpha matte as its alpha channel
    Rgba,
    /// Foreground blended over the background
    #[default]
    Rgb,
}

/// Options of `INIT_POST_PROCESS`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InitOptions {
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub output: OutputFormat,
    /// Weight of the previous alpha in temporal smoothing, 0 disables it
    #[serde(default)]
    pub smoothing: f32,
}

/// Payload of `RUN_POST_PROCESS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPostProcess {
    pub frame: FrameData,
    pub alpha: AlphaMatte,
}

/// Payload of `LOAD_MODELS`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadModels {
    pub paths: Vec<PathBuf>,
}

/// Interleaved 8-bit frame with 3 (RGB) or 4 (RGBA) channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl FrameData {
    /// Copy an image as RGB
    #[must_use]
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        Self {
            width: rgb.width(),
            height: rgb.height(),
            channels: 3,
            pixels: rgb.into_raw(),
        }
    }

    /// Convert back into an image
    ///
    /// # Errors
    /// - Channel count other than 3 or 4
    /// - Pixel buffer that does not match the dimensions
    pub fn into_image(self) -> Result<DynamicImage> {
        let (width, height, channels) = (self.width, self.height, self.channels);
        let mismatch = || {
            NennError::postprocess(format!(
                "Frame buffer does not hold {width}x{height}x{channels} pixels"
            ))
        };
        match channels {
            3 => RgbImage::from_raw(width, height, self.pixels)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(mismatch),
            4 => RgbaImage::from_raw(width, height, self.pixels)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(mismatch),
            other => Err(NennError::postprocess(format!(
                "Unsupported frame channel count {other}"
            ))),
        }
    }
}
