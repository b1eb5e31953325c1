//! Post-processing steps executed on the worker thread

use super::protocol::{Background, FrameData, InitOptions, LoadModels, OutputFormat, RunPostProcess};
use crate::{
    error::{NennError, Result},
    models::rseg::AlphaMatte,
};
use image::{imageops, RgbImage};

/// Work the post-processing worker performs for each request type
///
/// Implementations run on a single dedicated thread and may keep state
/// between frames.
pub trait PostProcessor: Send + 'static {
    /// Handle `INIT_POST_PROCESS`
    ///
    /// # Errors
    /// - Invalid options
    fn init(&mut self, options: InitOptions) -> Result<()>;

    /// Handle `LOAD_MODELS`
    ///
    /// # Errors
    /// - Models that cannot be loaded
    fn load_models(&mut self, request: LoadModels) -> Result<()>;

    /// Handle `RUN_POST_PROCESS`, returning the finished frame
    ///
    /// # Errors
    /// - Run before `init`
    /// - Malformed frames
    fn run(&mut self, task: RunPostProcess) -> Result<FrameData>;
}

/// Composites frames over a background using their alpha matte
#[derive(Debug, Default)]
pub struct Compositor {
    options: Option<InitOptions>,
    /// Background resized to the last frame size
    background: Option<RgbImage>,
    previous_alpha: Option<AlphaMatte>,
    models: Vec<std::path::PathBuf>,
}

impl Compositor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Model files registered through `LOAD_MODELS`
    #[must_use]
    pub fn models(&self) -> &[std::path::PathBuf] {
        &self.models
    }

    /// Blend `alpha` with the previous frame's matte
    fn smooth(&mut self, alpha: AlphaMatte, momentum: f32) -> AlphaMatte {
        let smoothed = match self.previous_alpha.take() {
            Some(previous)
                if momentum > 0.0
                    && (previous.width, previous.height) == (alpha.width, alpha.height) =>
            {
                let values = previous
                    .values
                    .iter()
                    .zip(&alpha.values)
                    .map(|(prev, cur)| momentum * prev + (1.0 - momentum) * cur)
                    .collect();
                AlphaMatte {
                    values,
                    ..alpha
                }
            },
            _ => alpha,
        };
        self.previous_alpha = Some(smoothed.clone());
        smoothed
    }

    fn background_for(&mut self, width: u32, height: u32) -> Result<Option<&RgbImage>> {
        let Some(options) = &self.options else {
            return Ok(None);
        };
        let Background::Image(frame) = &options.background else {
            return Ok(None);
        };

        let stale = self
            .background
            .as_ref()
            .map_or(true, |bg| bg.dimensions() != (width, height));
        if stale {
            let image = frame.clone().into_image()?.to_rgb8();
            let resized = if image.dimensions() == (width, height) {
                image
            } else {
                imageops::resize(&image, width, height, imageops::FilterType::Triangle)
            };
            self.background = Some(resized);
        }
        Ok(self.background.as_ref())
    }
}

fn mix(foreground: u8, background: u8, alpha: f32) -> u8 {
    (f32::from(foreground) * alpha + f32::from(background) * (1.0 - alpha))
        .round()
        .clamp(0.0, 255.0) as u8
}

impl PostProcessor for Compositor {
    fn init(&mut self, options: InitOptions) -> Result<()> {
        if !(0.0..1.0).contains(&options.smoothing) {
            return Err(NennError::config_value_error(
                "smoothing",
                options.smoothing,
                "0.0-1.0 (exclusive)",
                Some(0.0),
            ));
        }
        log::debug!(
            "Compositor initialized: output {:?}, smoothing {}",
            options.output,
            options.smoothing
        );
        self.options = Some(options);
        self.background = None;
        self.previous_alpha = None;
        Ok(())
    }

    fn load_models(&mut self, request: LoadModels) -> Result<()> {
        for path in &request.paths {
            if !path.is_file() {
                return Err(NennError::model_error_with_context(
                    "load",
                    path,
                    "file not found",
                    &[],
                ));
            }
        }
        log::debug!("Compositor registered {} model(s)", request.paths.len());
        self.models = request.paths;
        Ok(())
    }

    fn run(&mut self, task: RunPostProcess) -> Result<FrameData> {
        let (output, momentum) = match &self.options {
            Some(options) => (options.output, options.smoothing),
            None => {
                return Err(NennError::worker(
                    "INIT_POST_PROCESS must be handled before RUN_POST_PROCESS",
                ))
            },
        };

        task.alpha.validate()?;
        let frame = task.frame.into_image()?.to_rgb8();
        let (width, height) = frame.dimensions();
        let alpha = self.smooth(task.alpha.resized(width, height)?, momentum);

        if output == OutputFormat::Rgba {
            let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
            for (pixel, a) in frame.pixels().zip(&alpha.values) {
                pixels.extend_from_slice(&pixel.0);
                pixels.push((a * 255.0).round().clamp(0.0, 255.0) as u8);
            }
            return Ok(FrameData {
                width,
                height,
                channels: 4,
                pixels,
            });
        }

        let color = match self.options.as_ref().map(|o| &o.background) {
            Some(Background::Color(color)) => *color,
            _ => [0, 0, 0],
        };
        let background = self.background_for(width, height)?;

        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for (index, (pixel, a)) in frame.pixels().zip(&alpha.values).enumerate() {
            let bg = match background {
                Some(image) => {
                    let x = index as u32 % width;
                    let y = index as u32 / width;
                    image.get_pixel(x, y).0
                },
                None => color,
            };
            for channel in 0..3 {
                pixels.push(mix(pixel.0[channel], bg[channel], *a));
            }
        }

        Ok(FrameData {
            width,
            height,
            channels: 3,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb};

    fn frame(width: u32, height: u32, color: [u8; 3]) -> FrameData {
        FrameData::from_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb(color),
        )))
    }

    fn task(alpha: f32) -> RunPostProcess {
        RunPostProcess {
            frame: frame(2, 2, [200, 100, 0]),
            alpha: AlphaMatte::new(1, 1, vec![alpha]).unwrap(),
        }
    }

    #[test]
    fn test_run_requires_init() {
        let mut compositor = Compositor::new();
        assert!(matches!(compositor.run(task(1.0)), Err(NennError::Worker(_))));
    }

    #[test]
    fn test_rgba_output_carries_alpha() {
        let mut compositor = Compositor::new();
        compositor
            .init(InitOptions {
                output: OutputFormat::Rgba,
                ..InitOptions::default()
            })
            .unwrap();

        let result = compositor.run(task(0.5)).unwrap();
        assert_eq!(result.channels, 4);
        assert_eq!(&result.pixels[..4], &[200, 100, 0, 128]);
    }

    #[test]
    fn test_background_image_is_resized() {
        let mut compositor = Compositor::new();
        compositor
            .init(InitOptions {
                background: Background::Image(frame(1, 1, [0, 0, 250])),
                ..InitOptions::default()
            })
            .unwrap();

        let result = compositor.run(task(0.0)).unwrap();
        assert_eq!(result.channels, 3);
        assert!(result.pixels.chunks(3).all(|p| p == [0, 0, 250]));
    }

    #[test]
    fn test_temporal_smoothing() {
        let mut compositor = Compositor::new();
        compositor
            .init(InitOptions {
                background: Background::Color([0, 0, 0]),
                output: OutputFormat::Rgba,
                smoothing: 0.5,
            })
            .unwrap();

        let first = compositor.run(task(1.0)).unwrap();
        assert_eq!(first.pixels[3], 255);
        let second = compositor.run(task(0.0)).unwrap();
        assert_eq!(second.pixels[3], 128);
        let third = compositor.run(task(0.0)).unwrap();
        assert_eq!(third.pixels[3], 64);
    }

    #[test]
    fn test_matte_length_mismatch_is_an_error() {
        let mut compositor = Compositor::new();
        compositor.init(InitOptions::default()).unwrap();

        let short = RunPostProcess {
            frame: frame(2, 2, [10, 20, 30]),
            alpha: AlphaMatte {
                width: 2,
                height: 2,
                values: vec![1.0],
            },
        };
        assert!(matches!(compositor.run(short), Err(NennError::Postprocess(_))));

        let long = RunPostProcess {
            frame: frame(2, 2, [10, 20, 30]),
            alpha: AlphaMatte {
                width: 1,
                height: 1,
                values: vec![1.0; 5],
            },
        };
        assert!(compositor.run(long).is_err());

        // A bad frame does not poison the smoothing state
        let result = compositor.run(task(1.0)).unwrap();
        assert_eq!(result.pixels.len(), 2 * 2 * 3);
    }

    #[test]
    fn test_invalid_options_and_models() {
        let mut compositor = Compositor::new();
        let options = InitOptions {
            smoothing: 1.0,
            ..InitOptions::default()
        };
        assert!(compositor.init(options).is_err());
        assert!(compositor
            .load_models(LoadModels {
                paths: vec!["/nonexistent/flow.onnx".into()],
            })
            .is_err());
        assert!(compositor.load_models(LoadModels::default()).is_ok());

        let model = tempfile::NamedTempFile::new().unwrap();
        compositor
            .load_models(LoadModels {
                paths: vec![model.path().to_path_buf()],
            })
            .unwrap();
        assert_eq!(compositor.models(), &[model.path().to_path_buf()]);
    }
}
