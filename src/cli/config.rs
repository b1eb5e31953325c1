//! Conversion of CLI arguments into a processor configuration

use crate::cli::main_impl::{Cli, CliRsegOutput};
use crate::{
    config::ExecutionProvider,
    inference::BackendType,
    models::ModelFiles,
    processor::{ProcessorConfig, ProcessorConfigBuilder},
    services::ImageIo,
    worker::{Background, FrameData, OutputFormat},
};
use anyhow::{Context, Result};
use std::path::Path;

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build a [`ProcessorConfig`] from parsed arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<ProcessorConfig> {
        let model_dir = cli
            .model_dir
            .as_ref()
            .context("--model-dir is required when processing images")?;
        let model = ModelFiles::from_dir(model_dir)
            .with_context(|| format!("Failed to locate model files in {}", model_dir.display()))?;

        let (backend_type, execution_provider) =
            Self::parse_provider_string(&cli.execution_provider)?;

        let background = match &cli.background {
            Some(spec) => Self::parse_background(spec)?,
            None => Background::default(),
        };

        let rseg_output = match cli.rseg_output {
            CliRsegOutput::Rgb => OutputFormat::Rgb,
            CliRsegOutput::Rgba => OutputFormat::Rgba,
        };

        ProcessorConfigBuilder::new()
            .task(cli.task)
            .model(model)
            .backend_type(backend_type)
            .execution_provider(execution_provider)
            .intra_threads(cli.threads)
            .inter_threads(cli.threads)
            .threshold(cli.threshold)
            .max_queue_size(cli.queue_size)
            .background(background)
            .rseg_output(rseg_output)
            .smoothing(cli.smoothing)
            .debug(cli.verbose >= 2)
            .build()
            .context("Invalid configuration")
    }

    /// Parse `backend:provider`, e.g. `onnx:cuda` or `tract:cpu`
    ///
    /// A bare backend name selects its default provider.
    pub(crate) fn parse_provider_string(value: &str) -> Result<(BackendType, ExecutionProvider)> {
        let (backend, provider) = value.split_once(':').unwrap_or((value, "auto"));
        let backend_type: BackendType = backend
            .parse()
            .with_context(|| format!("Invalid execution provider '{value}'"))?;
        let provider: ExecutionProvider = provider
            .parse()
            .with_context(|| format!("Invalid execution provider '{value}'"))?;

        if backend_type == BackendType::Tract
            && !matches!(provider, ExecutionProvider::Cpu | ExecutionProvider::Auto)
        {
            anyhow::bail!("The tract backend only supports the cpu provider, got '{value}'");
        }

        Ok((backend_type, provider))
    }

    /// Parse a `#rrggbb` colour or load a background image
    pub(crate) fn parse_background(value: &str) -> Result<Background> {
        if let Some(hex) = value.strip_prefix('#') {
            if hex.len() != 6 || !hex.is_ascii() {
                anyhow::bail!("Background colour must look like #rrggbb, got '{value}'");
            }
            let channel = |range: std::ops::Range<usize>| {
                u8::from_str_radix(&hex[range], 16)
                    .with_context(|| format!("Invalid background colour '{value}'"))
            };
            return Ok(Background::Color([channel(0..2)?, channel(2..4)?, channel(4..6)?]));
        }

        let image = ImageIo::load(Path::new(value))
            .with_context(|| format!("Failed to load background image {value}"))?;
        Ok(Background::Image(FrameData::from_image(&image)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Task;
    use clap::Parser;
    use image::DynamicImage;
    use tempfile::tempdir;

    #[test]
    fn test_provider_string_parsing() {
        assert_eq!(
            CliConfigBuilder::parse_provider_string("onnx:cuda").unwrap(),
            (BackendType::Onnx, ExecutionProvider::Cuda)
        );
        assert_eq!(
            CliConfigBuilder::parse_provider_string("tract").unwrap(),
            (BackendType::Tract, ExecutionProvider::Auto)
        );
        assert!(CliConfigBuilder::parse_provider_string("tract:cuda").is_err());
        assert!(CliConfigBuilder::parse_provider_string("invalid:cpu").is_err());
        assert!(CliConfigBuilder::parse_provider_string("onnx:tpu").is_err());
    }

    #[test]
    fn test_background_colour_parsing() {
        assert_eq!(
            CliConfigBuilder::parse_background("#00ff80").unwrap(),
            Background::Color([0, 255, 128])
        );
        assert!(CliConfigBuilder::parse_background("#fff").is_err());
        assert!(CliConfigBuilder::parse_background("#gg0000").is_err());
        // Six bytes but a multi-byte character straddles a channel boundary
        assert!(CliConfigBuilder::parse_background("#aébcd").is_err());
        assert!(CliConfigBuilder::parse_background("#ab€d").is_err());
        assert!(CliConfigBuilder::parse_background("/missing/bg.png").is_err());
    }

    #[test]
    fn test_background_image_parsing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bg.png");
        ImageIo::save(&DynamicImage::new_rgb8(4, 3), &path).unwrap();

        match CliConfigBuilder::parse_background(path.to_str().unwrap()).unwrap() {
            Background::Image(frame) => assert_eq!((frame.width, frame.height), (4, 3)),
            other => panic!("expected image background, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_config_conversion() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"onnx").unwrap();
        std::fs::write(
            dir.path().join("infer_cfg.json"),
            r#"{"Preprocess": [{"type": "Permute"}]}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "nenn",
            "--task",
            "rseg",
            "--model-dir",
            dir.path().to_str().unwrap(),
            "--execution-provider",
            "tract:cpu",
            "--background",
            "#102030",
            "--queue-size",
            "3",
            "-vv",
            "frame.png",
        ]);
        let config = CliConfigBuilder::from_cli(&cli).unwrap();

        assert_eq!(config.task, Task::RSeg);
        assert_eq!(config.backend_type, BackendType::Tract);
        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.background, Background::Color([16, 32, 48]));
        assert_eq!(config.max_queue_size, 3);
        assert!(config.debug);
    }

    #[test]
    fn test_missing_model_dir() {
        let cli = Cli::parse_from(["nenn", "image.jpg"]);
        assert!(CliConfigBuilder::from_cli(&cli).is_err());
    }
}
