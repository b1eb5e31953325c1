//! Image file input/output

use crate::error::{NennError, Result};
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};

/// Extensions accepted as inputs and outputs
pub const SUPPORTED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "tiff", "tif", "bmp", "gif"];

/// Loading and saving of images
pub struct ImageIo;

impl ImageIo {
    /// Load an image, falling back to content sniffing when the extension lies
    ///
    /// ```rust,no_run
    /// use nenn::services::ImageIo;
    ///
    /// let image = ImageIo::load("street.jpg")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// # Errors
    /// - Missing or unreadable file
    /// - Data that no enabled decoder accepts
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(NennError::file_io_error(
                "read image file",
                path_ref,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        match image::open(path_ref) {
            Ok(img) => Ok(img),
            Err(e) => {
                log::debug!(
                    "Extension-based loading failed for {}: {}. Attempting content-based detection.",
                    path_ref.display(),
                    e
                );

                let data = std::fs::read(path_ref).map_err(|io_err| {
                    NennError::file_io_error("read image data", path_ref, &io_err)
                })?;

                image::load_from_memory(&data).map_err(|content_err| {
                    NennError::processing_stage_error(
                        "image loading",
                        &format!("Extension error: {e}. Content error: {content_err}"),
                        Some(&format!(
                            "path: {}, size: {} bytes",
                            path_ref.display(),
                            data.len()
                        )),
                    )
                })
            },
        }
    }

    /// Decode an image from memory
    ///
    /// # Errors
    /// - Data that no enabled decoder accepts
    pub fn load_from_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        Ok(image::load_from_memory(bytes)?)
    }

    /// Save `image` in the format implied by the extension of `path`
    ///
    /// Parent directories are created. JPEG has no alpha channel, so images
    /// are flattened to RGB before being written as JPEG.
    ///
    /// # Errors
    /// - Unknown or unsupported extension
    /// - Directory creation or encoding failures
    pub fn save<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let format = ImageFormat::from_path(path_ref).map_err(|_| {
            NennError::invalid_config(format!(
                "Cannot infer an image format from '{}'",
                path_ref.display()
            ))
        })?;

        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| NennError::file_io_error("create output directory", parent, &e))?;
        }

        let result = match format {
            ImageFormat::Jpeg => {
                DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(path_ref, format)
            },
            _ => image.save_with_format(path_ref, format),
        };

        result.map_err(|e| {
            NennError::processing_stage_error(
                "image save",
                &format!("Failed to save as {format:?}: {e}"),
                Some(&format!("path: {}", path_ref.display())),
            )
        })?;

        log::debug!("Saved {:?} image to {}", format, path_ref.display());
        Ok(())
    }

    /// Check if a file path has a supported image extension
    #[must_use]
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    }
}

/// Output path for `input`: `<out_dir>/<stem>_<suffix>.<ext>`
///
/// Without `out_dir` the file lands next to the input. The extension of the
/// input is kept, except that JPEG inputs become PNG when `needs_alpha` is set.
#[must_use]
pub fn output_path_for(input: &Path, out_dir: Option<&Path>, suffix: &str, needs_alpha: bool) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .filter(|ext| ImageIo::is_supported_format(Path::new(&format!("x.{ext}"))))
        .unwrap_or_else(|| "png".to_string());
    let extension = if needs_alpha && matches!(extension.as_str(), "jpg" | "jpeg" | "bmp") {
        "png".to_string()
    } else {
        extension
    };

    let file_name = format!("{stem}_{suffix}.{extension}");
    match out_dir {
        Some(dir) => dir.join(file_name),
        None => input.with_file_name(file_name),
    }
}
