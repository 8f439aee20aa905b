//! Input loading: page image files and directories → ordered units.
//!
//! A directory contributes every image file directly inside it, sorted by
//! file name, so `page-001.png … page-120.png` keep their order. Each file
//! is checked by magic bytes before a single request is sent; a stray PDF
//! or text file fails the run up front instead of failing one page later.

use crate::error::PipelineError;
use crate::unit::ConversionUnit;
use image::ImageFormat;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "tif", "tiff", "bmp"];

/// Formats vision backends accept as page images.
fn is_page_format(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::WebP
            | ImageFormat::Gif
            | ImageFormat::Tiff
            | ImageFormat::Bmp
    )
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn io_error(path: &Path, err: std::io::Error) -> PipelineError {
    match err.kind() {
        ErrorKind::NotFound => PipelineError::FileNotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::ReadFailed {
            path: path.to_path_buf(),
            source: err,
        },
    }
}

/// Expand the given paths into the ordered list of page files.
///
/// Files are kept in the order given; directories are expanded in place.
pub async fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    for input in inputs {
        let meta = tokio::fs::metadata(input)
            .await
            .map_err(|e| io_error(input, e))?;
        if !meta.is_dir() {
            files.push(input.clone());
            continue;
        }

        let mut entries = tokio::fs::read_dir(input)
            .await
            .map_err(|e| io_error(input, e))?;
        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(input, e))? {
            let path = entry.path();
            if path.is_file() && has_image_extension(&path) {
                pages.push(path);
            }
        }
        pages.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!("{}: {} page image(s)", input.display(), pages.len());
        files.extend(pages);
    }

    if files.is_empty() {
        return Err(PipelineError::NoInput);
    }
    Ok(files)
}

/// Read one page image and verify it is an image a backend will accept.
pub async fn load_page(path: &Path) -> Result<Vec<u8>, PipelineError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
    match image::guess_format(&bytes) {
        Ok(format) if is_page_format(format) => Ok(bytes),
        _ => Err(PipelineError::NotAnImage {
            path: path.to_path_buf(),
            magic: bytes.iter().take(8).copied().collect(),
        }),
    }
}

/// Collect, read and validate every input, in order.
///
/// Unit identities are the file paths.
pub async fn load_units(inputs: &[PathBuf]) -> Result<Vec<ConversionUnit>, PipelineError> {
    let files = collect_inputs(inputs).await?;
    let mut units = Vec::with_capacity(files.len());
    for (index, path) in files.iter().enumerate() {
        let bytes = load_page(path).await?;
        units.push(ConversionUnit::new(index, bytes, path.display().to_string()));
    }
    info!("Loaded {} page image(s)", units.len());
    Ok(units)
}
