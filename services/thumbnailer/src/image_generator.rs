//! Resize engine built on the `image` crate.
//!
//! Originals are decoded once per request and rotated upright according to
//! their EXIF orientation; every configured width is then resized, encoded
//! as JPEG and written next to its siblings.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::telemetry::{Counter, MetricsSink};
use crate::thumbs_gen::{
    thumbnail_dimensions, ThumbnailError, ThumbnailMeta, ThumbsGenerator, THUMBS_QUALITY,
};

/// Resize engine backed by the `image` crate.
///
/// Decoding, resizing, encoding and writing all block, so each request runs
/// on Tokio's blocking pool.
#[derive(Clone)]
pub struct ImageThumbsGenerator {
    metrics: Arc<dyn MetricsSink>,
}

impl ImageThumbsGenerator {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }

    fn generate_blocking(
        &self,
        cancel: &CancellationToken,
        meta: &ThumbnailMeta,
    ) -> Result<(), ThumbnailError> {
        let original_path = meta.original_path();
        let input = std::fs::read(&original_path)
            .map_err(|e| ThumbnailError::io(&original_path, e))?;

        let original = decode(&meta.original_rel_path, &input)?;
        let (orig_width, orig_height) = original.dimensions();

        for &width in &meta.target_widths {
            if cancel.is_cancelled() {
                warn!(
                    file_path = %meta.original_rel_path.display(),
                    "Cancelled during thumbnails generation"
                );
                return Err(ThumbnailError::Cancelled);
            }

            let (width, height) = thumbnail_dimensions(orig_width, orig_height, width)?;
            let encoded = resize_and_encode(&original, width, height)
                .map_err(|source| ThumbnailError::Encode {
                    path: meta.original_rel_path.clone(),
                    width,
                    source,
                })?;

            let thumb_path = meta.thumbnail_path(width);
            std::fs::write(&thumb_path, &encoded)
                .map_err(|e| ThumbnailError::io(&thumb_path, e))?;

            debug!(
                path = %thumb_path.display(),
                width = width,
                height = height,
                size_bytes = encoded.len(),
                "Thumbnail written"
            );

            self.metrics.increment(
                Counter::ThumbCreated,
                &[
                    ("filePath", meta.original_rel_path.display().to_string()),
                    ("origSize", input.len().to_string()),
                    ("origWidth", orig_width.to_string()),
                    ("thumbSize", encoded.len().to_string()),
                    ("thumbWidth", width.to_string()),
                ],
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ThumbsGenerator for ImageThumbsGenerator {
    #[instrument(skip(self, cancel, meta), fields(file_path = %meta.original_rel_path.display()))]
    async fn generate(
        &self,
        cancel: &CancellationToken,
        meta: ThumbnailMeta,
    ) -> Result<(), ThumbnailError> {
        debug!(widths = ?meta.target_widths, "Generating thumbnails");

        let generator = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || generator.generate_blocking(&cancel, &meta))
            .await
            .map_err(|e| ThumbnailError::Worker(e.to_string()))?
    }
}

/// Decode `input` and rotate it upright
fn decode(rel_path: &Path, input: &[u8]) -> Result<DynamicImage, ThumbnailError> {
    let decode_error = |source: image::ImageError| ThumbnailError::Decode {
        path: rel_path.to_path_buf(),
        source,
    };

    let mut decoder = ImageReader::new(Cursor::new(input))
        .with_guessed_format()
        .map_err(|e| decode_error(image::ImageError::IoError(e)))?
        .into_decoder()
        .map_err(decode_error)?;
    let orientation = decoder.orientation().map_err(decode_error)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
    image.apply_orientation(orientation);

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ThumbnailError::InvalidDimensions { width, height });
    }

    Ok(image)
}

/// Scale into a `width`x`height` box and encode as JPEG.
///
/// The box already has the original aspect ratio, so the exact resize only
/// absorbs rounding and never distorts.
fn resize_and_encode(
    original: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, image::ImageError> {
    let resized = original.resize_exact(width, height, FilterType::Lanczos3);
    // JPEG has no alpha channel
    let rgb = resized.to_rgb8();

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, THUMBS_QUALITY).encode_image(&rgb)?;

    Ok(encoded)
}
