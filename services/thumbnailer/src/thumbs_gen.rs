//! Resize engine contract and the deterministic thumbnail naming scheme.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Extension of every generated thumbnail
pub const THUMBS_EXTENSION: &str = ".jpg";

/// JPEG quality of every generated thumbnail
pub const THUMBS_QUALITY: u8 = 60;

/// Largest side a baseline JPEG can carry
pub const MAX_THUMB_SIDE: u32 = 65_535;

/// Upper bound on the pixel count of a single thumbnail
pub const MAX_THUMB_PIXELS: u64 = 50_000_000;

/// Errors that abort a thumbnail request
#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("Invalid original file path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid original image dimensions: width={width}, height={height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Thumbnail of {width}x{height} exceeds the size limit")]
    TooLarge { width: u32, height: u64 },

    #[error("Failed to encode {width}px thumbnail for {path}: {source}")]
    Encode {
        path: PathBuf,
        width: u32,
        #[source]
        source: image::ImageError,
    },

    #[error("Thumbnail processing cancelled")]
    Cancelled,

    #[error("Thumbnail worker failed: {0}")]
    Worker(String),
}

impl ThumbnailError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ThumbnailError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Everything the engine needs to produce the thumbnails of one original.
///
/// Built fresh for each generate request and moved into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailMeta {
    /// Root directory of all originals
    pub originals_root_dir: PathBuf,
    /// Original file path, relative to `originals_root_dir`
    pub original_rel_path: PathBuf,
    /// Absolute directory the thumbnails are written to
    pub output_dir: PathBuf,
    /// Widths to generate, in order
    pub target_widths: Vec<u32>,
}

impl ThumbnailMeta {
    pub fn original_path(&self) -> PathBuf {
        self.originals_root_dir.join(&self.original_rel_path)
    }

    /// Output path of the thumbnail at `width`
    pub fn thumbnail_path(&self, width: u32) -> PathBuf {
        self.output_dir
            .join(thumbnail_file_name(&file_stem(&self.original_rel_path), width))
    }
}

/// Decodes, resizes and persists thumbnails of one original
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThumbsGenerator: Send + Sync {
    /// Generate one thumbnail per width in `meta.target_widths`.
    ///
    /// Stops at the first failing width; thumbnails already written stay on disk.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        meta: ThumbnailMeta,
    ) -> Result<(), ThumbnailError>;
}

/// File name of an original without its extension
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<stem>_<width>px.jpg`
pub fn thumbnail_file_name(stem: &str, width: u32) -> String {
    format!("{}_{}px{}", stem, width, THUMBS_EXTENSION)
}

/// Whether `file_name` is a thumbnail of the original with `stem`.
///
/// The width segment must be all digits so that `cat_old_100px.jpg` is not
/// taken for a thumbnail of `cat`.
pub fn is_thumbnail_of(file_name: &str, stem: &str) -> bool {
    let Some(rest) = file_name.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('_') else {
        return false;
    };
    let Some(width) = rest
        .strip_suffix(THUMBS_EXTENSION)
        .and_then(|r| r.strip_suffix("px"))
    else {
        return false;
    };

    !width.is_empty() && width.bytes().all(|b| b.is_ascii_digit())
}

/// Thumbnail height preserving the original aspect ratio, rounded half up.
///
/// Never less than one pixel. `orig_width` must be non-zero.
pub fn target_height(orig_width: u32, orig_height: u32, target_width: u32) -> u64 {
    let scaled = orig_height as u64 * target_width as u64;
    let rounded = (2 * scaled + orig_width as u64) / (2 * orig_width as u64);
    rounded.max(1)
}

/// Size of the thumbnail at `target_width`, rejecting sizes the encoder
/// cannot carry or that would not fit the pixel budget
pub fn thumbnail_dimensions(
    orig_width: u32,
    orig_height: u32,
    target_width: u32,
) -> Result<(u32, u32), ThumbnailError> {
    let height = target_height(orig_width, orig_height, target_width);
    let too_large = ThumbnailError::TooLarge {
        width: target_width,
        height,
    };

    if target_width > MAX_THUMB_SIDE || height > MAX_THUMB_SIDE as u64 {
        return Err(too_large);
    }
    if target_width as u64 * height > MAX_THUMB_PIXELS {
        return Err(too_large);
    }

    Ok((target_width, height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_file_name() {
        assert_eq!(thumbnail_file_name("cat", 100), "cat_100px.jpg");
        assert_eq!(file_stem(Path::new("photos/cat.png")), "cat");
        assert_eq!(file_stem(Path::new("photos/archive.tar.gz")), "archive.tar");
    }

    #[test]
    fn test_thumbnail_path() {
        let meta = ThumbnailMeta {
            originals_root_dir: PathBuf::from("/originals"),
            original_rel_path: PathBuf::from("photos/cat.png"),
            output_dir: PathBuf::from("/thumbs/photos"),
            target_widths: vec![100],
        };

        assert_eq!(meta.original_path(), PathBuf::from("/originals/photos/cat.png"));
        assert_eq!(
            meta.thumbnail_path(100),
            PathBuf::from("/thumbs/photos/cat_100px.jpg")
        );
    }

    #[test]
    fn test_is_thumbnail_of() {
        assert!(is_thumbnail_of("cat_100px.jpg", "cat"));
        assert!(is_thumbnail_of("cat_2048px.jpg", "cat"));

        assert!(!is_thumbnail_of("cat.png", "cat"));
        assert!(!is_thumbnail_of("cat_px.jpg", "cat"));
        assert!(!is_thumbnail_of("cat_100px.png", "cat"));
        assert!(!is_thumbnail_of("cat_old_100px.jpg", "cat"));
        assert!(!is_thumbnail_of("dog_100px.jpg", "cat"));
        assert!(is_thumbnail_of("cat_old_100px.jpg", "cat_old"));
    }

    #[test]
    fn test_target_height() {
        assert_eq!(target_height(1000, 500, 100), 50);
        assert_eq!(target_height(1000, 500, 200), 100);
        assert_eq!(target_height(3, 2, 2), 1);
        assert_eq!(target_height(4, 3, 3), 2);
        assert_eq!(target_height(1000, 1, 10), 1);
        assert_eq!(target_height(1, 5_000_000, 1024), 5_120_000_000);
    }

    #[test]
    fn test_thumbnail_dimensions() {
        assert_eq!(thumbnail_dimensions(1000, 500, 100).unwrap(), (100, 50));
        assert_eq!(thumbnail_dimensions(1, 65_535, 1).unwrap(), (1, 65_535));

        assert!(matches!(
            thumbnail_dimensions(1, 5_000_000, 1024),
            Err(ThumbnailError::TooLarge { width: 1024, height: 5_120_000_000 })
        ));
        assert!(matches!(
            thumbnail_dimensions(1, 65_536, 1),
            Err(ThumbnailError::TooLarge { .. })
        ));
        assert!(matches!(
            thumbnail_dimensions(100, 100, 70_000),
            Err(ThumbnailError::TooLarge { .. })
        ));
        // 10000 x 10000 fits both sides but not the pixel budget
        assert!(matches!(
            thumbnail_dimensions(1, 1, 10_000),
            Err(ThumbnailError::TooLarge { .. })
        ));
    }
}
