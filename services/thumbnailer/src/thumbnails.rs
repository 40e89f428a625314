//! Per-request orchestration: stale thumbnail cleanup, metadata preparation
//! and delegation to the resize engine.
//!
//! The service holds only configuration and the engine. Every call derives
//! its own paths and [`ThumbnailMeta`] from the request, so both consumption
//! loops share one instance without locking.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ThumbnailsConfig;
use crate::thumbs_gen::{file_stem, is_thumbnail_of, ThumbnailError, ThumbnailMeta, ThumbsGenerator};

pub struct ThumbnailsService {
    config: ThumbnailsConfig,
    generator: Arc<dyn ThumbsGenerator>,
}

impl ThumbnailsService {
    pub fn new(config: ThumbnailsConfig, generator: Arc<dyn ThumbsGenerator>) -> Self {
        Self { config, generator }
    }

    /// Replace every thumbnail of `rel_path` with a fresh set.
    #[instrument(skip(self, cancel))]
    pub async fn process_generate(
        &self,
        cancel: &CancellationToken,
        rel_path: &str,
    ) -> Result<(), ThumbnailError> {
        let rel_path = validate_rel_path(rel_path)?;

        self.cleanup_existing(cancel, &rel_path).await?;
        let meta = self.prepare_thumbnail_meta(rel_path).await?;
        self.generator.generate(cancel, meta).await?;

        info!("Thumbnails generated");
        Ok(())
    }

    /// Remove every thumbnail of `rel_path`.
    #[instrument(skip(self, cancel))]
    pub async fn process_delete(
        &self,
        cancel: &CancellationToken,
        rel_path: &str,
    ) -> Result<(), ThumbnailError> {
        let rel_path = validate_rel_path(rel_path)?;
        let removed = self.cleanup_existing(cancel, &rel_path).await?;

        info!(removed = removed, "Thumbnails deleted");
        Ok(())
    }

    fn thumbs_dir(&self, rel_path: &Path) -> PathBuf {
        match rel_path.parent() {
            Some(parent) => self.config.thumbnails_root.join(parent),
            None => self.config.thumbnails_root.clone(),
        }
    }

    /// Delete existing thumbnails of `rel_path`, returning how many were removed.
    ///
    /// Stops at the first failed removal; files removed before it stay removed.
    async fn cleanup_existing(
        &self,
        cancel: &CancellationToken,
        rel_path: &Path,
    ) -> Result<usize, ThumbnailError> {
        let thumbs_dir = self.thumbs_dir(rel_path);
        if !tokio::fs::try_exists(&thumbs_dir)
            .await
            .map_err(|e| ThumbnailError::io(&thumbs_dir, e))?
        {
            return Ok(0);
        }

        let stem = file_stem(rel_path);
        let mut matches = Vec::new();
        let mut entries = tokio::fs::read_dir(&thumbs_dir)
            .await
            .map_err(|e| ThumbnailError::io(&thumbs_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ThumbnailError::io(&thumbs_dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if is_thumbnail_of(name, &stem) {
                    matches.push(entry.path());
                }
            }
        }
        matches.sort();

        for path in &matches {
            if cancel.is_cancelled() {
                warn!(path = %path.display(), "Cancelled during thumbnail cleanup");
                return Err(ThumbnailError::Cancelled);
            }

            debug!(path = %path.display(), "Removing existing thumbnail");
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| ThumbnailError::io(path, e))?;
        }

        Ok(matches.len())
    }

    async fn prepare_thumbnail_meta(&self, rel_path: PathBuf) -> Result<ThumbnailMeta, ThumbnailError> {
        let output_dir = self.thumbs_dir(&rel_path);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| ThumbnailError::io(&output_dir, e))?;

        Ok(ThumbnailMeta {
            originals_root_dir: self.config.originals_root.clone(),
            original_rel_path: rel_path,
            output_dir,
            target_widths: self.config.widths_px.clone(),
        })
    }
}

/// Accept only plain relative paths that stay below the roots
fn validate_rel_path(rel_path: &str) -> Result<PathBuf, ThumbnailError> {
    let invalid = |reason: &str| ThumbnailError::InvalidPath {
        path: rel_path.to_string(),
        reason: reason.to_string(),
    };

    let path = Path::new(rel_path);
    if rel_path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.file_name().is_none() {
        return Err(invalid("path has no file name"));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path escapes the originals root")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"))
            }
        }
    }

    Ok(path.to_path_buf())
}
