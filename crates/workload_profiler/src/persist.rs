//! Persists invocation records to per-invocation JSON files.
//!
//! The persister writes to a primary directory and falls back to a fixed
//! sibling directory when the primary write fails. Losing a completed
//! measurement silently is worse than crashing, so only a failure of *both*
//! writes surfaces an error.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::metrics::InvocationMetrics;

/// Sibling directory used when the primary write location fails.
pub const FALLBACK_DIR_NAME: &str = "profiling_backup";

pub struct ResultPersister {
    primary_dir: PathBuf,
    fallback_dir: PathBuf,
}

impl ResultPersister {
    /// Persister with the default fallback: a `profiling_backup` directory
    /// next to the primary one.
    pub fn new(primary_dir: impl AsRef<Path>) -> Self {
        let primary_dir = primary_dir.as_ref().to_path_buf();
        let fallback_dir = primary_dir
            .parent()
            .map(|parent| parent.join(FALLBACK_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DIR_NAME));
        Self {
            primary_dir,
            fallback_dir,
        }
    }

    pub fn with_fallback(primary_dir: impl AsRef<Path>, fallback_dir: impl AsRef<Path>) -> Self {
        Self {
            primary_dir: primary_dir.as_ref().to_path_buf(),
            fallback_dir: fallback_dir.as_ref().to_path_buf(),
        }
    }

    pub fn primary_dir(&self) -> &Path {
        &self.primary_dir
    }

    /// Write one record, returning the path it landed at. The filename is
    /// derived from the invocation identity, so re-running an identity
    /// overwrites its previous record.
    pub fn persist(&self, metrics: &InvocationMetrics) -> Result<PathBuf> {
        let filename = metrics.filename();
        let json =
            serde_json::to_string_pretty(metrics).context("serializing invocation metrics")?;

        match write_json(&self.primary_dir, &filename, &json) {
            Ok(path) => {
                log::debug!("saved result to {}", path.display());
                Ok(path)
            }
            Err(primary_err) => {
                log::error!(
                    "failed to save result to {}: {primary_err:#}",
                    self.primary_dir.display()
                );
                let path = write_json(&self.fallback_dir, &filename, &json).with_context(|| {
                    format!(
                        "fallback write to {} also failed",
                        self.fallback_dir.display()
                    )
                })?;
                log::warn!("saved result to fallback location {}", path.display());
                Ok(path)
            }
        }
    }
}

fn write_json(dir: &Path, filename: &str, json: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(filename);
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
