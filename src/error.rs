//! Error types for rkimage

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for rkimage operations
pub type Result<T> = std::result::Result<T, RkImageError>;

/// Errors returned by the image codecs
#[derive(Debug, Error)]
pub enum RkImageError {
    /// I/O error during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is missing a required entry or is otherwise malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more referenced input files do not exist.
    ///
    /// All missing paths are collected before the operation aborts, so the
    /// caller sees the complete list rather than the first failure.
    #[error("input files not found: {}", format_paths(.0))]
    InputNotFound(Vec<PathBuf>),

    /// Payload exceeds a fixed format capacity
    #[error("payload too large: {size} bytes exceeds limit of {max} bytes")]
    SizeLimit { size: u64, max: u64 },

    /// A file being unpacked has a bad magic/tag or violates the format
    #[error("invalid image format: {0}")]
    Format(String),
}

impl RkImageError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a format error for a magic/tag mismatch
    pub fn invalid_magic(expected: u32, actual: u32) -> Self {
        Self::Format(format!(
            "invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}"
        ))
    }

    /// Create a format error for a header shorter than its fixed size
    pub fn truncated(what: &str, len: usize, need: usize) -> Self {
        Self::Format(format!(
            "truncated {what}: {len} bytes (expected at least {need})"
        ))
    }

    /// Create a size-limit error
    pub fn too_large(size: u64, max: u64) -> Self {
        Self::SizeLimit { size, max }
    }
}

/// Check that every referenced path exists, collecting all missing ones.
pub fn check_inputs_exist<'a, I>(paths: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Path>,
{
    let missing: Vec<PathBuf> = paths
        .into_iter()
        .filter(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RkImageError::InputNotFound(missing))
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
