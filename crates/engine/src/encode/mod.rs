//! Encoder collaborator interface and implementations

pub mod ffmpeg;

pub use ffmpeg::{build_encode_command, output_path_for, FfmpegEncoder};

use crate::config::CodecSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder process exited with non-zero status
    #[error("encoder exited with code {code}: {detail}")]
    Failed { code: i32, detail: String },

    /// Encoder process was terminated by signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// Encode did not finish within the configured timeout
    #[error("encode timed out after {0:?}")]
    Timeout(Duration),

    /// Encoder reported success but produced no usable output
    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encoded file produced for one (codec, quality) pair
///
/// The artifact is owned by the sampler call that requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Output file of an encode that has not finished yet
///
/// Dropping it removes the file, which covers failed encodes as well as
/// encode futures dropped by a timeout or an aborted job.
/// [`PartialOutput::keep`] hands the path over once the encode succeeded.
#[derive(Debug)]
pub struct PartialOutput {
    path: Option<PathBuf>,
}

impl PartialOutput {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Disarm the guard and return the finished output path
    pub fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed partial encode output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial encode output"),
            }
        }
    }
}

/// Encodes a source video with one codec at one quality setting
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        source: &Path,
        codec_id: &str,
        codec: &CodecSpec,
        quality: u32,
    ) -> Result<EncodedArtifact, EncodeError>;
}
