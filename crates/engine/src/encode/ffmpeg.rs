//! FFmpeg encoder for the benchmark sweep
//!
//! Builds and executes one `ffmpeg` encode per (codec, quality) pair, driven
//! by the codec catalog entry (encoder name, quality flag, container).

use super::{EncodeError, EncodedArtifact, Encoder, PartialOutput};
use crate::config::CodecSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use uuid::Uuid;

/// Parameters for a single ffmpeg encode
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Path to the source video file
    pub input_path: PathBuf,
    /// Path for the encoded output file
    pub output_path: PathBuf,
    /// FFmpeg encoder name (e.g., "libx264")
    pub encoder: String,
    /// Flag carrying the quality value (e.g., "-crf")
    pub quality_param: String,
    /// Quality setting value
    pub quality: u32,
    /// Threads handed to the encoder
    pub threads: u32,
}

/// Build an ffmpeg command for one benchmark encode
///
/// Creates a Command configured with:
/// - Overwrite enabled and banner suppressed
/// - Input and output paths
/// - Video encoder and quality flag from the codec catalog
/// - Thread count from the concurrency plan
/// - Audio dropped, since only video quality is measured
pub fn build_encode_command(params: &EncodeParams) -> Command {
    let mut cmd = Command::new("ffmpeg");

    cmd.arg("-hide_banner").arg("-nostdin").arg("-y");
    cmd.arg("-i").arg(&params.input_path);
    cmd.arg("-c:v").arg(&params.encoder);
    cmd.arg(&params.quality_param)
        .arg(params.quality.to_string());
    cmd.arg("-threads").arg(params.threads.to_string());
    cmd.arg("-an");
    cmd.arg(&params.output_path);

    cmd
}

/// Output location for one encode: `<work_dir>/<stem>_<codec>_q<quality>_<tag><ext>`
///
/// The random tag keeps concurrent jobs on the same source from colliding.
pub fn output_path_for(
    work_dir: &Path,
    source: &Path,
    codec_id: &str,
    extension: &str,
    quality: u32,
) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    let tag = Uuid::new_v4().simple().to_string();
    work_dir.join(format!(
        "{}_{}_q{}_{}{}",
        stem,
        codec_id,
        quality,
        &tag[..8],
        extension
    ))
}

/// Encoder backed by the `ffmpeg` binary on PATH
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    work_dir: PathBuf,
    threads: u32,
}

impl FfmpegEncoder {
    pub fn new(work_dir: PathBuf, threads: u32) -> Self {
        Self {
            work_dir,
            threads: threads.max(1),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        source: &Path,
        codec_id: &str,
        codec: &CodecSpec,
        quality: u32,
    ) -> Result<EncodedArtifact, EncodeError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let params = EncodeParams {
            input_path: source.to_path_buf(),
            output_path: output_path_for(
                &self.work_dir,
                source,
                codec_id,
                &codec.extension,
                quality,
            ),
            encoder: codec.encoder.clone(),
            quality_param: codec.quality_param.clone(),
            quality,
            threads: self.threads,
        };

        debug!(
            codec = codec_id,
            quality,
            output = %params.output_path.display(),
            "starting ffmpeg encode"
        );

        // A dropped future (timeout, job abort) kills the encoder and the
        // guard removes whatever it had written
        let output_guard = PartialOutput::new(params.output_path.clone());
        let mut cmd = tokio::process::Command::from(build_encode_command(&params));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await?;

        if !output.status.success() {
            return match output.status.code() {
                Some(code) => Err(EncodeError::Failed {
                    code,
                    detail: last_line(&String::from_utf8_lossy(&output.stderr)),
                }),
                None => Err(EncodeError::Terminated),
            };
        }

        let size_bytes = match tokio::fs::metadata(output_guard.path()).await {
            Ok(metadata) => metadata.len(),
            Err(_) => return Err(EncodeError::MissingOutput(params.output_path)),
        };
        if size_bytes == 0 {
            return Err(EncodeError::MissingOutput(params.output_path));
        }

        Ok(EncodedArtifact {
            path: output_guard.keep(),
            size_bytes,
        })
    }
}

/// Last non-empty line of tool output, which is where ffmpeg puts the fatal error
fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("(no output)")
        .to_string()
}
