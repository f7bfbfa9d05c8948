//! Media probing with ffprobe
//!
//! Collects container and first-video-stream metadata for a source video and
//! the achieved bitrate of encoded artifacts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First video stream of a probed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStreamInfo {
    /// Codec name (e.g., "hevc", "h264").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Average frame rate, when ffprobe reports a usable fraction.
    pub frame_rate: Option<f64>,
}

/// Source video description attached to job results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    pub duration_secs: f64,
    pub size_bytes: u64,
    /// Overall container bitrate in kbps.
    pub bitrate_kbps: Option<f64>,
    pub video: Option<VideoStreamInfo>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probes a media file with ffprobe.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
/// and parses the JSON output.
pub async fn probe_file(path: &Path) -> Result<SourceInfo, ProbeError> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a SourceInfo.
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| VideoStreamInfo {
            codec_name: s.codec_name.unwrap_or_default(),
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            frame_rate: s.avg_frame_rate.as_deref().and_then(parse_frame_rate),
        });

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let bitrate_kbps = format
        .bit_rate
        .as_ref()
        .and_then(|b| b.parse::<f64>().ok())
        .map(|bps| bps / 1000.0)
        .or_else(|| derived_bitrate_kbps(size_bytes, duration_secs));

    Ok(SourceInfo {
        duration_secs,
        size_bytes,
        bitrate_kbps,
        video,
    })
}

/// Bitrate from file size and duration, for containers without `bit_rate`
pub fn derived_bitrate_kbps(size_bytes: u64, duration_secs: f64) -> Option<f64> {
    if size_bytes > 0 && duration_secs > 0.0 {
        Some(size_bytes as f64 * 8.0 / duration_secs / 1000.0)
    } else {
        None
    }
}

/// Parses an ffprobe rate fraction such as "30000/1001".
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}
