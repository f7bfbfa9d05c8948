//! Startup checks for the benchmark engine
//!
//! Provides preflight checks to verify system requirements before jobs run:
//! - FFmpeg and ffprobe availability
//! - FFmpeg version detection
//! - Encoders named by the codec catalog are compiled into FFmpeg

use crate::config::Config;
use std::collections::BTreeSet;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {detail}")]
    ToolUnavailable { tool: &'static str, detail: String },

    #[error("FFmpeg version could not be determined: {0}")]
    FfmpegVersion(String),
}

/// What the preflight checks found
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub ffmpeg_major_version: u32,
    /// Catalog codec ids whose encoder FFmpeg does not list
    pub missing_encoders: Vec<String>,
}

/// Run `<tool> <arg>` and return its stdout
fn run_tool(tool: &'static str, arg: &str) -> Result<String, StartupError> {
    let output = Command::new(tool).arg(arg).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool,
            detail: format!("{} {} failed; is it installed and in PATH? Error: {}", tool, arg, e),
        }
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool,
            detail: format!("{} {} exited with {}", tool, arg, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffprobe runs
pub fn check_ffprobe_available() -> Result<(), StartupError> {
    run_tool("ffprobe", "-version").map(|_| ())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshots ("ffmpeg version N-112233-g...") carry no release number
/// and yield None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split("ffmpeg version").nth(1)?.split_whitespace().next()?;

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that ffmpeg runs and report its major version
pub fn check_ffmpeg_version() -> Result<u32, StartupError> {
    let version_output = run_tool("ffmpeg", "-version")?;

    parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "could not parse version from: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Encoder names from `ffmpeg -encoders` output
///
/// Entries look like ` V....D libx264    libx264 H.264 / AVC ...`; the legend
/// above the `------` separator is skipped.
pub fn parse_encoder_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

/// Catalog codec ids whose encoder is not in `available`
pub fn missing_encoders(cfg: &Config, available: &BTreeSet<String>) -> Vec<String> {
    cfg.codecs
        .iter()
        .filter(|(_, spec)| !available.contains(&spec.encoder))
        .map(|(codec_id, _)| codec_id.clone())
        .collect()
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg availability and version
/// 2. ffprobe availability
/// 3. Catalog encoders present in FFmpeg (missing ones are only logged)
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    let ffmpeg_major_version = check_ffmpeg_version()?;
    info!(version = ffmpeg_major_version, "ffmpeg detected");

    check_ffprobe_available()?;

    let available = parse_encoder_list(&run_tool("ffmpeg", "-encoders")?);
    let missing = missing_encoders(cfg, &available);
    for codec_id in &missing {
        warn!(
            codec = %codec_id,
            encoder = %cfg.codecs[codec_id].encoder,
            "encoder not available in ffmpeg; jobs using this codec will fail"
        );
    }

    Ok(StartupReport {
        ffmpeg_major_version,
        missing_encoders: missing,
    })
}
