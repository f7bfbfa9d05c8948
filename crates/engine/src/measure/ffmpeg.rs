//! FFmpeg-based quality metrics
//!
//! Runs ffmpeg's `psnr`, `ssim` and `libvmaf` filters with the encoded file as
//! the distorted input and the source as the reference, then reads the summary
//! score the filter prints to stderr.

use super::{Measurement, MetricError, QualityMeter};
use crate::config::Metric;
use crate::encode::EncodedArtifact;
use crate::probe::{derived_bitrate_kbps, probe_file, SourceInfo};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// PSNR reported for identical frames ("inf") is capped at this value
pub const PSNR_INFINITE_DB: f64 = 100.0;

/// Filter graph comparing input 0 (distorted) against input 1 (reference)
fn filter_graph(metric: Metric) -> String {
    let compare = match metric {
        Metric::Psnr => "psnr",
        Metric::Ssim => "ssim",
        Metric::Vmaf => "libvmaf",
    };
    format!(
        "[0:v]setpts=PTS-STARTPTS[dist];[1:v]setpts=PTS-STARTPTS[ref];[dist][ref]{}",
        compare
    )
}

/// Build an ffmpeg command computing one metric for an encoded file
pub fn build_metric_command(source: &Path, encoded: &Path, metric: Metric) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-nostdin");
    cmd.arg("-i").arg(encoded);
    cmd.arg("-i").arg(source);
    cmd.arg("-lavfi").arg(filter_graph(metric));
    cmd.arg("-f").arg("null").arg("-");
    cmd
}

/// Extract a metric's summary score from ffmpeg stderr
///
/// - PSNR: `PSNR y:.. u:.. v:.. average:39.21 min:.. max:..` (`inf` maps to 100 dB)
/// - SSIM: `SSIM Y:.. U:.. V:.. All:0.9567 (13.6)`
/// - VMAF: `VMAF score: 95.12`
pub fn parse_metric_output(stderr: &str, metric: Metric) -> Option<f64> {
    let (line_marker, key) = match metric {
        Metric::Psnr => ("PSNR ", "average:"),
        Metric::Ssim => ("SSIM ", "All:"),
        Metric::Vmaf => ("VMAF score", "VMAF score:"),
    };

    let line = stderr.lines().rev().find(|l| l.contains(line_marker))?;
    let rest = &line[line.find(key)? + key.len()..];
    let token = rest.split_whitespace().next()?;

    if metric == Metric::Psnr && token.eq_ignore_ascii_case("inf") {
        return Some(PSNR_INFINITE_DB);
    }
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Quality meter backed by the `ffmpeg` and `ffprobe` binaries on PATH
#[derive(Debug, Clone, Default)]
pub struct FfmpegMeter;

impl FfmpegMeter {
    pub fn new() -> Self {
        Self
    }

    async fn compute(
        &self,
        source: &Path,
        encoded: &Path,
        metric: Metric,
    ) -> Result<f64, MetricError> {
        let mut cmd = tokio::process::Command::from(build_metric_command(source, encoded, metric));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let detail = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("(no output)")
                .to_string();
            return Err(MetricError::ToolFailed { metric, detail });
        }

        parse_metric_output(&stderr, metric).ok_or(MetricError::Unparsable(metric))
    }

    async fn bitrate_kbps(&self, encoded: &EncodedArtifact) -> Result<f64, MetricError> {
        let info = probe_file(&encoded.path)
            .await
            .map_err(|e| MetricError::Bitrate(e.to_string()))?;

        info.bitrate_kbps
            .or_else(|| derived_bitrate_kbps(encoded.size_bytes, info.duration_secs))
            .ok_or_else(|| {
                MetricError::Bitrate(format!(
                    "no bit_rate or duration reported for {}",
                    encoded.path.display()
                ))
            })
    }
}

#[async_trait]
impl QualityMeter for FfmpegMeter {
    async fn measure(
        &self,
        source: &Path,
        encoded: &EncodedArtifact,
        metrics: &BTreeSet<Metric>,
    ) -> Result<Measurement, MetricError> {
        let bitrate_kbps = self.bitrate_kbps(encoded).await?;

        let mut scores = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for &metric in metrics {
            match self.compute(source, &encoded.path, metric).await {
                Ok(score) => {
                    debug!(%metric, score, encoded = %encoded.path.display(), "metric computed");
                    scores.insert(metric, score);
                }
                Err(e) => {
                    warn!(%metric, encoded = %encoded.path.display(), error = %e, "metric failed");
                    failures.insert(metric, e.to_string());
                }
            }
        }

        if scores.is_empty() && !metrics.is_empty() {
            let reasons: Vec<String> = failures.into_values().collect();
            return Err(MetricError::NoMetrics(reasons.join("; ")));
        }

        Ok(Measurement {
            metrics: scores,
            bitrate_kbps,
            metric_failures: failures,
        })
    }

    async fn probe_source(&self, source: &Path) -> Option<SourceInfo> {
        match probe_file(source).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(source = %source.display(), error = %e, "source probe failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_psnr_summary() {
        let stderr = "frame=  250 fps=0.0 q=-0.0 Lsize=N/A\n\
            [Parsed_psnr_4 @ 0x55d] PSNR y:38.914 u:43.101 v:44.020 average:39.875 min:35.210 max:46.002\n";
        assert_eq!(parse_metric_output(stderr, Metric::Psnr), Some(39.875));
    }

    #[test]
    fn test_parse_psnr_infinite() {
        let stderr = "[Parsed_psnr_4 @ 0x55d] PSNR y:inf u:inf v:inf average:inf min:inf max:inf\n";
        assert_eq!(parse_metric_output(stderr, Metric::Psnr), Some(PSNR_INFINITE_DB));
    }

    #[test]
    fn test_parse_ssim_summary() {
        let stderr = "[Parsed_ssim_4 @ 0x1] SSIM Y:0.961234 (14.13) U:0.97 (15.2) V:0.98 (16.9) All:0.967121 (14.82)\n";
        assert_eq!(parse_metric_output(stderr, Metric::Ssim), Some(0.967121));
    }

    #[test]
    fn test_parse_vmaf_summary() {
        let stderr = "[libvmaf @ 0x7f] VMAF score: 93.482117\n";
        assert_eq!(parse_metric_output(stderr, Metric::Vmaf), Some(93.482117));
    }

    #[test]
    fn test_parse_missing_score() {
        assert_eq!(parse_metric_output("Conversion failed!", Metric::Psnr), None);
        assert_eq!(parse_metric_output("SSIM Y:0.9 (10.0)", Metric::Ssim), None);
        assert_eq!(parse_metric_output("VMAF score: nan", Metric::Vmaf), None);
    }

    #[test]
    fn test_metric_command_orders_distorted_first() {
        let cmd = build_metric_command(Path::new("src.mkv"), Path::new("enc.mp4"), Metric::Ssim);
        let args: Vec<String> = cmd
            .get_args()
            .filter_map(|a| a.to_str().map(String::from))
            .collect();

        let inputs: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "-i")
            .map(|w| &w[1])
            .collect();
        assert_eq!(inputs, vec!["enc.mp4", "src.mkv"]);
        assert!(args.iter().any(|a| a.ends_with("[dist][ref]ssim")));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_vmaf_uses_libvmaf_filter() {
        assert!(filter_graph(Metric::Vmaf).ends_with("libvmaf"));
        assert!(filter_graph(Metric::Psnr).ends_with("psnr"));
    }

    proptest! {
        #[test]
        fn prop_psnr_average_round_trips(avg in 10.0f64..80.0, y in 10.0f64..80.0) {
            let stderr = format!(
                "[Parsed_psnr_0 @ 0xabc] PSNR y:{:.6} u:40.0 v:41.0 average:{:.6} min:30.0 max:50.0",
                y, avg
            );
            let parsed = parse_metric_output(&stderr, Metric::Psnr).unwrap();
            prop_assert!((parsed - avg).abs() < 1e-5);
        }

        #[test]
        fn prop_last_summary_line_wins(first in 0.0f64..100.0, last in 0.0f64..100.0) {
            let stderr = format!("VMAF score: {:.4}\nsome progress\nVMAF score: {:.4}\n", first, last);
            let parsed = parse_metric_output(&stderr, Metric::Vmaf).unwrap();
            prop_assert!((parsed - last).abs() < 1e-3);
        }
    }
}
