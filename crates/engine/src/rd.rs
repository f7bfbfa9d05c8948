//! Rate-distortion data produced by a codec sweep

use crate::config::Metric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Minimum number of points an RD curve needs for a BD-Rate fit
pub const MIN_BD_RATE_POINTS: usize = 4;

/// One rate-distortion sample: a quality setting and what it produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RdPoint {
    pub quality_setting: u32,
    pub bitrate_kbps: f64,
    /// Only metrics that were requested and computed successfully
    pub metrics: BTreeMap<Metric, f64>,
    pub encode_time_seconds: f64,
    pub file_size_bytes: u64,
    /// Set only when encoded artifacts are retained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_path: Option<PathBuf>,
    /// Requested metrics missing from `metrics`, with the reason
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metric_errors: BTreeMap<Metric, String>,
}

impl RdPoint {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).copied()
    }
}

/// Which collaborator a dropped sample failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStage {
    Encode,
    Measure,
    Cancelled,
    /// The sample task panicked or was aborted
    Aborted,
}

/// Why one quality setting is missing from a codec result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleDiagnostic {
    pub quality_setting: u32,
    pub stage: SampleStage,
    pub message: String,
}

/// All RD points a sweep produced for one codec
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecResult {
    pub codec_id: String,
    /// Display name from the codec catalog
    pub name: String,
    /// Ordered like the requested quality settings, failures omitted
    pub points: Vec<RdPoint>,
    pub diagnostics: Vec<SampleDiagnostic>,
    pub insufficient_for_bd_rate: bool,
}

impl CodecResult {
    /// Assemble a result, deriving the BD-Rate sufficiency flag
    pub fn new(
        codec_id: impl Into<String>,
        name: impl Into<String>,
        points: Vec<RdPoint>,
        diagnostics: Vec<SampleDiagnostic>,
    ) -> Self {
        let insufficient_for_bd_rate = points.len() < MIN_BD_RATE_POINTS;
        Self {
            codec_id: codec_id.into(),
            name: name.into(),
            points,
            diagnostics,
            insufficient_for_bd_rate,
        }
    }

    /// Quality settings of the surviving points, in result order
    pub fn qualities(&self) -> Vec<u32> {
        self.points.iter().map(|p| p.quality_setting).collect()
    }
}

#[cfg(test)]
pub(crate) fn point(quality: u32, bitrate_kbps: f64, metrics: &[(Metric, f64)]) -> RdPoint {
    RdPoint {
        quality_setting: quality,
        bitrate_kbps,
        metrics: metrics.iter().copied().collect(),
        encode_time_seconds: 0.0,
        file_size_bytes: 0,
        encoded_path: None,
        metric_errors: BTreeMap::new(),
    }
}
