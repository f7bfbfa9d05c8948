//! Quality-metric collaborator interface and implementations

pub mod ffmpeg;

pub use ffmpeg::{build_metric_command, parse_metric_output, FfmpegMeter};

use crate::config::Metric;
use crate::encode::EncodedArtifact;
use crate::probe::SourceInfo;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

/// Error type for metric computation
#[derive(Debug, Error)]
pub enum MetricError {
    /// Metric tool exited unsuccessfully
    #[error("{metric} computation failed: {detail}")]
    ToolFailed { metric: Metric, detail: String },

    /// Metric tool succeeded but its output held no score
    #[error("could not find a {0} score in tool output")]
    Unparsable(Metric),

    /// Achieved bitrate of the encoded file could not be determined
    #[error("bitrate unavailable: {0}")]
    Bitrate(String),

    /// Every requested metric failed
    #[error("no requested metric could be computed: {0}")]
    NoMetrics(String),

    /// IO error while running the metric tool
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quality scores and achieved bitrate of one encoded artifact
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub metrics: BTreeMap<Metric, f64>,
    pub bitrate_kbps: f64,
    /// Requested metrics that failed while others succeeded
    pub metric_failures: BTreeMap<Metric, String>,
}

/// Compares an encoded artifact against its source
#[async_trait]
pub trait QualityMeter: Send + Sync {
    async fn measure(
        &self,
        source: &Path,
        encoded: &EncodedArtifact,
        metrics: &BTreeSet<Metric>,
    ) -> Result<Measurement, MetricError>;

    /// Best-effort description of the source, attached to job results
    async fn probe_source(&self, _source: &Path) -> Option<SourceInfo> {
        None
    }
}
