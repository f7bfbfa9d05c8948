//! Codec and metric catalog
//!
//! Static description of the codecs the benchmark can sweep and the quality
//! metrics it can measure. Loaded from the `[codecs.*]` tables of the config
//! file, falling back to the built-in catalog below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Objective quality metric computed by the external metric tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Peak Signal-to-Noise Ratio (dB)
    Psnr,
    /// Structural Similarity Index
    Ssim,
    /// Video Multimethod Assessment Fusion
    Vmaf,
}

impl Metric {
    /// All supported metrics, in display order
    pub const ALL: [Metric; 3] = [Metric::Psnr, Metric::Ssim, Metric::Vmaf];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Psnr => "psnr",
            Metric::Ssim => "ssim",
            Metric::Vmaf => "vmaf",
        }
    }

    /// Descriptive information for listings
    pub fn info(&self) -> MetricInfo {
        match self {
            Metric::Psnr => MetricInfo {
                name: "PSNR",
                description: "Peak Signal-to-Noise Ratio",
                unit: "dB",
                higher_better: true,
            },
            Metric::Ssim => MetricInfo {
                name: "SSIM",
                description: "Structural Similarity Index",
                unit: "",
                higher_better: true,
            },
            Metric::Vmaf => MetricInfo {
                name: "VMAF",
                description: "Video Multimethod Assessment Fusion",
                unit: "",
                higher_better: true,
            },
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown metric name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetric(pub String);

impl fmt::Display for UnknownMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown metric '{}' (expected psnr, ssim or vmaf)", self.0)
    }
}

impl std::error::Error for UnknownMetric {}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "psnr" => Ok(Metric::Psnr),
            "ssim" => Ok(Metric::Ssim),
            "vmaf" => Ok(Metric::Vmaf),
            _ => Err(UnknownMetric(s.to_string())),
        }
    }
}

/// Display information about a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub higher_better: bool,
}

/// Inclusive range of valid quality settings for a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct QualityRange {
    pub min: u32,
    pub max: u32,
}

impl QualityRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, quality: u32) -> bool {
        quality >= self.min && quality <= self.max
    }
}

impl From<(u32, u32)> for QualityRange {
    fn from((min, max): (u32, u32)) -> Self {
        Self { min, max }
    }
}

impl From<QualityRange> for (u32, u32) {
    fn from(range: QualityRange) -> Self {
        (range.min, range.max)
    }
}

impl fmt::Display for QualityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// One entry of the codec catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecSpec {
    /// Human-readable codec name (e.g., "H.264/AVC")
    pub name: String,
    /// FFmpeg encoder name passed to `-c:v` (e.g., "libx264")
    pub encoder: String,
    /// Output container extension including the dot (e.g., ".mp4")
    pub extension: String,
    /// FFmpeg flag carrying the quality setting (e.g., "-crf")
    pub quality_param: String,
    /// Qualities swept when a request does not name any
    pub default_qualities: Vec<u32>,
    /// Inclusive valid range for the quality setting
    pub quality_range: QualityRange,
}

/// Codec catalog keyed by codec id (e.g., "h264")
pub type CodecCatalog = BTreeMap<String, CodecSpec>;

/// Built-in codec catalog used when the config file declares no codecs
pub fn default_catalog() -> CodecCatalog {
    let mut catalog = BTreeMap::new();
    catalog.insert(
        "mpeg2".to_string(),
        CodecSpec {
            name: "MPEG-2".to_string(),
            encoder: "mpeg2video".to_string(),
            extension: ".mpv".to_string(),
            quality_param: "-qscale:v".to_string(),
            default_qualities: vec![2, 4, 6, 8],
            quality_range: QualityRange::new(1, 31),
        },
    );
    catalog.insert(
        "h264".to_string(),
        CodecSpec {
            name: "H.264/AVC".to_string(),
            encoder: "libx264".to_string(),
            extension: ".mp4".to_string(),
            quality_param: "-crf".to_string(),
            default_qualities: vec![18, 23, 28, 33],
            quality_range: QualityRange::new(0, 51),
        },
    );
    catalog.insert(
        "hevc".to_string(),
        CodecSpec {
            name: "HEVC/H.265".to_string(),
            encoder: "libx265".to_string(),
            extension: ".mp4".to_string(),
            quality_param: "-crf".to_string(),
            default_qualities: vec![20, 25, 30, 35],
            quality_range: QualityRange::new(0, 51),
        },
    );
    catalog
}
