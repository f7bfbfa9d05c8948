//! Metric sampler: one encode + measure for a single (codec, quality) pair

use crate::concurrency::TaskBudget;
use crate::config::{CodecSpec, Metric};
use crate::encode::{EncodeError, Encoder};
use crate::measure::{MetricError, QualityMeter};
use crate::rd::{RdPoint, SampleDiagnostic, SampleStage};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a single sample produced no RD point
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Metric computation failed: {0}")]
    Metric(#[from] MetricError),

    /// Job was stopped before this sample was dispatched
    #[error("Sample cancelled before dispatch")]
    Cancelled,
}

impl SampleError {
    pub fn stage(&self) -> SampleStage {
        match self {
            SampleError::Encode(_) => SampleStage::Encode,
            SampleError::Metric(_) => SampleStage::Measure,
            SampleError::Cancelled => SampleStage::Cancelled,
        }
    }

    /// Diagnostic recorded in the codec result in place of the missing point
    pub fn to_diagnostic(&self, quality_setting: u32) -> SampleDiagnostic {
        SampleDiagnostic {
            quality_setting,
            stage: self.stage(),
            message: self.to_string(),
        }
    }
}

/// Runs the encode and measure collaborators for one sample
///
/// Each call holds one permit of the global task budget from encode start
/// until the measurement finishes.
#[derive(Clone)]
pub struct MetricSampler {
    encoder: Arc<dyn Encoder>,
    meter: Arc<dyn QualityMeter>,
    budget: TaskBudget,
    encode_timeout: Duration,
    keep_artifacts: bool,
}

impl MetricSampler {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        meter: Arc<dyn QualityMeter>,
        budget: TaskBudget,
        encode_timeout: Duration,
        keep_artifacts: bool,
    ) -> Self {
        Self {
            encoder,
            meter,
            budget,
            encode_timeout,
            keep_artifacts,
        }
    }

    pub fn meter(&self) -> &Arc<dyn QualityMeter> {
        &self.meter
    }

    /// Produce one RD point, or the reason it could not be produced
    pub async fn sample(
        &self,
        source: &Path,
        codec_id: &str,
        codec: &CodecSpec,
        quality: u32,
        metrics: &BTreeSet<Metric>,
        cancel: &CancellationToken,
    ) -> Result<RdPoint, SampleError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SampleError::Cancelled),
            permit = self.budget.acquire() => permit.map_err(|_| SampleError::Cancelled)?,
        };
        if cancel.is_cancelled() {
            return Err(SampleError::Cancelled);
        }

        debug!(codec = codec_id, quality, "sample dispatched");

        let started = Instant::now();
        let artifact = tokio::time::timeout(
            self.encode_timeout,
            self.encoder.encode(source, codec_id, codec, quality),
        )
        .await
        .map_err(|_| EncodeError::Timeout(self.encode_timeout))??;
        let encode_time_seconds = started.elapsed().as_secs_f64();

        let measured = self.meter.measure(source, &artifact, metrics).await;

        let encoded_path = if self.keep_artifacts && measured.is_ok() {
            Some(artifact.path.clone())
        } else {
            if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %artifact.path.display(), error = %e, "failed to remove encoded artifact");
                }
            }
            None
        };

        let measurement = measured?;
        let (scores, metric_errors) =
            split_scores(measurement.metrics, measurement.metric_failures, metrics);
        for (metric, reason) in &metric_errors {
            warn!(codec = codec_id, quality, %metric, reason = %reason, "metric missing from sample");
        }

        Ok(RdPoint {
            quality_setting: quality,
            bitrate_kbps: measurement.bitrate_kbps.max(0.0),
            metrics: scores,
            encode_time_seconds,
            file_size_bytes: artifact.size_bytes,
            encoded_path,
            metric_errors,
        })
    }
}

/// Keep finite scores of requested metrics; every other requested metric
/// gets an error note
fn split_scores(
    scores: BTreeMap<Metric, f64>,
    mut failures: BTreeMap<Metric, String>,
    requested: &BTreeSet<Metric>,
) -> (BTreeMap<Metric, f64>, BTreeMap<Metric, String>) {
    let mut kept = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for &metric in requested {
        match scores.get(&metric) {
            Some(&value) if value.is_finite() => {
                kept.insert(metric, value);
            }
            Some(&value) => {
                errors.insert(metric, format!("{} score is not finite ({})", metric, value));
            }
            None => {
                let reason = failures
                    .remove(&metric)
                    .unwrap_or_else(|| format!("no {} score reported", metric));
                errors.insert(metric, reason);
            }
        }
    }
    (kept, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_catalog;
    use crate::test_support::{FakeEncoder, FakeMeter};

    fn sampler(encoder: FakeEncoder, meter: FakeMeter, keep: bool) -> MetricSampler {
        MetricSampler::new(
            Arc::new(encoder),
            Arc::new(meter),
            TaskBudget::new(2),
            Duration::from_secs(5),
            keep,
        )
    }

    fn all_metrics() -> BTreeSet<Metric> {
        Metric::ALL.into_iter().collect()
    }

    #[tokio::test]
    async fn test_sample_builds_point_and_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let sampler = sampler(encoder.clone(), FakeMeter::new(), false);
        let spec = default_catalog()["h264"].clone();

        let requested = BTreeSet::from([Metric::Psnr, Metric::Vmaf]);
        let point = sampler
            .sample(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                23,
                &requested,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(point.quality_setting, 23);
        assert!(point.bitrate_kbps > 0.0);
        assert_eq!(
            point.metrics.keys().copied().collect::<Vec<_>>(),
            vec![Metric::Psnr, Metric::Vmaf]
        );
        assert!(point.encoded_path.is_none());
        assert!(point.file_size_bytes > 0);

        let artifact = encoder.produced().pop().unwrap();
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_keep_artifacts_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = sampler(FakeEncoder::new(dir.path()), FakeMeter::new(), true);
        let spec = default_catalog()["hevc"].clone();

        let point = sampler
            .sample(
                Path::new("clip.mkv"),
                "hevc",
                &spec,
                30,
                &all_metrics(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let path = point.encoded_path.expect("artifact path retained");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_encode_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path()).failing_at(28);
        let sampler = sampler(encoder.clone(), FakeMeter::new(), false);
        let spec = default_catalog()["h264"].clone();

        let err = sampler
            .sample(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                28,
                &all_metrics(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage(), SampleStage::Encode);
        let diagnostic = err.to_diagnostic(28);
        assert_eq!(diagnostic.quality_setting, 28);
        assert!(diagnostic.message.contains("Encode failed"));
        assert!(!encoder.produced()[0].exists());
    }

    #[tokio::test]
    async fn test_metric_failure_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let sampler = sampler(encoder.clone(), FakeMeter::new().failing_at(18), true);
        let spec = default_catalog()["h264"].clone();

        let err = sampler
            .sample(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                18,
                &all_metrics(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage(), SampleStage::Measure);
        assert!(!encoder.produced()[0].exists());
    }

    #[tokio::test]
    async fn test_failed_metric_noted_on_point() {
        let dir = tempfile::tempdir().unwrap();
        let meter = FakeMeter::new().without_metric(Metric::Vmaf);
        let sampler = sampler(FakeEncoder::new(dir.path()), meter, false);
        let spec = default_catalog()["h264"].clone();

        let point = sampler
            .sample(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                23,
                &all_metrics(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            point.metrics.keys().copied().collect::<Vec<_>>(),
            vec![Metric::Psnr, Metric::Ssim]
        );
        assert_eq!(
            point.metric_errors.keys().copied().collect::<Vec<_>>(),
            vec![Metric::Vmaf]
        );
        assert!(point.metric_errors[&Metric::Vmaf].contains("filter not available"));
    }

    #[test]
    fn test_split_scores_notes_every_missing_metric() {
        let scores = BTreeMap::from([
            (Metric::Psnr, 41.0),
            (Metric::Ssim, f64::NAN),
            (Metric::Vmaf, 90.0),
        ]);
        let failures = BTreeMap::new();
        let requested = BTreeSet::from([Metric::Psnr, Metric::Ssim]);

        let (kept, errors) = split_scores(scores, failures, &requested);
        assert_eq!(kept, BTreeMap::from([(Metric::Psnr, 41.0)]));
        assert!(errors[&Metric::Ssim].contains("not finite"));
        assert!(!errors.contains_key(&Metric::Vmaf));

        let (kept, errors) = split_scores(
            BTreeMap::new(),
            BTreeMap::from([(Metric::Vmaf, "vmaf computation failed: boom".to_string())]),
            &BTreeSet::from([Metric::Psnr, Metric::Vmaf]),
        );
        assert!(kept.is_empty());
        assert_eq!(errors[&Metric::Vmaf], "vmaf computation failed: boom");
        assert_eq!(errors[&Metric::Psnr], "no psnr score reported");
    }

    #[tokio::test]
    async fn test_encode_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path()).with_delay(Duration::from_secs(5));
        let sampler = MetricSampler::new(
            Arc::new(encoder.clone()),
            Arc::new(FakeMeter::new()),
            TaskBudget::new(1),
            Duration::from_millis(50),
            false,
        );
        let spec = default_catalog()["h264"].clone();

        let err = sampler
            .sample(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                23,
                &all_metrics(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SampleError::Encode(EncodeError::Timeout(_))));
        // Permit is released after the timeout
        assert_eq!(sampler.budget.available_permits(), 1);

        // The partial output of the abandoned encode is gone
        let produced = encoder.produced();
        assert_eq!(produced.len(), 1);
        assert!(!produced[0].exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let sampler = sampler(encoder.clone(), FakeMeter::new(), false);
        let spec = default_catalog()["h264"].clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sampler
            .sample(Path::new("clip.mkv"), "h264", &spec, 23, &all_metrics(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SampleError::Cancelled));
        assert!(encoder.produced().is_empty());
    }
}
