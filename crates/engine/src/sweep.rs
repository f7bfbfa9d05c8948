//! Codec sweep runner
//!
//! Fans one sampler call out per quality setting and assembles the survivors
//! into a [`CodecResult`] in the requested order.

use crate::config::{CodecSpec, Metric};
use crate::rd::{CodecResult, SampleDiagnostic, SampleStage};
use crate::sampler::{MetricSampler, SampleError};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives a [`MetricSampler`] over all quality settings of one codec
#[derive(Clone)]
pub struct CodecSweepRunner {
    sampler: MetricSampler,
}

impl CodecSweepRunner {
    pub fn new(sampler: MetricSampler) -> Self {
        Self { sampler }
    }

    /// Sweep `qualities` for one codec
    ///
    /// Every setting is spawned at once; the sampler's shared budget decides
    /// how many actually run. Failed samples become diagnostics.
    pub async fn run(
        &self,
        source: &Path,
        codec_id: &str,
        codec: &CodecSpec,
        qualities: &[u32],
        metrics: &BTreeSet<Metric>,
        cancel: &CancellationToken,
    ) -> CodecResult {
        let source: Arc<PathBuf> = Arc::new(source.to_path_buf());
        let codec = Arc::new(codec.clone());
        let metrics = Arc::new(metrics.clone());

        let mut tasks = JoinSet::new();
        let mut task_index: HashMap<Id, usize> = HashMap::with_capacity(qualities.len());
        for (index, &quality) in qualities.iter().enumerate() {
            let sampler = self.sampler.clone();
            let source = Arc::clone(&source);
            let codec = Arc::clone(&codec);
            let metrics = Arc::clone(&metrics);
            let codec_id = codec_id.to_string();
            let cancel = cancel.clone();

            let handle = tasks.spawn(async move {
                sampler
                    .sample(&source, &codec_id, &codec, quality, &metrics, &cancel)
                    .await
            });
            task_index.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Result<_, SampleError>>> =
            qualities.iter().map(|_| None).collect();
        let mut aborted: Vec<Option<String>> = qualities.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(&index) = task_index.get(&id) {
                        slots[index] = Some(outcome);
                    }
                }
                Err(e) => {
                    if let Some(&index) = task_index.get(&e.id()) {
                        warn!(codec = codec_id, quality = qualities[index], error = %e, "sample task died");
                        aborted[index] = Some(e.to_string());
                    }
                }
            }
        }

        let mut points = Vec::with_capacity(qualities.len());
        let mut diagnostics = Vec::new();
        for ((slot, cause), &quality) in slots.into_iter().zip(aborted).zip(qualities) {
            match slot {
                Some(Ok(point)) => points.push(point),
                Some(Err(e)) => {
                    if !matches!(e, SampleError::Cancelled) {
                        warn!(codec = codec_id, quality, error = %e, "sample dropped");
                    }
                    diagnostics.push(e.to_diagnostic(quality));
                }
                None => diagnostics.push(SampleDiagnostic {
                    quality_setting: quality,
                    stage: SampleStage::Aborted,
                    message: format!(
                        "sample task ended abnormally: {}",
                        cause.unwrap_or_else(|| "no outcome reported".to_string())
                    ),
                }),
            }
        }

        let result = CodecResult::new(codec_id, codec.name.clone(), points, diagnostics);
        if result.insufficient_for_bd_rate {
            debug!(
                codec = codec_id,
                points = result.points.len(),
                "too few points for BD-Rate"
            );
        }
        info!(
            codec = codec_id,
            points = result.points.len(),
            dropped = result.diagnostics.len(),
            "codec sweep finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::TaskBudget;
    use crate::config::default_catalog;
    use crate::test_support::{FakeEncoder, FakeMeter};
    use proptest::prelude::*;
    use std::time::Duration;

    fn runner(encoder: &FakeEncoder, meter: FakeMeter, limit: usize) -> CodecSweepRunner {
        CodecSweepRunner::new(MetricSampler::new(
            Arc::new(encoder.clone()),
            Arc::new(meter),
            TaskBudget::new(limit),
            Duration::from_secs(10),
            false,
        ))
    }

    fn metrics() -> BTreeSet<Metric> {
        BTreeSet::from([Metric::Psnr])
    }

    #[tokio::test]
    async fn test_points_follow_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        // Earlier settings take longer so they complete last
        let encoder = FakeEncoder::new(dir.path())
            .with_delay_by_quality(|q| Duration::from_millis(80u64.saturating_sub(q as u64 * 2)));
        let spec = default_catalog()["h264"].clone();
        let qualities = [18, 33, 23, 28];

        let result = runner(&encoder, FakeMeter::new(), 4)
            .run(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                &qualities,
                &metrics(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.qualities(), qualities.to_vec());
        assert!(!result.insufficient_for_bd_rate);
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.name, "H.264/AVC");
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_remaining_points() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path()).failing_at(23);
        let spec = default_catalog()["h264"].clone();

        let result = runner(&encoder, FakeMeter::new(), 2)
            .run(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                &[18, 23, 28, 33],
                &metrics(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.qualities(), vec![18, 28, 33]);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].quality_setting, 23);
        assert_eq!(result.diagnostics[0].stage, SampleStage::Encode);
        assert!(result.insufficient_for_bd_rate);
    }

    #[tokio::test]
    async fn test_measure_failure_is_diagnosed() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let spec = default_catalog()["hevc"].clone();

        let result = runner(&encoder, FakeMeter::new().failing_at(30), 2)
            .run(
                Path::new("clip.mkv"),
                "hevc",
                &spec,
                &[20, 25, 30, 35, 40],
                &metrics(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.qualities(), vec![20, 25, 35, 40]);
        assert_eq!(result.diagnostics[0].stage, SampleStage::Measure);
        assert!(!result.insufficient_for_bd_rate);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_records_cancellations() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let spec = default_catalog()["h264"].clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner(&encoder, FakeMeter::new(), 2)
            .run(Path::new("clip.mkv"), "h264", &spec, &[18, 23], &metrics(), &cancel)
            .await;

        assert!(result.points.is_empty());
        assert!(result
            .diagnostics
            .iter()
            .all(|d| d.stage == SampleStage::Cancelled));
        assert_eq!(encoder.started(), 0);
    }

    #[tokio::test]
    async fn test_missing_metric_noted_on_every_point() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path());
        let spec = default_catalog()["h264"].clone();
        let all: BTreeSet<Metric> = Metric::ALL.into_iter().collect();

        let result = runner(&encoder, FakeMeter::new().without_metric(Metric::Vmaf), 2)
            .run(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                &[18, 23, 28, 33],
                &all,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.points.len(), 4);
        assert!(result.diagnostics.is_empty());
        for point in &result.points {
            assert!(point.metric(Metric::Vmaf).is_none());
            assert!(point.metric(Metric::Psnr).is_some());
            assert!(point.metric_errors[&Metric::Vmaf].contains("vmaf"));
        }

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("metric_errors"));
    }

    #[tokio::test]
    async fn test_crashed_sample_reported_as_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FakeEncoder::new(dir.path()).panicking_at(23);
        let spec = default_catalog()["h264"].clone();

        let budget = TaskBudget::new(2);
        let runner = CodecSweepRunner::new(MetricSampler::new(
            Arc::new(encoder.clone()),
            Arc::new(FakeMeter::new()),
            budget.clone(),
            Duration::from_secs(10),
            false,
        ));
        let result = runner
            .run(
                Path::new("clip.mkv"),
                "h264",
                &spec,
                &[18, 23, 28],
                &metrics(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.qualities(), vec![18, 28]);
        assert_eq!(result.diagnostics.len(), 1);
        let diagnostic = &result.diagnostics[0];
        assert_eq!(diagnostic.quality_setting, 23);
        assert_eq!(diagnostic.stage, SampleStage::Aborted);
        assert!(diagnostic.message.contains("panicked"));
        // The permit held by the crashed task was returned
        assert_eq!(budget.available_permits(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_in_flight_never_exceeds_budget(limit in 1usize..4, count in 1usize..10) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let encoder = FakeEncoder::new(dir.path()).with_delay(Duration::from_millis(10));
                let spec = default_catalog()["h264"].clone();
                let qualities: Vec<u32> = (0..count as u32).collect();

                let result = runner(&encoder, FakeMeter::new(), limit)
                    .run(
                        Path::new("clip.mkv"),
                        "h264",
                        &spec,
                        &qualities,
                        &metrics(),
                        &CancellationToken::new(),
                    )
                    .await;

                assert!(encoder.max_in_flight() <= limit);
                assert_eq!(result.qualities(), qualities);
            });
        }
    }
}
