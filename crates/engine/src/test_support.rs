//! In-process collaborators for engine tests

use crate::config::{CodecSpec, Metric};
use crate::encode::{EncodeError, EncodedArtifact, Encoder, PartialOutput};
use crate::measure::{Measurement, MetricError, QualityMeter};
use crate::probe::SourceInfo;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Writes `"<codec> <quality>"` into a small file per encode
///
/// The file is written before the configured delay, so a cancelled or
/// failed encode leaves a partial output behind unless it is cleaned up.
///
/// Clones share counters, so a test can keep a handle after giving the
/// encoder to a sampler.
#[derive(Clone)]
pub struct FakeEncoder {
    dir: PathBuf,
    delay: DelayFn,
    failing: Arc<HashSet<u32>>,
    panicking: Arc<HashSet<u32>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
    produced: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeEncoder {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            delay: Arc::new(|_| Duration::from_millis(5)),
            failing: Arc::new(HashSet::new()),
            panicking: Arc::new(HashSet::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(AtomicUsize::new(0)),
            produced: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_at(mut self, quality: u32) -> Self {
        let mut failing = (*self.failing).clone();
        failing.insert(quality);
        self.failing = Arc::new(failing);
        self
    }

    pub fn panicking_at(mut self, quality: u32) -> Self {
        let mut panicking = (*self.panicking).clone();
        panicking.insert(quality);
        self.panicking = Arc::new(panicking);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_by_quality(move |_| delay)
    }

    pub fn with_delay_by_quality(
        mut self,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Arc::new(delay);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> Vec<PathBuf> {
        self.produced.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(
        &self,
        _source: &Path,
        codec_id: &str,
        codec: &CodecSpec,
        quality: u32,
    ) -> Result<EncodedArtifact, EncodeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if self.panicking.contains(&quality) {
            panic!("encoder crashed at q{}", quality);
        }

        // Output exists while the encode runs, like a real encoder's
        let path = self
            .dir
            .join(format!("{}_q{}_{}{}", codec_id, quality, uuid::Uuid::new_v4().simple(), codec.extension));
        let output = PartialOutput::new(path.clone());
        let body = format!("{} {}", codec_id, quality);
        tokio::fs::write(&path, &body).await?;
        self.produced.lock().unwrap().push(path.clone());

        tokio::time::sleep((self.delay)(quality)).await;

        if self.failing.contains(&quality) {
            return Err(EncodeError::Failed {
                code: 1,
                detail: format!("injected failure at q{}", quality),
            });
        }

        Ok(EncodedArtifact {
            path: output.keep(),
            size_bytes: body.len() as u64,
        })
    }
}

/// Scores artifacts written by [`FakeEncoder`] with a smooth RD model
///
/// Lower quality settings give higher bitrate and higher scores; `hevc`
/// needs 40% less bitrate than the other codecs for the same score.
#[derive(Clone, Default)]
pub struct FakeMeter {
    failing: Arc<HashSet<u32>>,
    broken_metrics: Arc<BTreeSet<Metric>>,
}

impl FakeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, quality: u32) -> Self {
        let mut failing = (*self.failing).clone();
        failing.insert(quality);
        self.failing = Arc::new(failing);
        self
    }

    /// Every measurement reports `metric` as failed, like a missing filter
    pub fn without_metric(mut self, metric: Metric) -> Self {
        let mut broken = (*self.broken_metrics).clone();
        broken.insert(metric);
        self.broken_metrics = Arc::new(broken);
        self
    }
}

#[async_trait]
impl QualityMeter for FakeMeter {
    async fn measure(
        &self,
        _source: &Path,
        encoded: &EncodedArtifact,
        metrics: &BTreeSet<Metric>,
    ) -> Result<Measurement, MetricError> {
        let body = tokio::fs::read_to_string(&encoded.path).await?;
        let (codec_id, quality) = body
            .split_once(' ')
            .and_then(|(c, q)| q.parse::<u32>().ok().map(|q| (c.to_string(), q)))
            .ok_or(MetricError::Unparsable(Metric::Psnr))?;

        if self.failing.contains(&quality) {
            return Err(MetricError::ToolFailed {
                metric: Metric::Vmaf,
                detail: "injected failure".to_string(),
            });
        }

        let q = quality as f64;
        let scale = if codec_id == "hevc" { 0.6 } else { 1.0 };
        let bitrate_kbps = scale * 100.0 * 2f64.powf((60.0 - q) / 6.0);

        let all: BTreeMap<Metric, f64> = [
            (Metric::Psnr, 55.0 - 0.5 * q),
            (Metric::Ssim, 1.0 - 0.004 * q),
            (Metric::Vmaf, 100.0 - 1.2 * q),
        ]
        .into_iter()
        .collect();

        let (broken, working): (BTreeMap<_, _>, BTreeMap<_, _>) = all
            .into_iter()
            .filter(|(m, _)| metrics.contains(m))
            .partition(|(m, _)| self.broken_metrics.contains(m));
        let metric_failures: BTreeMap<Metric, String> = broken
            .into_keys()
            .map(|m| (m, format!("{} computation failed: filter not available", m)))
            .collect();

        if working.is_empty() && !metrics.is_empty() {
            let reasons: Vec<String> = metric_failures.into_values().collect();
            return Err(MetricError::NoMetrics(reasons.join("; ")));
        }

        Ok(Measurement {
            metrics: working,
            bitrate_kbps,
            metric_failures,
        })
    }

    async fn probe_source(&self, _source: &Path) -> Option<SourceInfo> {
        Some(SourceInfo {
            duration_secs: 10.0,
            size_bytes: 5_000_000,
            bitrate_kbps: Some(4000.0),
            video: None,
        })
    }
}
