//! Job orchestrator
//!
//! Accepts analysis requests, runs one codec sweep per requested codec under
//! the shared task budget, publishes progress through the [`StatusStore`] and
//! computes BD-Rates between consecutive codecs once every sweep is final.

use crate::bd_rate::{self, BdRateResult};
use crate::config::{CodecCatalog, CodecSpec, Metric, MetricInfo, QualityRange};
use crate::measure::QualityMeter;
use crate::rd::CodecResult;
use crate::sampler::MetricSampler;
use crate::status::{AnalysisResults, Job, JobState, JobStatus, StatusError, StatusStore};
use crate::sweep::CodecSweepRunner;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Share of the progress bar covered by codec sweeps
const SWEEP_PROGRESS_SHARE: f32 = 90.0;
const BD_RATE_PROGRESS: f32 = 95.0;

/// Job-level faults; any of these moves the job to `Error`
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("no codecs requested")]
    EmptyCodecList,

    #[error("unknown codec '{0}'")]
    UnknownCodec(String),

    #[error("codec '{0}' requested more than once")]
    DuplicateCodec(String),

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("quality {quality} for codec '{codec}' is outside the valid range {range}")]
    QualityOutOfRange {
        codec: String,
        quality: u32,
        range: QualityRange,
    },

    #[error("source {path} is not readable: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("analysis cancelled")]
    Cancelled,

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("sweep for codec '{codec}' produced no result: {reason}")]
    SweepFailed { codec: String, reason: String },

    #[error("status update failed: {0}")]
    Status(#[from] StatusError),
}

/// Client request for one analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub source: PathBuf,
    /// Codec ids; order decides the BD-Rate pairs
    pub codecs: Vec<String>,
    /// Quality settings per codec; absent or empty means catalog defaults
    #[serde(default)]
    pub qualities: BTreeMap<String, Vec<u32>>,
    /// Metric names; empty means every supported metric
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Request after validation against the catalog
#[derive(Debug, Clone)]
struct ResolvedRequest {
    codecs: Vec<(String, CodecSpec, Vec<u32>)>,
    metrics: BTreeSet<Metric>,
}

/// Runs analysis jobs and answers status queries
///
/// Cloning shares the store, budget and cancellation handles.
#[derive(Clone)]
pub struct Orchestrator {
    catalog: Arc<CodecCatalog>,
    runner: CodecSweepRunner,
    meter: Arc<dyn QualityMeter>,
    store: StatusStore,
    analysis_timeout: Duration,
    cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        catalog: CodecCatalog,
        sampler: MetricSampler,
        store: StatusStore,
        analysis_timeout: Duration,
    ) -> Self {
        let meter = Arc::clone(sampler.meter());
        Self {
            catalog: Arc::new(catalog),
            runner: CodecSweepRunner::new(sampler),
            meter,
            store,
            analysis_timeout,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a job and start it in the background
    ///
    /// Returns as soon as the job is stored in `Starting`; all validation
    /// happens inside the job so faults surface through its status.
    pub async fn submit_job(&self, request: JobRequest) -> Result<String, OrchestrationError> {
        let id = format!("analysis-{}", Uuid::new_v4());
        let job = Job::new(&id, request.source.clone(), request.codecs.clone());
        self.store.insert(job).await?;

        let cancel = CancellationToken::new();
        self.cancel_handles().insert(id.clone(), cancel.clone());

        info!(job_id = %id, source = %request.source.display(), codecs = ?request.codecs, "job submitted");

        let this = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            this.run_job(job_id, request, cancel).await;
        });

        Ok(id)
    }

    pub async fn get_status(&self, id: &str) -> Result<JobStatus, StatusError> {
        self.store.get_status(id).await
    }

    pub async fn get_results(&self, id: &str) -> Result<AnalysisResults, StatusError> {
        self.store.get_results(id).await
    }

    /// Full job snapshot, including partial results of failed jobs
    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.store.get(id).await
    }

    /// Stop dispatching new samples for a running job
    ///
    /// Samples already running finish; the job then ends in `Error`.
    pub async fn cancel_job(&self, id: &str) -> Result<(), StatusError> {
        if let Some(token) = self.cancel_handles().get(id) {
            info!(job_id = id, "cancellation requested");
            token.cancel();
            return Ok(());
        }

        let status = self.store.get_status(id).await?;
        Err(StatusError::Terminal {
            id: id.to_string(),
            state: status.state,
        })
    }

    pub fn supported_codecs(&self) -> &CodecCatalog {
        &self.catalog
    }

    pub fn supported_metrics(&self) -> Vec<MetricInfo> {
        Metric::ALL.iter().map(Metric::info).collect()
    }

    fn cancel_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.cancels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_job(self, id: String, request: JobRequest, cancel: CancellationToken) {
        if let Err(e) = self
            .store
            .update(&id, |job| job.state = JobState::Processing)
            .await
        {
            error!(job_id = %id, error = %e, "could not start job");
            self.cancel_handles().remove(&id);
            return;
        }

        let outcome = match tokio::time::timeout(
            self.analysis_timeout,
            self.analyze(&id, &request, &cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                Err(OrchestrationError::Timeout(self.analysis_timeout))
            }
        };

        let finished = match outcome {
            Ok(results) => {
                info!(
                    job_id = %id,
                    codecs = results.codec_results.len(),
                    comparisons = results.bd_rates.len(),
                    "analysis complete"
                );
                self.store
                    .update(&id, move |job| {
                        job.state = JobState::Complete;
                        job.progress_percent = 100.0;
                        job.current_task = "Analysis complete!".to_string();
                        job.results = Some(results);
                    })
                    .await
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "analysis failed");
                let message = e.to_string();
                self.store
                    .update(&id, move |job| {
                        job.state = JobState::Error;
                        job.current_task = "Analysis failed".to_string();
                        job.error_message = Some(message);
                    })
                    .await
            }
        };

        self.cancel_handles().remove(&id);

        if let Err(e) = finished {
            error!(job_id = %id, error = %e, "could not record job outcome");
        }
    }

    async fn analyze(
        &self,
        id: &str,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResults, OrchestrationError> {
        let resolved = self.resolve(request)?;
        check_source(&request.source).await?;

        let source_info = self.meter.probe_source(&request.source).await;
        let first_codec = resolved.codecs[0].0.clone();
        let metrics = resolved.metrics.clone();
        let quality_settings: BTreeMap<String, Vec<u32>> = resolved
            .codecs
            .iter()
            .map(|(codec_id, _, qualities)| (codec_id.clone(), qualities.clone()))
            .collect();

        self.store
            .update(id, move |job| {
                job.quality_settings = quality_settings;
                job.metrics = metrics;
                job.current_task = format!("Processing {}...", first_codec);
                job.results_mut().source_info = source_info;
            })
            .await?;

        let codec_results = self.run_sweeps(id, request, &resolved, cancel).await?;

        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        self.store
            .update(id, |job| {
                job.progress_percent = BD_RATE_PROGRESS;
                job.current_task = "Computing BD-Rate...".to_string();
            })
            .await?;

        let bd_rates = consecutive_bd_rates(&resolved, &codec_results);

        let mut results = self
            .store
            .get(id)
            .await
            .and_then(|job| job.results)
            .unwrap_or_default();
        results.codec_results = codec_results;
        results.bd_rates = bd_rates;
        Ok(results)
    }

    /// Sweep every codec concurrently, publishing each result as it lands
    async fn run_sweeps(
        &self,
        id: &str,
        request: &JobRequest,
        resolved: &ResolvedRequest,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, CodecResult>, OrchestrationError> {
        let total = resolved.codecs.len();
        let mut sweeps = JoinSet::new();
        let mut sweep_codecs: HashMap<Id, String> = HashMap::with_capacity(total);

        for (codec_id, spec, qualities) in resolved.codecs.iter().cloned() {
            let runner = self.runner.clone();
            let source = request.source.clone();
            let metrics = resolved.metrics.clone();
            let cancel = cancel.clone();
            debug!(job_id = id, codec = %codec_id, qualities = ?qualities, "starting codec sweep");

            let task_codec = codec_id.clone();
            let handle = sweeps.spawn(async move {
                runner
                    .run(&source, &codec_id, &spec, &qualities, &metrics, &cancel)
                    .await
            });
            sweep_codecs.insert(handle.id(), task_codec);
        }

        let mut finished: BTreeMap<String, CodecResult> = BTreeMap::new();
        while let Some(joined) = sweeps.join_next_with_id().await {
            let result = match sweep_outcome(&sweep_codecs, joined) {
                Ok(result) => result,
                Err(e) => {
                    error!(job_id = id, error = %e, "codec sweep task failed");
                    return Err(e);
                }
            };

            finished.insert(result.codec_id.clone(), result.clone());
            let progress = SWEEP_PROGRESS_SHARE * finished.len() as f32 / total as f32;
            let next = resolved
                .codecs
                .iter()
                .map(|(codec_id, _, _)| codec_id)
                .find(|codec_id| !finished.contains_key(*codec_id))
                .cloned();

            self.store
                .update(id, move |job| {
                    job.progress_percent = progress;
                    if let Some(codec_id) = next {
                        job.current_task = format!("Processing {}...", codec_id);
                    }
                    job.results_mut()
                        .codec_results
                        .insert(result.codec_id.clone(), result);
                })
                .await?;
        }

        Ok(finished)
    }

    fn resolve(&self, request: &JobRequest) -> Result<ResolvedRequest, OrchestrationError> {
        if request.codecs.is_empty() {
            return Err(OrchestrationError::EmptyCodecList);
        }

        let mut seen = BTreeSet::new();
        let mut codecs = Vec::with_capacity(request.codecs.len());
        for codec_id in &request.codecs {
            if !seen.insert(codec_id.as_str()) {
                return Err(OrchestrationError::DuplicateCodec(codec_id.clone()));
            }
            let spec = self
                .catalog
                .get(codec_id)
                .ok_or_else(|| OrchestrationError::UnknownCodec(codec_id.clone()))?;

            let qualities = match request.qualities.get(codec_id) {
                Some(q) if !q.is_empty() => q.clone(),
                _ => spec.default_qualities.clone(),
            };
            if let Some(&quality) = qualities.iter().find(|&&q| !spec.quality_range.contains(q)) {
                return Err(OrchestrationError::QualityOutOfRange {
                    codec: codec_id.clone(),
                    quality,
                    range: spec.quality_range,
                });
            }

            codecs.push((codec_id.clone(), spec.clone(), qualities));
        }

        let metrics = if request.metrics.is_empty() {
            Metric::ALL.into_iter().collect()
        } else {
            request
                .metrics
                .iter()
                .map(|name| {
                    name.parse::<Metric>()
                        .map_err(|_| OrchestrationError::UnknownMetric(name.clone()))
                })
                .collect::<Result<BTreeSet<_>, _>>()?
        };

        Ok(ResolvedRequest { codecs, metrics })
    }
}

/// Result of one joined sweep task; a sweep that died fails the whole job
fn sweep_outcome(
    sweep_codecs: &HashMap<Id, String>,
    joined: Result<(Id, CodecResult), JoinError>,
) -> Result<CodecResult, OrchestrationError> {
    joined.map(|(_, result)| result).map_err(|e| {
        let codec = sweep_codecs
            .get(&e.id())
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        OrchestrationError::SweepFailed {
            codec,
            reason: e.to_string(),
        }
    })
}

/// Source must be a regular file that can be opened
async fn check_source(source: &std::path::Path) -> Result<(), OrchestrationError> {
    let unreadable = |reason: String| OrchestrationError::SourceUnreadable {
        path: source.to_path_buf(),
        reason,
    };

    let metadata = tokio::fs::metadata(source)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable("not a regular file".to_string()));
    }
    tokio::fs::File::open(source)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    Ok(())
}

/// BD-Rate of each codec against the one requested before it
fn consecutive_bd_rates(
    resolved: &ResolvedRequest,
    results: &BTreeMap<String, CodecResult>,
) -> BTreeMap<String, BdRateResult> {
    resolved
        .codecs
        .windows(2)
        .filter_map(|pair| {
            let (reference_id, comparison_id) = (&pair[0].0, &pair[1].0);
            let reference = results.get(reference_id)?;
            let comparison = results.get(comparison_id)?;
            let result = bd_rate::compare(reference, comparison, &resolved.metrics);
            for (metric, failure) in &result.failures {
                debug!(
                    reference = %reference_id,
                    comparison = %comparison_id,
                    %metric,
                    error = %failure,
                    "BD-Rate not computed"
                );
            }
            Some((bd_rate::pair_key(reference_id, comparison_id), result))
        })
        .collect()
}
