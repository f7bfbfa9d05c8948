//! Benchmark service assembly
//!
//! Wires configuration, startup checks, the concurrency budget and the FFmpeg
//! collaborators into a ready [`Orchestrator`].

use crate::concurrency::{derive_plan, ConcurrencyPlan, TaskBudget};
use crate::config::{CodecCatalog, Config, ConfigError, MetricInfo};
use crate::encode::{Encoder, FfmpegEncoder};
use crate::measure::{FfmpegMeter, QualityMeter};
use crate::orchestrator::{JobRequest, OrchestrationError, Orchestrator};
use crate::sampler::MetricSampler;
use crate::startup::{run_startup_checks, StartupError, StartupReport};
use crate::status::{AnalysisResults, Job, JobStatus, StatusError, StatusStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for service construction
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),
}

/// Running benchmark engine with all components in place
pub struct BenchService {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Heavy-task budget the orchestrator draws from
    pub budget: TaskBudget,
    /// Preflight findings, absent when checks were skipped
    pub startup: Option<StartupReport>,
    orchestrator: Orchestrator,
}

impl BenchService {
    /// Initialize the service with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file (defaults when the file is missing)
    /// 2. Apply environment overrides and validate
    /// 3. Run startup checks (ffmpeg, ffprobe, catalog encoders)
    /// 4. Derive concurrency plan and build the collaborators
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ServiceError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the service with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, ServiceError> {
        config.validate()?;
        let report = run_startup_checks(&config)?;

        let mut service = Self::new_without_checks(config);
        service.startup = Some(report);
        Ok(service)
    }

    /// Initialize the service without running startup checks
    ///
    /// Uses the FFmpeg collaborators, the process-wide status store and the
    /// process-wide task budget.
    pub fn new_without_checks(config: Config) -> Self {
        let plan = derive_plan(&config);
        let encoder = FfmpegEncoder::new(config.engine.work_dir.clone(), plan.encoder_threads);

        let budget = TaskBudget::global(plan.max_concurrent_tasks as usize);
        if budget.limit() != plan.max_concurrent_tasks as usize {
            warn!(
                planned = plan.max_concurrent_tasks,
                limit = budget.limit(),
                "task budget already sized by an earlier service; keeping its limit"
            );
        }

        Self::with_collaborators(
            config,
            Arc::new(encoder),
            Arc::new(FfmpegMeter::new()),
            StatusStore::global().clone(),
            budget.clone(),
        )
    }

    /// Initialize the service around caller-provided collaborators
    pub fn with_collaborators(
        config: Config,
        encoder: Arc<dyn Encoder>,
        meter: Arc<dyn QualityMeter>,
        store: StatusStore,
        budget: TaskBudget,
    ) -> Self {
        let concurrency_plan = derive_plan(&config);

        info!(
            cores = concurrency_plan.total_cores,
            tasks = budget.limit(),
            encoder_threads = concurrency_plan.encoder_threads,
            "concurrency plan derived"
        );

        let sampler = MetricSampler::new(
            encoder,
            meter,
            budget.clone(),
            Duration::from_secs(config.engine.encode_timeout_secs),
            config.engine.keep_artifacts,
        );
        let orchestrator = Orchestrator::new(
            config.codecs.clone(),
            sampler,
            store,
            Duration::from_secs(config.engine.analysis_timeout_secs),
        );

        Self {
            config,
            concurrency_plan,
            budget,
            startup: None,
            orchestrator,
        }
    }

    pub async fn submit_job(&self, request: JobRequest) -> Result<String, OrchestrationError> {
        self.orchestrator.submit_job(request).await
    }

    pub async fn get_status(&self, id: &str) -> Result<JobStatus, StatusError> {
        self.orchestrator.get_status(id).await
    }

    pub async fn get_results(&self, id: &str) -> Result<AnalysisResults, StatusError> {
        self.orchestrator.get_results(id).await
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.orchestrator.get_job(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<(), StatusError> {
        self.orchestrator.cancel_job(id).await
    }

    pub fn supported_codecs(&self) -> &CodecCatalog {
        self.orchestrator.supported_codecs()
    }

    pub fn supported_metrics(&self) -> Vec<MetricInfo> {
        self.orchestrator.supported_metrics()
    }
}
