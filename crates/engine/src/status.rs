//! Job status store
//!
//! Process-wide map from job id to [`Job`]. The orchestrator writes through
//! [`StatusStore::update`], which applies every change to a job atomically and
//! enforces the lifecycle rules; pollers read cloned snapshots.

use crate::bd_rate::BdRateResult;
use crate::config::Metric;
use crate::probe::SourceInfo;
use crate::rd::CodecResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::RwLock;

/// Lifecycle state of an analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Starting,
    Processing,
    Complete,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Processing => "processing",
            JobState::Complete => "complete",
            JobState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// Whether `next` may directly follow this state
    ///
    /// Staying in the same non-terminal state is allowed.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Starting, Starting)
                | (Starting, Processing)
                | (Processing, Processing)
                | (Processing, Complete)
                | (Processing, Error)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Results attached to a job
///
/// Filled incrementally while codecs finish; final once the job is complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_info: Option<SourceInfo>,
    pub codec_results: BTreeMap<String, CodecResult>,
    pub bd_rates: BTreeMap<String, BdRateResult>,
}

/// One submitted analysis job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub source: PathBuf,
    /// Codec ids in request order
    pub codecs: Vec<String>,
    /// Resolved quality settings per codec, in sweep order
    pub quality_settings: BTreeMap<String, Vec<u32>>,
    pub metrics: BTreeSet<Metric>,
    pub state: JobState,
    pub progress_percent: f32,
    pub current_task: String,
    pub results: Option<AnalysisResults>,
    pub error_message: Option<String>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

impl Job {
    /// A freshly submitted job in `Starting`
    pub fn new(id: impl Into<String>, source: PathBuf, codecs: Vec<String>) -> Self {
        let now = timestamp_ms();
        Self {
            id: id.into(),
            source,
            codecs,
            quality_settings: BTreeMap::new(),
            metrics: BTreeSet::new(),
            state: JobState::Starting,
            progress_percent: 0.0,
            current_task: "Initializing...".to_string(),
            results: None,
            error_message: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id.clone(),
            state: self.state,
            progress_percent: self.progress_percent,
            current_task: self.current_task.clone(),
            error_message: self.error_message.clone(),
            updated_at_unix_ms: self.updated_at_unix_ms,
        }
    }

    /// Results container, created on first use
    pub fn results_mut(&mut self) -> &mut AnalysisResults {
        self.results.get_or_insert_with(AnalysisResults::default)
    }
}

/// Polling view of a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub progress_percent: f32,
    pub current_task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at_unix_ms: i64,
}

/// Error type for status store operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StatusError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job {id} is not complete (state: {state})")]
    NotComplete { id: String, state: JobState },

    #[error("job {id} is already {state}")]
    Terminal { id: String, state: JobState },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
}

/// Concurrency-safe job map
///
/// Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store, created on first use
    pub fn global() -> &'static StatusStore {
        static GLOBAL: OnceLock<StatusStore> = OnceLock::new();
        GLOBAL.get_or_init(StatusStore::new)
    }

    pub async fn insert(&self, job: Job) -> Result<(), StatusError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StatusError::Duplicate(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Apply `mutate` to a job as one atomic change
    ///
    /// The change is rejected, leaving the job untouched, when the job is
    /// already terminal or the new state is not a legal successor. Progress
    /// never decreases and is capped at 100.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<JobStatus, StatusError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(id)
            .ok_or_else(|| StatusError::NotFound(id.to_string()))?;

        if current.state.is_terminal() {
            return Err(StatusError::Terminal {
                id: id.to_string(),
                state: current.state,
            });
        }

        let mut next = current.clone();
        mutate(&mut next);

        if !current.state.can_transition_to(next.state) {
            return Err(StatusError::IllegalTransition {
                from: current.state,
                to: next.state,
            });
        }

        let progress = if next.progress_percent.is_finite() {
            next.progress_percent
        } else {
            current.progress_percent
        };
        next.progress_percent = progress.clamp(current.progress_percent, 100.0);
        next.id = current.id.clone();
        next.created_at_unix_ms = current.created_at_unix_ms;
        next.updated_at_unix_ms = timestamp_ms().max(current.updated_at_unix_ms);

        *current = next;
        Ok(current.status())
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn get_status(&self, id: &str) -> Result<JobStatus, StatusError> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(Job::status)
            .ok_or_else(|| StatusError::NotFound(id.to_string()))
    }

    /// Final results of a complete job
    pub async fn get_results(&self, id: &str) -> Result<AnalysisResults, StatusError> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(id)
            .ok_or_else(|| StatusError::NotFound(id.to_string()))?;

        match (&job.state, &job.results) {
            (JobState::Complete, Some(results)) => Ok(results.clone()),
            _ => Err(StatusError::NotComplete {
                id: id.to_string(),
                state: job.state,
            }),
        }
    }
}

/// Get current timestamp in milliseconds
fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
