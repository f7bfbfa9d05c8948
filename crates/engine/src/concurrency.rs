//! Concurrency planning for the benchmark engine
//!
//! Derives the global heavy-task budget from CPU core count and configuration,
//! and provides the process-wide semaphore that enforces it.

use crate::config::Config;
use std::sync::{Arc, OnceLock};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Threads a single encoder instance is expected to keep busy when the
/// budget is derived automatically
const THREADS_PER_TASK: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Maximum number of encode/measure tasks in flight across all jobs
    pub max_concurrent_tasks: u32,
    /// Threads handed to each encoder invocation
    pub encoder_threads: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Uses an explicit non-zero max_concurrent_tasks unchanged, otherwise
    ///   derives max(1, target_threads / 8)
    /// - Splits target threads evenly across the concurrent tasks
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let max_concurrent_tasks = if cfg.engine.max_concurrent_tasks > 0 {
            cfg.engine.max_concurrent_tasks
        } else {
            derive_max_tasks(target_threads)
        };

        let encoder_threads = (target_threads / max_concurrent_tasks).max(1);

        Self {
            total_cores,
            target_threads,
            max_concurrent_tasks,
            encoder_threads,
        }
    }
}

fn derive_max_tasks(target_threads: u32) -> u32 {
    (target_threads / THREADS_PER_TASK).max(1)
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

/// Global bounded budget for heavy tasks
///
/// Cloning shares the same underlying semaphore, so every clone handed to a
/// job draws from one process-wide pool of permits.
#[derive(Debug, Clone)]
pub struct TaskBudget {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TaskBudget {
    /// Create a budget with `limit` permits (at least one)
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// The process-wide budget shared by every service and job
    ///
    /// The first caller decides the size; later callers get the same pool
    /// whatever `limit` they pass.
    pub fn global(limit: usize) -> &'static TaskBudget {
        static GLOBAL: OnceLock<TaskBudget> = OnceLock::new();
        GLOBAL.get_or_init(|| TaskBudget::new(limit))
    }

    /// Configured number of permits
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Get the number of available permits
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire a permit, waiting until one is free
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }
}
