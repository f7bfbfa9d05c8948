//! Codec Bench
//!
//! Video codec benchmarking engine: sweeps codecs over quality settings under
//! a bounded task budget, measures rate-distortion points and compares codecs
//! with BD-Rate.

pub mod bd_rate;
pub mod concurrency;
pub mod encode;
pub mod measure;
pub mod orchestrator;
pub mod probe;
pub mod rd;
pub mod sampler;
pub mod service;
pub mod startup;
pub mod status;
pub mod sweep;

#[cfg(test)]
mod test_support;

pub use codec_bench_config as config;
pub use codec_bench_config::{CodecCatalog, CodecSpec, Config, Metric};
pub use bd_rate::{compare, compute, pair_key, BdRateError, BdRateResult};
pub use concurrency::{derive_plan, ConcurrencyPlan, TaskBudget};
pub use encode::{EncodeError, EncodedArtifact, Encoder, FfmpegEncoder, PartialOutput};
pub use measure::{FfmpegMeter, Measurement, MetricError, QualityMeter};
pub use orchestrator::{JobRequest, OrchestrationError, Orchestrator};
pub use probe::{probe_file, ProbeError, SourceInfo};
pub use rd::{CodecResult, RdPoint, SampleDiagnostic, SampleStage, MIN_BD_RATE_POINTS};
pub use sampler::{MetricSampler, SampleError};
pub use service::{BenchService, ServiceError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
pub use status::{AnalysisResults, Job, JobState, JobStatus, StatusError, StatusStore};
pub use sweep::CodecSweepRunner;
