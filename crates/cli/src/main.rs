//! CLI entry point for Codec Bench
//!
//! Parses command line arguments, builds the benchmark service and drives a
//! single analysis job to completion.

use clap::{Parser, Subcommand};
use codec_bench::{BenchService, Config, JobRequest, JobState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Codec Bench - rate-distortion and BD-Rate comparison of video codecs
#[derive(Parser, Debug)]
#[command(name = "codec-bench")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "codec-bench.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the codec catalog and supported metrics
    Codecs,

    /// Benchmark codecs on a source video
    Run {
        /// Source video file
        source: PathBuf,

        /// Codec id to benchmark; repeat for several (order sets BD-Rate pairs)
        #[arg(long = "codec", required = true)]
        codecs: Vec<String>,

        /// Quality settings for one codec, e.g. `h264=18,23,28,33`
        #[arg(long = "quality", value_parser = parse_quality_spec)]
        qualities: Vec<(String, Vec<u32>)>,

        /// Metric to compute; repeat for several (default: all)
        #[arg(long = "metric")]
        metrics: Vec<String>,

        /// Write results to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Skip startup checks (ffmpeg, ffprobe, encoders)
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
}

/// Parse `<codec>=<q>,<q>,...`
fn parse_quality_spec(s: &str) -> Result<(String, Vec<u32>), String> {
    let (codec, list) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <codec>=<q,q,...>, got '{}'", s))?;

    let codec = codec.trim();
    if codec.is_empty() {
        return Err(format!("missing codec id in '{}'", s));
    }

    let qualities = list
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| {
            q.parse::<u32>()
                .map_err(|_| format!("invalid quality '{}' for codec '{}'", q, codec))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((codec.to_string(), qualities))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Codecs => list_codecs(&args.config),
        Command::Run {
            source,
            codecs,
            qualities,
            metrics,
            output,
            skip_checks,
        } => {
            let service = if skip_checks {
                warn!("skipping startup checks (--skip-checks enabled)");
                Config::load_or_default(&args.config)
                    .map(BenchService::new_without_checks)
                    .map_err(|e| e.into())
            } else {
                BenchService::new(&args.config)
            };

            let service = match service {
                Ok(service) => service,
                Err(e) => {
                    error!("failed to initialize: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            let request = JobRequest {
                source,
                codecs,
                qualities: qualities.into_iter().collect::<BTreeMap<_, _>>(),
                metrics,
            };
            run_job(&service, request, output).await
        }
    }
}

fn list_codecs(config_path: &Path) -> ExitCode {
    let config = match Config::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Codecs:");
    for (id, spec) in &config.codecs {
        println!(
            "  {:<8} {:<12} {} {} (range {}, default {:?})",
            id, spec.name, spec.encoder, spec.quality_param, spec.quality_range, spec.default_qualities
        );
    }
    println!("Metrics:");
    for metric in codec_bench::Metric::ALL {
        let info = metric.info();
        println!("  {:<8} {} [{}]", metric, info.description, info.unit);
    }
    ExitCode::SUCCESS
}

async fn run_job(service: &BenchService, request: JobRequest, output: Option<PathBuf>) -> ExitCode {
    let id = match service.submit_job(request).await {
        Ok(id) => id,
        Err(e) => {
            error!("failed to submit job: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(job_id = %id, "job submitted");

    let mut interrupted = false;
    let status = loop {
        let status = match service.get_status(&id).await {
            Ok(status) => status,
            Err(e) => {
                error!("status lookup failed: {}", e);
                return ExitCode::FAILURE;
            }
        };
        eprintln!(
            "[{:>5.1}%] {} - {}",
            status.progress_percent, status.state, status.current_task
        );
        if status.state.is_terminal() {
            break status;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(job_id = %id, "interrupt received, cancelling job");
                if let Err(e) = service.cancel_job(&id).await {
                    warn!("cancel failed: {}", e);
                }
            }
        }
    };

    if status.state == JobState::Error {
        error!(
            job_id = %id,
            "analysis failed: {}",
            status.error_message.as_deref().unwrap_or("unknown error")
        );
        return ExitCode::FAILURE;
    }

    let results = match service.get_results(&id).await {
        Ok(results) => results,
        Err(e) => {
            error!("failed to fetch results: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let json = match serde_json::to_string_pretty(&results) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize results: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, json) {
                error!("failed to write {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
            info!(path = %path.display(), "results written");
        }
        None => println!("{}", json),
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quality_spec() {
        assert_eq!(
            parse_quality_spec("h264=18, 23,28,33").unwrap(),
            ("h264".to_string(), vec![18, 23, 28, 33])
        );
        assert_eq!(
            parse_quality_spec("hevc=").unwrap(),
            ("hevc".to_string(), Vec::new())
        );
        assert!(parse_quality_spec("h264").is_err());
        assert!(parse_quality_spec("=18").is_err());
        assert!(parse_quality_spec("h264=18,x").is_err());
    }

    #[test]
    fn test_cli_args_parse() {
        let args = Args::try_parse_from([
            "codec-bench",
            "run",
            "clip.mkv",
            "--codec",
            "h264",
            "--codec",
            "hevc",
            "--quality",
            "h264=20,30",
            "--metric",
            "psnr",
        ])
        .unwrap();

        match args.command {
            Command::Run {
                source,
                codecs,
                qualities,
                metrics,
                output,
                skip_checks,
            } => {
                assert_eq!(source, PathBuf::from("clip.mkv"));
                assert_eq!(codecs, vec!["h264", "hevc"]);
                assert_eq!(qualities, vec![("h264".to_string(), vec![20, 30])]);
                assert_eq!(metrics, vec!["psnr"]);
                assert!(output.is_none());
                assert!(!skip_checks);
            }
            Command::Codecs => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_codec() {
        assert!(Args::try_parse_from(["codec-bench", "run", "clip.mkv"]).is_err());
    }
}
