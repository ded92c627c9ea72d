//! Batch profiling experiments over a local LLM.
//!
//! Iterates queries × runs, profiles each invocation (latency, CPU, memory,
//! sampled timeline), persists one JSON record per invocation, and maintains
//! the experiment manifest. Individual invocation failures are recorded and
//! the batch keeps going; only a persistence failure of both write locations
//! aborts the run.

mod manifest;
mod queries;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use ollama_client::OllamaClient;
use workload_profiler::{ResultPersister, WorkError, WorkloadProfiler};

use crate::manifest::{ExperimentManifest, ExperimentMetadata, human_duration};

#[derive(Debug, Parser)]
#[command(
    name = "experiment_runner",
    about = "Profile CPU/memory/latency of local LLM inference across queries and runs"
)]
struct Args {
    /// Path to the query JSON file (array of {"id", "query"} objects).
    #[arg(long)]
    queries: PathBuf,

    /// Number of runs per query.
    #[arg(long)]
    runs: u32,

    /// Ollama model to use.
    #[arg(long, default_value = "llama3.2-cpu")]
    model: String,

    /// Output directory for results.
    #[arg(long, default_value = "profiling_data")]
    output: PathBuf,

    /// Timeout per query in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Use a sleep-based mock work function instead of Ollama.
    #[arg(long)]
    mock: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Args::parse())
}

fn run(args: Args) -> Result<()> {
    let queries = queries::load(&args.queries)?;
    let mut profiler = WorkloadProfiler::new(&args.output)?;
    let persister = ResultPersister::new(&args.output);

    if !args.mock {
        preflight(&args.model)?;
    }

    let client = OllamaClient::new(&args.model, Duration::from_secs(args.timeout));
    let total = queries.len() * args.runs as usize;

    let mut manifest = ExperimentManifest::new(
        ExperimentMetadata {
            query_file: args.queries.display().to_string(),
            num_queries: queries.len(),
            runs_per_query: args.runs,
            total_profiles: total,
            model: args.model.clone(),
            output_dir: args.output.display().to_string(),
            timeout_secs: args.timeout,
            mock: args.mock,
        },
        profiler.topology().clone(),
    );
    manifest.save(&args.output)?;

    log::info!("starting experiment: {} queries × {} runs = {total} profiles", queries.len(), args.runs);
    log::info!("model: {} (timeout {}s{})", args.model, args.timeout, if args.mock { ", mocked" } else { "" });
    log::info!("system: {}", profiler.topology().summary());
    log::info!("output: {}", args.output.display());

    let experiment_started = Instant::now();
    let mut completed = 0usize;

    for query in &queries {
        for run_id in 0..args.runs {
            completed += 1;
            log::info!(
                "[{completed}/{total}] query {} run {}/{}: {:.60}",
                query.id,
                run_id + 1,
                args.runs,
                query.query,
            );

            let metrics = profiler.profile_invocation(&query.query, query.id, run_id, |prompt| {
                if args.mock {
                    mock_work(prompt)
                } else {
                    client.generate(prompt).map_err(WorkError::from)
                }
            });

            if metrics.success {
                log::info!(
                    "  ok: {:.0}ms, cpu {:.1}%, memory {:.2}GB, {} samples",
                    metrics.latency.total_ms,
                    metrics.cpu.average_percent,
                    metrics.memory.used_gb,
                    metrics.timeline_summary.num_samples.unwrap_or(0),
                );
                manifest.record_success();
            } else {
                let error = metrics.error.clone().unwrap_or_default();
                log::error!("  failed: {error}");
                manifest.record_failure(query.id, run_id, error);
            }

            // Losing a completed measurement is worse than stopping the batch.
            persister.persist(&metrics)?;

            let elapsed = experiment_started.elapsed().as_secs_f64();
            let eta_secs = elapsed / completed as f64 * (total - completed) as f64;
            log::info!(
                "  progress: {:.1}% | eta ~{}",
                completed as f64 / total as f64 * 100.0,
                human_duration(eta_secs as u64),
            );
        }
    }

    let duration_secs = experiment_started.elapsed().as_secs();
    manifest.finish(duration_secs);
    manifest.save(&args.output)?;

    let summary = &manifest.results_summary;
    log::info!("experiment complete in {}", human_duration(duration_secs));
    log::info!(
        "{} attempted, {} successful ({:.1}%), {} failed",
        summary.total_attempted,
        summary.successful,
        summary.success_rate_percent,
        summary.failed,
    );
    log::info!("results in {}", args.output.display());
    Ok(())
}

/// Fail fast before a multi-hour batch: a missing service or model should
/// surface immediately, not as the first timed-out invocation.
fn preflight(model: &str) -> Result<()> {
    log::info!("preflight: checking ollama service");
    if !ollama_client::service_running() {
        bail!("ollama is not running; start it with `ollama serve` and retry");
    }
    log::info!("preflight: checking model '{model}'");
    if !ollama_client::model_available(model) {
        bail!("model '{model}' not found; fetch it with `ollama pull {model}` and retry");
    }
    log::info!("preflight passed");
    Ok(())
}

/// Deterministic stand-in for inference: sleeps 1–3 s depending on the
/// prompt, then answers with a short echo.
fn mock_work(prompt: &str) -> Result<String, WorkError> {
    let millis = 1000 + (prompt.len() as u64 * 37) % 2000;
    thread::sleep(Duration::from_millis(millis));
    Ok(format!("mock response to: {:.50}", prompt))
}
