//! workload_profiler — CPU/memory workload characterization for local LLM
//! inference.
//!
//! Wraps an arbitrary unit of work (one model invocation), brackets it with
//! resource snapshots, runs a background timeline sampler for its duration,
//! and reduces the sampled timeline into per-invocation summary statistics —
//! with awareness of heterogeneous (performance/efficiency) core layouts on
//! Apple Silicon.
//!
//! Profiling and persistence are independently callable: the profiler returns
//! an [`InvocationMetrics`] and the orchestrator decides when to hand it to a
//! [`ResultPersister`]. The only file the profiler writes itself is the
//! one-time `system_info.json` at construction.

pub mod metrics;
pub mod persist;
pub mod sampler;
pub mod topology;

pub use metrics::{
    CpuMetrics, InvocationIdentity, InvocationMetrics, LatencyMetrics, MemoryMetrics,
    ResponseMetrics, TimelineSummary, WorkError,
};
pub use persist::ResultPersister;
pub use sampler::{DEFAULT_SAMPLING_INTERVAL, ResourceSnapshot, Sample, TimelineSampler};
pub use topology::{CoreLayout, CoreLayoutEntry, CoreLayoutTable, HardwareTopology};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use sysinfo::System;

/// Name of the topology file written once per profiler instance.
pub const SYSTEM_INFO_FILENAME: &str = "system_info.json";

/// Construction-time knobs. The defaults match the validated experiment
/// setup: 0.5 s sampling and the built-in Apple Silicon layout table.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub sampling_interval: Duration,
    pub core_layout_table: CoreLayoutTable,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            core_layout_table: CoreLayoutTable::apple_silicon(),
        }
    }
}

/// Profiles one invocation at a time: one sampler, strictly sequential use.
/// Profile concurrent invocations with one instance each.
pub struct WorkloadProfiler {
    output_dir: PathBuf,
    topology: HardwareTopology,
    sampler: TimelineSampler,
    system: System,
}

impl WorkloadProfiler {
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(output_dir, ProfilerConfig::default())
    }

    /// Detect the hardware topology, create the output directory, and write
    /// `system_info.json`.
    pub fn with_config(output_dir: impl AsRef<Path>, config: ProfilerConfig) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;

        let topology = HardwareTopology::detect(&config.core_layout_table);
        let info_path = output_dir.join(SYSTEM_INFO_FILENAME);
        let json = serde_json::to_string_pretty(&topology).context("serializing topology")?;
        fs::write(&info_path, json)
            .with_context(|| format!("writing {}", info_path.display()))?;

        log::info!(
            "workload profiler initialized: output={} interval={:?}",
            output_dir.display(),
            config.sampling_interval,
        );

        Ok(Self {
            output_dir,
            topology,
            sampler: TimelineSampler::new(config.sampling_interval),
            system: ResourceSnapshot::system(),
        })
    }

    pub fn topology(&self) -> &HardwareTopology {
        &self.topology
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Profile one execution of `work` end to end.
    ///
    /// Never returns an error: a timeout or failure from the work function is
    /// recorded in the returned metrics (`success == false`, `error` set) and
    /// latency, CPU, memory, and the timeline are populated on every path;
    /// resource behavior during a failed call is itself diagnostic data.
    pub fn profile_invocation<F>(
        &mut self,
        query_text: &str,
        query_id: u32,
        run_id: u32,
        work: F,
    ) -> InvocationMetrics
    where
        F: FnOnce(&str) -> Result<String, WorkError>,
    {
        let metadata = InvocationIdentity {
            query_id,
            run_id,
            timestamp: Utc::now().to_rfc3339(),
            query_text: query_text.to_string(),
        };

        self.sampler.start();
        // Warms the CPU delta baseline. The "before" numbers are not part of
        // the reported record; only the post-execution snapshot is.
        let _ = ResourceSnapshot::capture(&mut self.system);

        let started = Instant::now();
        let outcome = work(query_text);
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        // Post-execution snapshot happens on every path, before the sampler
        // is torn down.
        let after = ResourceSnapshot::capture(&mut self.system);
        let timeline = self.sampler.stop();
        let timeline_summary = TimelineSummary::from_timeline(&timeline);

        let (success, error, length_chars) = match outcome {
            Ok(response) => {
                log::debug!(
                    "query {query_id} run {run_id}: {} chars in {total_ms:.0}ms",
                    response.chars().count()
                );
                (true, None, response.chars().count())
            }
            Err(err) => {
                if err.is_timeout() {
                    log::warn!("query {query_id} run {run_id} timed out: {err}");
                } else {
                    log::warn!("query {query_id} run {run_id} failed: {err}");
                }
                (false, Some(err.to_string()), 0)
            }
        };

        let (p_cores_average, e_cores_average) = match &self.topology.core_layout {
            Some(layout) => layout.split_averages(&after.per_core_percent),
            None => (None, None),
        };

        let cpu = CpuMetrics {
            // Prefer the timeline view of the whole window; fall back to the
            // post-execution instant when the call outran the sampler.
            peak_percent: timeline_summary
                .cpu_peak_percent
                .unwrap_or(after.cpu_total_percent),
            average_percent: timeline_summary
                .cpu_average_percent
                .unwrap_or(after.cpu_total_percent),
            per_core: after.per_core_percent,
            p_cores_average,
            e_cores_average,
        };

        InvocationMetrics {
            metadata,
            success,
            error,
            latency: LatencyMetrics { total_ms },
            cpu,
            memory: MemoryMetrics {
                used_gb: after.memory_used_gb,
                percent: after.memory_percent,
            },
            response: ResponseMetrics { length_chars },
            timeline,
            timeline_summary,
        }
    }
}
