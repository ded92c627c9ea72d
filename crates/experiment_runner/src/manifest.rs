//! The experiment manifest written alongside per-invocation records.
//!
//! `experiment_config.json` is written once at startup (so a crashed run
//! still documents what it attempted) and rewritten with final numbers when
//! the batch completes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use workload_profiler::HardwareTopology;

pub const MANIFEST_FILENAME: &str = "experiment_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifest {
    pub experiment_metadata: ExperimentMetadata,
    pub system_info: HardwareTopology,
    pub execution_info: ExecutionInfo,
    pub results_summary: ResultsSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub query_file: String,
    pub num_queries: usize,
    pub runs_per_query: u32,
    pub total_profiles: usize,
    pub model: String,
    pub output_dir: String,
    pub timeout_secs: u64,
    pub mock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub timestamp_start: String,
    pub timestamp_end: Option<String>,
    pub duration_seconds: Option<u64>,
    pub duration_human: Option<String>,
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate_percent: f64,
    pub failed_invocations: Vec<FailedInvocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedInvocation {
    pub query_id: u32,
    pub run_id: u32,
    pub error: String,
}

impl ExperimentManifest {
    pub fn new(metadata: ExperimentMetadata, system_info: HardwareTopology) -> Self {
        Self {
            experiment_metadata: metadata,
            system_info,
            execution_info: ExecutionInfo {
                timestamp_start: Utc::now().to_rfc3339(),
                timestamp_end: None,
                duration_seconds: None,
                duration_human: None,
                command: std::env::args().collect::<Vec<_>>().join(" "),
            },
            results_summary: ResultsSummary::default(),
        }
    }

    pub fn record_success(&mut self) {
        self.results_summary.total_attempted += 1;
        self.results_summary.successful += 1;
        self.update_success_rate();
    }

    pub fn record_failure(&mut self, query_id: u32, run_id: u32, error: String) {
        self.results_summary.total_attempted += 1;
        self.results_summary.failed += 1;
        self.results_summary.failed_invocations.push(FailedInvocation {
            query_id,
            run_id,
            error,
        });
        self.update_success_rate();
    }

    fn update_success_rate(&mut self) {
        let summary = &mut self.results_summary;
        summary.success_rate_percent = if summary.total_attempted == 0 {
            0.0
        } else {
            summary.successful as f64 / summary.total_attempted as f64 * 100.0
        };
    }

    /// Stamp the end time and total duration.
    pub fn finish(&mut self, duration_secs: u64) {
        self.execution_info.timestamp_end = Some(Utc::now().to_rfc3339());
        self.execution_info.duration_seconds = Some(duration_secs);
        self.execution_info.duration_human = Some(human_duration(duration_secs));
    }

    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(MANIFEST_FILENAME);
        let json = serde_json::to_string_pretty(self).context("serializing manifest")?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        log::debug!("saved experiment manifest to {}", path.display());
        Ok(path)
    }
}

pub fn human_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}h {minutes}m {seconds}s")
}
