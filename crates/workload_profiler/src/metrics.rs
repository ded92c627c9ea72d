//! Per-invocation metrics records and the JSON shape they persist to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sampler::Sample;

/// Identifies one profiled invocation within an experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationIdentity {
    pub query_id: u32,
    pub run_id: u32,
    /// RFC 3339 wall-clock timestamp taken when profiling began.
    pub timestamp: String,
    pub query_text: String,
}

/// Error vocabulary for the externally supplied work function. A timeout is
/// distinguishable from every other failure; both are recorded in the metrics
/// record rather than propagated.
#[derive(Debug, Clone, Error)]
pub enum WorkError {
    #[error("timed out after {after_secs:.1}s")]
    TimedOut { after_secs: f64 },
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
}

impl WorkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkError::TimedOut { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// End-to-end milliseconds around the work-function call only, measured
    /// on the monotonic clock.
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub peak_percent: f32,
    pub average_percent: f32,
    /// Per-core percentages at the post-execution instant.
    pub per_core: Vec<f32>,
    /// Mean P-core load at the post-execution instant; `None` on machines
    /// without a core classification.
    pub p_cores_average: Option<f32>,
    pub e_cores_average: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub used_gb: f64,
    pub percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub length_chars: usize,
}

/// Reduction of one timeline. All four fields are `Some` together or `None`
/// together; [`TimelineSummary::from_timeline`] is the only constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSummary {
    pub cpu_peak_percent: Option<f32>,
    pub cpu_average_percent: Option<f32>,
    pub memory_peak_gb: Option<f64>,
    pub num_samples: Option<usize>,
}

impl TimelineSummary {
    pub fn from_timeline(timeline: &[Sample]) -> Self {
        if timeline.is_empty() {
            return Self {
                cpu_peak_percent: None,
                cpu_average_percent: None,
                memory_peak_gb: None,
                num_samples: None,
            };
        }

        let cpu_peak = timeline
            .iter()
            .map(|sample| sample.cpu_total_percent)
            .fold(f32::MIN, f32::max);
        let cpu_average = timeline
            .iter()
            .map(|sample| sample.cpu_total_percent)
            .sum::<f32>()
            / timeline.len() as f32;
        let memory_peak = timeline
            .iter()
            .map(|sample| sample.memory_gb)
            .fold(f64::MIN, f64::max);

        Self {
            cpu_peak_percent: Some(cpu_peak),
            cpu_average_percent: Some(cpu_average),
            memory_peak_gb: Some(memory_peak),
            num_samples: Some(timeline.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples.is_none()
    }
}

/// The complete record for one profiled invocation. Assembled once by the
/// profiler, then immutable; persisted exactly once by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMetrics {
    pub metadata: InvocationIdentity,
    pub success: bool,
    /// Present iff `success` is false.
    pub error: Option<String>,
    pub latency: LatencyMetrics,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub response: ResponseMetrics,
    pub timeline: Vec<Sample>,
    pub timeline_summary: TimelineSummary,
}

impl InvocationMetrics {
    /// Deterministic per-identity filename, so re-running an identity
    /// overwrites its record instead of duplicating it.
    pub fn filename(&self) -> String {
        format!(
            "query_{:03}_run_{:02}.json",
            self.metadata.query_id, self.metadata.run_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(elapsed_secs: f64, cpu_total: f32, memory_gb: f64) -> Sample {
        Sample {
            elapsed_secs,
            cpu_total_percent: cpu_total,
            per_core_percent: vec![cpu_total / 2.0; 2],
            memory_gb,
            memory_percent: 50.0,
        }
    }

    #[test]
    fn test_summary_of_empty_timeline_is_all_none() {
        let summary = TimelineSummary::from_timeline(&[]);
        assert!(summary.is_empty());
        assert!(summary.cpu_peak_percent.is_none());
        assert!(summary.cpu_average_percent.is_none());
        assert!(summary.memory_peak_gb.is_none());
        assert!(summary.num_samples.is_none());
    }

    #[test]
    fn test_summary_reduces_peak_and_average() {
        let timeline = [
            sample(0.5, 100.0, 8.0),
            sample(1.0, 300.0, 9.5),
            sample(1.5, 200.0, 9.0),
        ];
        let summary = TimelineSummary::from_timeline(&timeline);
        assert_eq!(summary.cpu_peak_percent, Some(300.0));
        assert_eq!(summary.cpu_average_percent, Some(200.0));
        assert_eq!(summary.memory_peak_gb, Some(9.5));
        assert_eq!(summary.num_samples, Some(3));
        assert!(summary.cpu_peak_percent >= summary.cpu_average_percent);
    }

    #[test]
    fn test_summary_of_single_sample() {
        let summary = TimelineSummary::from_timeline(&[sample(0.5, 150.0, 4.0)]);
        assert_eq!(summary.cpu_peak_percent, Some(150.0));
        assert_eq!(summary.cpu_average_percent, Some(150.0));
        assert_eq!(summary.num_samples, Some(1));
    }

    #[test]
    fn test_filename_is_zero_padded_and_deterministic() {
        let metrics = InvocationMetrics {
            metadata: InvocationIdentity {
                query_id: 7,
                run_id: 3,
                timestamp: "2025-11-19T12:00:00+00:00".to_string(),
                query_text: "q".to_string(),
            },
            success: true,
            error: None,
            latency: LatencyMetrics { total_ms: 1234.5 },
            cpu: CpuMetrics {
                peak_percent: 0.0,
                average_percent: 0.0,
                per_core: Vec::new(),
                p_cores_average: None,
                e_cores_average: None,
            },
            memory: MemoryMetrics {
                used_gb: 0.0,
                percent: 0.0,
            },
            response: ResponseMetrics { length_chars: 0 },
            timeline: Vec::new(),
            timeline_summary: TimelineSummary::from_timeline(&[]),
        };
        assert_eq!(metrics.filename(), "query_007_run_03.json");
    }

    #[test]
    fn test_work_error_display_and_kind() {
        let timeout = WorkError::TimedOut { after_secs: 300.0 };
        assert!(timeout.is_timeout());
        assert!(timeout.to_string().contains("timed out after 300.0s"));

        let failed = WorkError::Failed {
            kind: "RuntimeError".to_string(),
            message: "model not loaded".to_string(),
        };
        assert!(!failed.is_timeout());
        assert_eq!(failed.to_string(), "RuntimeError: model not loaded");
    }
}
