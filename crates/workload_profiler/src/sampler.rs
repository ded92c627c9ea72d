//! Background timeline sampling of system-wide CPU and memory usage.
//!
//! A [`TimelineSampler`] owns at most one background thread at a time. The
//! thread captures one [`Sample`] roughly every sampling interval and sends it
//! over a channel; the foreground drains the channel when it calls
//! [`TimelineSampler::stop`]. The sample buffer is therefore never shared —
//! the thread owns its `System` handle and the channel owns the in-flight
//! samples until handoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Target period between consecutive samples.
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(500);

/// How long `stop()` waits for the sampling thread to exit before giving up
/// and returning whatever was collected.
const STOP_WAIT: Duration = Duration::from_secs(2);

/// Granularity of stop-flag checks while the loop sleeps between samples.
const SLEEP_SLICE: Duration = Duration::from_millis(25);

const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// One system-wide measurement, tagged with time elapsed since sampling began.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since `start()`. Monotonic, strictly increasing per timeline.
    #[serde(rename = "t")]
    pub elapsed_secs: f64,
    /// Sum of all per-core percentages. This is a total-load metric, not a
    /// normalized one, so it can exceed 100.
    #[serde(rename = "cpu_total")]
    pub cpu_total_percent: f32,
    #[serde(rename = "per_core")]
    pub per_core_percent: Vec<f32>,
    pub memory_gb: f64,
    pub memory_percent: f32,
}

/// A point-in-time capture, shared by the sampling loop and the invocation
/// profiler's pre/post snapshots.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub per_core_percent: Vec<f32>,
    pub cpu_total_percent: f32,
    pub memory_used_gb: f64,
    pub memory_percent: f32,
}

impl ResourceSnapshot {
    /// A `System` configured to refresh only what snapshots need.
    pub fn system() -> System {
        System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        )
    }

    /// Capture current per-core CPU percentages and memory usage.
    ///
    /// Per-core values are deltas since the previous refresh of `system`;
    /// callers that care about the first reading must warm the baseline with
    /// an initial discarded capture.
    pub fn capture(system: &mut System) -> Self {
        system.refresh_cpu_usage();
        system.refresh_memory();

        let per_core_percent: Vec<f32> = system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
        let cpu_total_percent = per_core_percent.iter().sum();

        let total = system.total_memory();
        let used = system.used_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };

        Self {
            per_core_percent,
            cpu_total_percent,
            memory_used_gb: used as f64 / BYTES_PER_GB,
            memory_percent,
        }
    }
}

/// Cancellable background sampler. `Idle → Sampling → Idle`; `start()` while
/// sampling and `stop()` while idle are deliberate no-ops so partial-failure
/// paths in callers stay simple.
pub struct TimelineSampler {
    interval: Duration,
    worker: Option<Worker>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    rx: Receiver<Sample>,
    handle: JoinHandle<()>,
}

impl TimelineSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            worker: None,
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.worker.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begin a new timeline. No-op when already sampling.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            log::warn!("timeline sampler already running; start() ignored");
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let interval = self.interval;
        let stop_flag = Arc::clone(&stop);

        let spawned = thread::Builder::new()
            .name("timeline-sampler".into())
            .spawn(move || sampling_loop(interval, &stop_flag, &tx));

        match spawned {
            Ok(handle) => self.worker = Some(Worker { stop, rx, handle }),
            Err(err) => log::error!("failed to spawn sampling thread: {err}"),
        }
    }

    /// End the current timeline and hand its samples to the caller.
    ///
    /// Returns an empty timeline when idle. The wait for the sampling thread
    /// is bounded: a stuck loop gets abandoned and whatever samples already
    /// reached the channel are still returned.
    pub fn stop(&mut self) -> Vec<Sample> {
        let Some(worker) = self.worker.take() else {
            return Vec::new();
        };
        worker.stop.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + STOP_WAIT;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(SLEEP_SLICE);
        }

        if worker.handle.is_finished() {
            if let Err(panic) = worker.handle.join() {
                log::error!("sampling thread panicked: {panic:?}");
            }
        } else {
            log::warn!(
                "sampling thread did not exit within {STOP_WAIT:?}; returning collected samples"
            );
        }

        worker.rx.try_iter().collect()
    }
}

fn sampling_loop(interval: Duration, stop: &AtomicBool, tx: &Sender<Sample>) {
    let mut system = ResourceSnapshot::system();

    // Warm-up read, discarded: cpu_usage() is a delta against the previous
    // refresh, so without a baseline the first real sample would read 0%.
    system.refresh_cpu_usage();

    let started = Instant::now();
    let mut capture_cost = Duration::ZERO;

    loop {
        // Sleep out the remainder of the interval in short slices so stop()
        // stays responsive. Subtracting the previous capture cost keeps the
        // inter-sample period near the interval, not interval-plus-capture.
        let mut remaining = interval.saturating_sub(capture_cost);
        while remaining > Duration::ZERO {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let capture_started = Instant::now();
        let elapsed_secs = started.elapsed().as_secs_f64();
        let snapshot = ResourceSnapshot::capture(&mut system);
        capture_cost = capture_started.elapsed();

        if snapshot.per_core_percent.is_empty() {
            // A bad read skips one sample; it must not kill the timeline.
            log::warn!("cpu snapshot returned no cores; skipping sample at t={elapsed_secs:.2}s");
            continue;
        }

        let sample = Sample {
            elapsed_secs,
            cpu_total_percent: snapshot.cpu_total_percent,
            per_core_percent: snapshot.per_core_percent,
            memory_gb: snapshot.memory_used_gb,
            memory_percent: snapshot.memory_percent,
        };
        if tx.send(sample).is_err() {
            // Receiver dropped; the timeline owner is gone.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_while_idle_is_a_noop() {
        let mut sampler = TimelineSampler::new(DEFAULT_SAMPLING_INTERVAL);
        assert!(!sampler.is_sampling());
        assert!(sampler.stop().is_empty());
        assert!(!sampler.is_sampling());
    }

    #[test]
    fn test_start_while_sampling_is_a_noop() {
        let mut sampler = TimelineSampler::new(Duration::from_millis(100));
        sampler.start();
        assert!(sampler.is_sampling());
        sampler.start();
        assert!(sampler.is_sampling());

        thread::sleep(Duration::from_millis(350));
        let timeline = sampler.stop();
        assert!(!sampler.is_sampling());
        // A second start would have reset the reference clock; the single
        // timeline keeps accumulating instead.
        assert!(timeline.len() >= 2);
    }

    #[test]
    fn test_samples_are_ordered_and_consistent() {
        let mut sampler = TimelineSampler::new(Duration::from_millis(100));
        sampler.start();
        thread::sleep(Duration::from_millis(550));
        let timeline = sampler.stop();

        assert!(!timeline.is_empty());
        assert!(timeline[0].elapsed_secs >= 0.0);
        for pair in timeline.windows(2) {
            assert!(pair[1].elapsed_secs > pair[0].elapsed_secs);
        }
        for sample in &timeline {
            let sum: f32 = sample.per_core_percent.iter().sum();
            assert!((sample.cpu_total_percent - sum).abs() < 1e-3);
            assert!(sample.memory_gb >= 0.0);
            assert!((0.0..=100.0).contains(&sample.memory_percent));
        }
    }

    #[test]
    fn test_restart_resets_the_timeline() {
        let mut sampler = TimelineSampler::new(Duration::from_millis(100));
        sampler.start();
        thread::sleep(Duration::from_millis(250));
        let first = sampler.stop();
        assert!(!first.is_empty());

        sampler.start();
        thread::sleep(Duration::from_millis(250));
        let second = sampler.stop();
        assert!(!second.is_empty());
        // Elapsed times restart from the new reference instant.
        assert!(second[0].elapsed_secs < first.last().unwrap().elapsed_secs + 0.2);
    }

    #[test]
    fn test_sample_serializes_with_compact_keys() {
        let sample = Sample {
            elapsed_secs: 0.5,
            cpu_total_percent: 120.0,
            per_core_percent: vec![60.0, 60.0],
            memory_gb: 8.25,
            memory_percent: 51.5,
        };
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["t"], 0.5);
        assert_eq!(value["cpu_total"], 120.0);
        assert_eq!(value["per_core"].as_array().unwrap().len(), 2);
    }
}
