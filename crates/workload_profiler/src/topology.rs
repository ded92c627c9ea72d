//! Hardware topology detection, including performance/efficiency core
//! classification on Apple Silicon.
//!
//! Classification is table-driven: a [`CoreLayoutTable`] maps (model
//! substring, physical core count) to contiguous P-core and E-core index
//! ranges. The table is deliberately a hard-coded list of known chips — on an
//! unknown chip detection degrades to "no classification" with a diagnostic
//! note rather than guessing a split. Detection itself never fails.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Immutable snapshot of the machine's CPU and memory layout, detected once
/// per profiler instance and persisted as `system_info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareTopology {
    /// Operating system, e.g. "macos" or "linux".
    pub platform: String,
    /// CPU architecture, e.g. "aarch64" or "x86_64".
    pub architecture: String,
    /// CPU brand string, e.g. "Apple M2 Pro".
    pub cpu_model: String,
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub total_memory_gb: f64,
    /// Present only when the machine matched a known heterogeneous layout.
    pub core_layout: Option<CoreLayout>,
    /// Describes the detected layout, or why classification was skipped.
    pub note: String,
}

/// Partition of the physical core indices into performance and efficiency
/// cores. The two sets are disjoint and together cover `0..physical_cores`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreLayout {
    pub performance: Vec<usize>,
    pub efficiency: Vec<usize>,
}

impl CoreLayout {
    /// Mean per-core reading for each core class, in (P, E) order.
    ///
    /// Indices missing from `per_core` are skipped; an empty class yields
    /// `None` rather than a NaN average.
    pub fn split_averages(&self, per_core: &[f32]) -> (Option<f32>, Option<f32>) {
        (
            mean_over(&self.performance, per_core),
            mean_over(&self.efficiency, per_core),
        )
    }
}

fn mean_over(indices: &[usize], per_core: &[f32]) -> Option<f32> {
    let values: Vec<f32> = indices
        .iter()
        .filter_map(|&i| per_core.get(i).copied())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// One known chip layout: a brand substring plus physical core count, mapped
/// to a contiguous P-core range followed by a contiguous E-core range.
#[derive(Debug, Clone)]
pub struct CoreLayoutEntry {
    pub model_substring: String,
    pub physical_cores: usize,
    pub performance: Range<usize>,
    pub efficiency: Range<usize>,
    pub note: String,
}

impl CoreLayoutEntry {
    fn new(
        model_substring: &str,
        physical_cores: usize,
        performance: Range<usize>,
        efficiency: Range<usize>,
        note: &str,
    ) -> Self {
        Self {
            model_substring: model_substring.to_string(),
            physical_cores,
            performance,
            efficiency,
            note: note.to_string(),
        }
    }

    fn layout(&self) -> CoreLayout {
        CoreLayout {
            performance: self.performance.clone().collect(),
            efficiency: self.efficiency.clone().collect(),
        }
    }
}

/// Declarative lookup table for heterogeneous core layouts. New chips are an
/// added entry, not new branching.
#[derive(Debug, Clone, Default)]
pub struct CoreLayoutTable {
    entries: Vec<CoreLayoutEntry>,
}

impl CoreLayoutTable {
    /// Build a table from caller-supplied entries, validating that each entry
    /// partitions `0..physical_cores` into P-cores followed by E-cores.
    pub fn new(entries: Vec<CoreLayoutEntry>) -> Result<Self> {
        for entry in &entries {
            if entry.performance.start != 0
                || entry.efficiency.start != entry.performance.end
                || entry.efficiency.end != entry.physical_cores
            {
                bail!(
                    "core layout entry '{}' ({} cores) does not partition the core indices: \
                     P={:?}, E={:?}",
                    entry.model_substring,
                    entry.physical_cores,
                    entry.performance,
                    entry.efficiency,
                );
            }
        }
        Ok(Self { entries })
    }

    /// The Apple Silicon layouts this profiler has been validated on.
    pub fn apple_silicon() -> Self {
        Self {
            entries: vec![
                CoreLayoutEntry::new(
                    "M2 Pro",
                    10,
                    0..6,
                    6..10,
                    "M2 Pro (10-core): 6 P-cores + 4 E-cores",
                ),
                CoreLayoutEntry::new(
                    "M2 Pro",
                    12,
                    0..6,
                    6..12,
                    "M2 Pro (12-core): 6 P-cores + 6 E-cores",
                ),
                CoreLayoutEntry::new(
                    "M2 Max",
                    12,
                    0..8,
                    8..12,
                    "M2 Max (12-core): 8 P-cores + 4 E-cores",
                ),
                CoreLayoutEntry::new(
                    "M2 Max",
                    14,
                    0..10,
                    10..14,
                    "M2 Max (14-core): 10 P-cores + 4 E-cores",
                ),
            ],
        }
    }

    pub fn entries(&self) -> &[CoreLayoutEntry] {
        &self.entries
    }

    pub fn lookup(&self, cpu_model: &str, physical_cores: usize) -> Option<&CoreLayoutEntry> {
        self.entries.iter().find(|entry| {
            entry.physical_cores == physical_cores && cpu_model.contains(&entry.model_substring)
        })
    }
}

impl HardwareTopology {
    /// Read the live topology. Never fails: classification errors degrade to
    /// `core_layout: None` with an explanatory note.
    pub fn detect(table: &CoreLayoutTable) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        let logical_cores = system.cpus().len();
        let physical_cores = System::physical_core_count().unwrap_or(logical_cores);
        let total_memory_gb = system.total_memory() as f64 / BYTES_PER_GB;
        let cpu_model = detect_cpu_model(&system);

        let (core_layout, note) = classify_cores(
            table,
            std::env::consts::OS,
            std::env::consts::ARCH,
            &cpu_model,
            physical_cores,
        );

        log::info!(
            "detected topology: {} {} '{}', {physical_cores} physical / {logical_cores} logical \
             cores, {total_memory_gb:.2} GB ({note})",
            std::env::consts::OS,
            std::env::consts::ARCH,
            cpu_model,
        );

        Self {
            platform: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_model,
            physical_cores,
            logical_cores,
            total_memory_gb,
            core_layout,
            note,
        }
    }

    /// One-line summary for experiment banners.
    pub fn summary(&self) -> String {
        format!(
            "{} {} | {} physical / {} logical cores | {:.1} GB | {}",
            self.platform,
            self.architecture,
            self.physical_cores,
            self.logical_cores,
            self.total_memory_gb,
            self.note,
        )
    }
}

/// Map a machine to a core layout, or explain why no classification applies.
fn classify_cores(
    table: &CoreLayoutTable,
    os: &str,
    arch: &str,
    cpu_model: &str,
    physical_cores: usize,
) -> (Option<CoreLayout>, String) {
    if os != "macos" || arch != "aarch64" {
        return (None, "Homogeneous core architecture".to_string());
    }

    match table.lookup(cpu_model, physical_cores) {
        Some(entry) => (Some(entry.layout()), entry.note.clone()),
        None => (
            None,
            format!(
                "Apple Silicon: unknown core split (physical={physical_cores}, model={cpu_model})"
            ),
        ),
    }
}

fn detect_cpu_model(system: &System) -> String {
    if let Some(brand) = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
    {
        return brand;
    }

    // Some macOS setups report an empty brand through sysinfo; sysctl is the
    // authoritative source there.
    #[cfg(target_os = "macos")]
    if let Ok(output) = std::process::Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
    {
        let brand = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !brand.is_empty() {
            return brand;
        }
    }

    "Unknown CPU".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_builtin_entry_partitions_the_cores() {
        let table = CoreLayoutTable::apple_silicon();
        assert!(!table.entries().is_empty());
        for entry in table.entries() {
            let layout = entry.layout();
            assert_eq!(
                layout.performance.len() + layout.efficiency.len(),
                entry.physical_cores,
            );
            let mut all: Vec<usize> = layout
                .performance
                .iter()
                .chain(layout.efficiency.iter())
                .copied()
                .collect();
            all.sort_unstable();
            assert_eq!(all, (0..entry.physical_cores).collect::<Vec<_>>());
        }
        // The built-in entries must also pass the user-table validation.
        CoreLayoutTable::new(table.entries().to_vec()).unwrap();
    }

    #[test]
    fn test_invalid_user_table_is_rejected() {
        let entry = CoreLayoutEntry::new("Bogus", 8, 0..5, 5..7, "gap at core 7");
        assert!(CoreLayoutTable::new(vec![entry]).is_err());
    }

    #[test]
    fn test_lookup_requires_model_and_core_count() {
        let table = CoreLayoutTable::apple_silicon();
        let entry = table.lookup("Apple M2 Pro", 10).unwrap();
        assert_eq!(entry.performance, 0..6);
        assert_eq!(entry.efficiency, 6..10);

        assert!(table.lookup("Apple M2 Pro", 8).is_none());
        assert!(table.lookup("Apple M3 Pro", 12).is_none());
    }

    #[test]
    fn test_classification_skipped_off_apple_silicon() {
        let table = CoreLayoutTable::apple_silicon();
        let (layout, note) = classify_cores(&table, "linux", "x86_64", "AMD Ryzen 9 7950X", 16);
        assert!(layout.is_none());
        assert_eq!(note, "Homogeneous core architecture");
    }

    #[test]
    fn test_unknown_chip_notes_raw_count_and_model() {
        let table = CoreLayoutTable::apple_silicon();
        let (layout, note) = classify_cores(&table, "macos", "aarch64", "Apple M9 Ultra", 32);
        assert!(layout.is_none());
        assert!(note.contains("physical=32"));
        assert!(note.contains("Apple M9 Ultra"));
    }

    #[test]
    fn test_known_chip_classifies() {
        let table = CoreLayoutTable::apple_silicon();
        let (layout, note) = classify_cores(&table, "macos", "aarch64", "Apple M2 Max", 12);
        let layout = layout.unwrap();
        assert_eq!(layout.performance, (0..8).collect::<Vec<_>>());
        assert_eq!(layout.efficiency, (8..12).collect::<Vec<_>>());
        assert!(note.contains("M2 Max"));
    }

    #[test]
    fn test_split_averages() {
        let layout = CoreLayout {
            performance: vec![0, 1],
            efficiency: vec![2, 3],
        };
        let (p, e) = layout.split_averages(&[80.0, 60.0, 20.0, 10.0]);
        assert_eq!(p, Some(70.0));
        assert_eq!(e, Some(15.0));

        // Readings shorter than the layout skip the missing cores.
        let (p, e) = layout.split_averages(&[80.0, 60.0]);
        assert_eq!(p, Some(70.0));
        assert_eq!(e, None);
    }

    #[test]
    fn test_detect_never_fails_and_roundtrips() {
        let topology = HardwareTopology::detect(&CoreLayoutTable::apple_silicon());
        assert!(topology.logical_cores > 0);
        assert!(topology.physical_cores > 0);
        assert!(topology.total_memory_gb > 0.0);
        assert!(!topology.note.is_empty());

        let json = serde_json::to_string_pretty(&topology).unwrap();
        let parsed: HardwareTopology = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.physical_cores, topology.physical_cores);
        assert_eq!(parsed.core_layout, topology.core_layout);
    }
}
