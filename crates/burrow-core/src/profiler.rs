use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::shape::Shape;

// Profiler — Per-kernel byte/tensor deltas and timing
//
// `Engine::profile` switches recording on for the duration of a closure.
// Every kernel dispatched meanwhile adds one KernelProfile; the closure as a
// whole yields new_bytes / new_tensors / peak_bytes. With recording off,
// dispatch does not touch the profiler at all.

/// One kernel invocation observed while profiling.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelProfile {
    pub name: String,
    /// Tracked bytes after minus before the kernel.
    pub bytes_added: i64,
    pub total_bytes_snapshot: usize,
    /// Live tensors after minus before the kernel.
    pub tensors_added: i64,
    pub total_tensors_snapshot: usize,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub kernel_time: Duration,
}

/// Everything recorded by one `Engine::profile` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileInfo {
    pub new_bytes: i64,
    pub new_tensors: i64,
    pub peak_bytes: usize,
    pub kernels: Vec<KernelProfile>,
}

impl ProfileInfo {
    /// Names of the kernels run, in dispatch order.
    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.iter().map(|k| k.name.as_str()).collect()
    }

    /// Aggregate the recorded kernels by name into a printable report.
    pub fn report(&self) -> ProfileReport {
        let mut by_name: HashMap<&str, Vec<&KernelProfile>> = HashMap::new();
        for kernel in &self.kernels {
            by_name.entry(kernel.name.as_str()).or_default().push(kernel);
        }

        let mut entries: Vec<ProfileEntry> = by_name
            .into_iter()
            .map(|(name, runs)| {
                let count = runs.len();
                let total: Duration = runs.iter().map(|k| k.kernel_time).sum();
                let min = runs.iter().map(|k| k.kernel_time).min().unwrap_or_default();
                let max = runs.iter().map(|k| k.kernel_time).max().unwrap_or_default();
                ProfileEntry {
                    name: name.to_string(),
                    count,
                    total,
                    min,
                    max,
                    avg: total / count.max(1) as u32,
                    bytes_added: runs.iter().map(|k| k.bytes_added).sum(),
                }
            })
            .collect();

        entries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        ProfileReport {
            total: entries.iter().map(|e| e.total).sum(),
            entries,
            peak_bytes: self.peak_bytes,
        }
    }
}

/// Recording state owned by the Engine.
#[derive(Debug, Default)]
pub(crate) struct Profiler {
    active: bool,
    kernels: Vec<KernelProfile>,
    peak_bytes: usize,
}

impl Profiler {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Begin a recording, returning the state it replaces.
    pub(crate) fn start(&mut self, current_bytes: usize) -> Profiler {
        std::mem::replace(
            self,
            Profiler {
                active: true,
                kernels: Vec::new(),
                peak_bytes: current_bytes,
            },
        )
    }

    /// Finish the recording and restore the state `start` replaced.
    pub(crate) fn finish(&mut self, previous: Profiler) -> (Vec<KernelProfile>, usize) {
        let done = std::mem::replace(self, previous);
        if self.active {
            self.peak_bytes = self.peak_bytes.max(done.peak_bytes);
        }
        (done.kernels, done.peak_bytes)
    }

    pub(crate) fn observe_bytes(&mut self, bytes: usize) {
        if self.active && bytes > self.peak_bytes {
            self.peak_bytes = bytes;
        }
    }

    pub(crate) fn record(&mut self, kernel: KernelProfile) {
        if self.active {
            self.kernels.push(kernel);
        }
    }

    /// Drop recorded kernels. Called when the active backend changes.
    pub(crate) fn reset(&mut self) {
        self.kernels.clear();
    }
}

// ProfileEntry / ProfileReport — aggregated, pretty-printable summary

/// Aggregated statistics for one kernel name.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub bytes_added: i64,
}

/// A formatted profiling report, printed with `Display`.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: Duration,
    pub peak_bytes: usize,
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(78);
        writeln!(f, "╔{}╗", rule)?;
        writeln!(f, "║{:^78}║", "Burrow Kernel Profile")?;
        writeln!(f, "╠{}╣", rule)?;
        writeln!(
            f,
            "║ {:<20} {:>6} {:>12} {:>12} {:>12} {:>10} ║",
            "Kernel", "Count", "Total", "Avg", "Max", "Bytes"
        )?;
        writeln!(f, "╠{}╣", rule)?;
        for entry in &self.entries {
            writeln!(
                f,
                "║ {:<20} {:>6} {:>12} {:>12} {:>12} {:>10} ║",
                truncate_str(&entry.name, 20),
                entry.count,
                format!("{:.2?}", entry.total),
                format!("{:.2?}", entry.avg),
                format!("{:.2?}", entry.max),
                format_signed_bytes(entry.bytes_added),
            )?;
        }
        writeln!(f, "╠{}╣", rule)?;
        let footer = format!(
            "Total: {:.2?}   Peak: {}",
            self.total,
            format_bytes(self.peak_bytes)
        );
        writeln!(f, "║ {:<76} ║", footer)?;
        writeln!(f, "╚{}╝", rule)?;
        Ok(())
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let mut out: String = s.chars().take(max - 1).collect();
        out.push('…');
        out
    } else {
        s.to_string()
    }
}

/// Format bytes into a human-readable string (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_signed_bytes(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_bytes(bytes.unsigned_abs() as usize))
    } else {
        format_bytes(bytes as usize)
    }
}
