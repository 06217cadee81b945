use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// A single CPU-quota observation: cumulative used time vs. the window it
/// was measured over, expressed as a percentage already.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    /// CPU usage as a percent of one full core-second per wall-clock
    /// second, normalized to the container's quota (i.e. 100% means "using
    /// its whole allotted slice", not "using one whole host core").
    pub percent: f64,
}

/// Hides cgroup v1/v2/host-proc-stat platform detection behind one trait so
/// hot paths never need to know which variant is in play (§9 REDESIGN
/// FLAG: "cgroup-backed CPU sampling").
pub trait ContainerCpuSource: Send + Sync {
    /// Read the current CPU usage sample, or `None` if this source isn't
    /// applicable on the host (e.g. cgroup v2 files absent).
    fn sample(&mut self) -> Option<CpuSample>;

    /// Name for logging which source is active.
    fn name(&self) -> &'static str;
}

struct CgroupUsage {
    usage_usec: u64,
    at: Instant,
}

/// cgroup v2: reads `cpu.max` (quota/period) and `cpu.stat`'s
/// `usage_usec` to compute percent-of-quota between samples.
pub struct CgroupV2Source {
    root: PathBuf,
    last: Option<CgroupUsage>,
}

impl CgroupV2Source {
    const DEFAULT_ROOT: &'static str = "/sys/fs/cgroup";

    /// Probe the default cgroup v2 mount.
    #[must_use]
    pub fn discover() -> Option<Self> {
        Self::at(Path::new(Self::DEFAULT_ROOT))
    }

    /// Probe a specific root (used by tests to point at a fixture
    /// directory).
    #[must_use]
    pub fn at(root: &Path) -> Option<Self> {
        if root.join("cpu.max").exists() {
            Some(Self {
                root: root.to_path_buf(),
                last: None,
            })
        } else {
            None
        }
    }

    fn quota_period_usec(&self) -> Option<(Option<u64>, u64)> {
        let raw = fs::read_to_string(self.root.join("cpu.max")).ok()?;
        let mut parts = raw.split_whitespace();
        let quota = parts.next()?;
        let period: u64 = parts.next()?.parse().ok()?;
        let quota = if quota == "max" {
            None
        } else {
            Some(quota.parse().ok()?)
        };
        Some((quota, period))
    }

    fn usage_usec(&self) -> Option<u64> {
        let raw = fs::read_to_string(self.root.join("cpu.stat")).ok()?;
        raw.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? == "usage_usec" {
                parts.next()?.parse().ok()
            } else {
                None
            }
        })
    }
}

impl ContainerCpuSource for CgroupV2Source {
    fn sample(&mut self) -> Option<CpuSample> {
        let (quota, period) = self.quota_period_usec()?;
        let usage = self.usage_usec()?;
        let now = Instant::now();

        let sample = self.last.as_ref().map(|prev| {
            let elapsed = now.duration_since(prev.at).as_secs_f64().max(0.001);
            let delta_usec = usage.saturating_sub(prev.usage_usec) as f64;
            let budget_usec = match quota {
                Some(quota) => quota as f64 * (elapsed / (period as f64 / 1_000_000.0)),
                None => elapsed * 1_000_000.0 * num_cpus::get() as f64,
            };
            let percent = if budget_usec > 0.0 {
                (delta_usec / budget_usec * 100.0).clamp(0.0, 1000.0)
            } else {
                0.0
            };
            CpuSample { percent }
        });

        self.last = Some(CgroupUsage {
            usage_usec: usage,
            at: now,
        });

        sample
    }

    fn name(&self) -> &'static str {
        "cgroup_v2"
    }
}

/// cgroup v1: `cpuacct.usage` (nanoseconds) plus `cpu.cfs_quota_us` /
/// `cpu.cfs_period_us`.
pub struct CgroupV1Source {
    root: PathBuf,
    last: Option<(u64, Instant)>,
}

impl CgroupV1Source {
    const DEFAULT_ROOT: &'static str = "/sys/fs/cgroup/cpu,cpuacct";

    /// Probe the default cgroup v1 mount.
    #[must_use]
    pub fn discover() -> Option<Self> {
        Self::at(Path::new(Self::DEFAULT_ROOT))
    }

    /// Probe a specific root (used by tests).
    #[must_use]
    pub fn at(root: &Path) -> Option<Self> {
        if root.join("cpuacct.usage").exists() {
            Some(Self {
                root: root.to_path_buf(),
                last: None,
            })
        } else {
            None
        }
    }

    fn quota_period_usec(&self) -> Option<(Option<i64>, u64)> {
        let quota: i64 = fs::read_to_string(self.root.join("cpu.cfs_quota_us"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let period: u64 = fs::read_to_string(self.root.join("cpu.cfs_period_us"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        Some((if quota < 0 { None } else { Some(quota) }, period))
    }
}

impl ContainerCpuSource for CgroupV1Source {
    fn sample(&mut self) -> Option<CpuSample> {
        let usage_ns: u64 = fs::read_to_string(self.root.join("cpuacct.usage"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let (quota, period) = self.quota_period_usec()?;
        let now = Instant::now();

        let sample = self.last.map(|(prev_usage, prev_at)| {
            let elapsed = now.duration_since(prev_at).as_secs_f64().max(0.001);
            let delta_ns = usage_ns.saturating_sub(prev_usage) as f64;
            let budget_ns = match quota {
                Some(quota) => (quota as f64) * 1000.0 * (elapsed / (period as f64 / 1_000_000.0)),
                None => elapsed * 1_000_000_000.0 * num_cpus::get() as f64,
            };
            let percent = if budget_ns > 0.0 {
                (delta_ns / budget_ns * 100.0).clamp(0.0, 1000.0)
            } else {
                0.0
            };
            CpuSample { percent }
        });

        self.last = Some((usage_ns, now));
        sample
    }

    fn name(&self) -> &'static str {
        "cgroup_v1"
    }
}

/// Last resort: host-wide `/proc/stat`, used when neither cgroup variant is
/// present (bare-metal dev boxes, some CI sandboxes).
pub struct ProcStatSource {
    last: Option<(u64, u64)>,
}

impl ProcStatSource {
    /// Always "available"; callers should try this only after both cgroup
    /// sources fail to probe.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    fn read_totals() -> Option<(u64, u64)> {
        let raw = fs::read_to_string("/proc/stat").ok()?;
        let line = raw.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some((total, idle))
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerCpuSource for ProcStatSource {
    fn sample(&mut self) -> Option<CpuSample> {
        let (total, idle) = Self::read_totals()?;

        let sample = self.last.map(|(prev_total, prev_idle)| {
            let total_delta = total.saturating_sub(prev_total) as f64;
            let idle_delta = idle.saturating_sub(prev_idle) as f64;
            let percent = if total_delta > 0.0 {
                ((total_delta - idle_delta) / total_delta * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            };
            CpuSample { percent }
        });

        self.last = Some((total, idle));
        sample
    }

    fn name(&self) -> &'static str {
        "proc_stat"
    }
}

/// Auto-select the best available source: cgroup v2, then v1, then
/// `/proc/stat`.
#[must_use]
pub fn discover_cpu_source() -> Box<dyn ContainerCpuSource> {
    if let Some(v2) = CgroupV2Source::discover() {
        tracing::info!(source = "cgroup_v2", "discovered container CPU source");
        return Box::new(v2);
    }
    if let Some(v1) = CgroupV1Source::discover() {
        tracing::info!(source = "cgroup_v1", "discovered container CPU source");
        return Box::new(v1);
    }
    tracing::info!(
        source = "proc_stat",
        "no cgroup CPU accounting found, falling back to host /proc/stat"
    );
    Box::new(ProcStatSource::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn cgroup_v2_source_computes_percent_between_samples() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.max"), "100000 100000\n").unwrap();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 0\n").unwrap();

        let mut source = CgroupV2Source::at(dir.path()).unwrap();
        assert!(source.sample().is_none(), "first sample has no baseline");

        sleep(Duration::from_millis(10));
        fs::write(dir.path().join("cpu.stat"), "usage_usec 5000\n").unwrap();
        let sample = source.sample().unwrap();
        assert!(sample.percent >= 0.0);
    }

    #[test]
    fn cgroup_v1_source_probes_absence_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CgroupV1Source::at(dir.path()).is_none());
    }
}
