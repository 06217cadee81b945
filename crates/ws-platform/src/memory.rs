use std::fs;
use sysinfo::System;

/// Discover the effective memory limit in bytes: cgroup v2 `memory.max`,
/// falling back to cgroup v1 `memory.limit_in_bytes`, falling back to host
/// total memory via `sysinfo` (§4.1).
///
/// Grounded on the cgroup-reading idiom in the pack's load-test harness
/// (`surrealdb-surreal-sync/crates/loadtest-distributed/src/environment.rs`),
/// generalized with a host fallback.
#[must_use]
pub fn discover_memory_limit_bytes() -> u64 {
    if let Some(limit) = read_cgroup_v2_limit() {
        return limit;
    }
    if let Some(limit) = read_cgroup_v1_limit() {
        return limit;
    }
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

fn read_cgroup_v2_limit() -> Option<u64> {
    let raw = fs::read_to_string("/sys/fs/cgroup/memory.max").ok()?;
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse().ok()
}

fn read_cgroup_v1_limit() -> Option<u64> {
    let raw = fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes").ok()?;
    let value: u64 = raw.trim().parse().ok()?;
    // An unconstrained v1 cgroup reports a near-u64::MAX sentinel.
    if value > 1 << 62 { None } else { Some(value) }
}

/// Current resident set size of this process in bytes, via `sysinfo`.
#[must_use]
pub fn current_rss_bytes() -> u64 {
    let pid = sysinfo::get_current_pid().ok();
    let mut sys = System::new();
    sys.refresh_all();
    pid.and_then(|pid| sys.process(pid)).map_or(0, |p| p.memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_memory_limit_never_panics() {
        // Host may or may not be containerized; just assert it returns
        // something nonzero (falls back to sysinfo total memory).
        assert!(discover_memory_limit_bytes() > 0);
    }
}
