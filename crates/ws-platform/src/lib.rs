//! Container CPU/memory limit discovery, hidden behind a single
//! `ContainerCpuSource` abstraction so hot paths only ever read an atomic
//! flag (§4.1, §9 REDESIGN FLAG).

mod cpu;
mod memory;

pub use cpu::{
    CgroupV1Source, CgroupV2Source, ContainerCpuSource, CpuSample, ProcStatSource,
    discover_cpu_source,
};
pub use memory::{current_rss_bytes, discover_memory_limit_bytes};
