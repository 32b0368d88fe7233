use thiserror::Error;

/// Errors that can occur while opening perf events or attaching probes.
#[derive(Debug, Error)]
pub enum PerfOpenError {
    #[error("perf_event_open failed: {0}")]
    SysOpen(#[source] std::io::Error),

    #[error("mmap of the perf ring buffer failed: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("could not read dynamic PMU type from {path}: {source}")]
    DynamicPmuType {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read /proc/{pid}/maps: {source}")]
    ProcMaps {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("sampling frequency {requested} exceeds the configured maximum {max}")]
    FrequencyTooHigh { requested: u64, max: u64 },
}

/// Opaque error from the external module-info collaborator. The core never
/// inspects the reason, only whether resolution succeeded.
#[derive(Debug, Error)]
#[error("could not create module info for {filename}: {reason}")]
pub struct ModuleInfoError {
    pub filename: String,
    pub reason: String,
}

/// Fatal errors raised by the tracer controller: perf_event_open failing at
/// startup, ring buffers failing to mmap, or the target pid vanishing
/// before reaching the Running state.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("failed to open perf events for pid {pid}: {source}")]
    Open {
        pid: u32,
        #[source]
        source: PerfOpenError,
    },

    #[error("target process {pid} no longer exists")]
    ProcessVanished { pid: u32 },
}
