//! Structured error types for whatif
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Fatality rules: `BpfLoad` and `Sampler` at startup are surfaced to the
//! caller and abort the profile; `BpfMap` on a per-pid insert is logged and
//! skipped; lost ring-buffer events and attribution misses are counters, not
//! errors; `Config` aborts before any probe is loaded.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("failed to load off-CPU probe: {0}")]
    BpfLoad(String),

    #[error("failed to update probe map {map}: {error}")]
    BpfMap { map: &'static str, error: String },

    #[error("on-CPU sampler unavailable: {0}")]
    Sampler(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a profile is already active")]
    AlreadyActive,

    #[error("no profile is active")]
    NotActive,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("malformed profile log line: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ProfilerError::Config("speedups must lie in [0, 1]".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: speedups must lie in [0, 1]"
        );
    }

    #[test]
    fn bpf_map_error_display() {
        let err = ProfilerError::BpfMap { map: "TARGET_PIDS", error: "E2BIG".to_string() };
        assert!(err.to_string().contains("TARGET_PIDS"));
        assert!(err.to_string().contains("E2BIG"));
    }
}
