//! Runtime configuration
//!
//! Options are parsed from space-separated `key=value` pairs, either passed
//! explicitly or taken from the `WHATIF_OPTS` environment variable. All
//! validation happens here, before any probe is loaded.

use std::path::PathBuf;

use crate::domain::ProfilerError;

/// Environment variable consulted by [`Config::from_env`].
pub const OPTS_ENV: &str = "WHATIF_OPTS";

/// Environment variable overriding the probe bytecode path.
pub const PROBE_ENV: &str = "WHATIF_PROBE";

const DEFAULT_PROBE_PATH: &str = "target/bpfel-unknown-none/release/whatif";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// On-CPU sampling period in wall nanoseconds per sample.
    pub sample_period_ns: u64,
    /// Duration of a single experiment.
    pub experiment_ns: u64,
    /// Startup delay before the first experiment.
    pub warmup_ns: u64,
    /// Candidate virtual speedups, fractions in `[0, 1]`.
    pub speedups: Vec<f64>,
    /// Optional allow-list of line names eligible for selection.
    pub target_lines: Vec<String>,
    /// Enable the eBPF off-CPU collector.
    pub off_cpu: bool,
    /// Path of the profile log.
    pub output: PathBuf,
    /// Path of the compiled probe bytecode, loaded at startup when
    /// `off_cpu` is enabled.
    pub probe_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_period_ns: 1_000_000,
            experiment_ns: 500_000_000,
            warmup_ns: 5_000_000_000,
            speedups: default_speedups(),
            target_lines: Vec::new(),
            off_cpu: true,
            output: PathBuf::from("profile.whatif"),
            probe_path: PathBuf::from(DEFAULT_PROBE_PATH),
        }
    }
}

/// The canonical speedup sweep: 0.00, 0.05, ..., 1.00.
#[must_use]
pub fn default_speedups() -> Vec<f64> {
    (0..=20).map(|i| f64::from(i) / 20.0).collect()
}

impl Config {
    /// Parse options from `WHATIF_OPTS`, falling back to defaults when unset.
    ///
    /// # Errors
    /// Returns `ProfilerError::Config` on unknown keys or malformed values.
    pub fn from_env() -> Result<Self, ProfilerError> {
        let mut config = match std::env::var(OPTS_ENV) {
            Ok(opts) => Self::parse(&opts)?,
            Err(_) => Self::default(),
        };
        if let Ok(probe) = std::env::var(PROBE_ENV) {
            config.probe_path = PathBuf::from(probe);
        }
        Ok(config)
    }

    /// Parse space-separated `key=value` options.
    ///
    /// # Errors
    /// Returns `ProfilerError::Config` on unknown keys or malformed values.
    pub fn parse(opts: &str) -> Result<Self, ProfilerError> {
        let mut config = Self::default();

        for pair in opts.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ProfilerError::Config(format!("expected key=value, got {pair:?}")))?;

            match key {
                "sample_period_ns" => config.sample_period_ns = parse_ns(key, value)?,
                "experiment_ns" => config.experiment_ns = parse_ns(key, value)?,
                "warmup_ns" => config.warmup_ns = parse_ns(key, value)?,
                "speedups" => config.speedups = parse_speedups(value)?,
                "target_lines" => {
                    config.target_lines =
                        value.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect();
                }
                "off_cpu" => {
                    config.off_cpu = match value {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(ProfilerError::Config(format!(
                                "off_cpu must be on or off, got {other:?}"
                            )))
                        }
                    };
                }
                "output" => config.output = PathBuf::from(value),
                "probe" => config.probe_path = PathBuf::from(value),
                other => {
                    return Err(ProfilerError::Config(format!("unknown option {other:?}")));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ProfilerError::Config` when any option is out of range.
    pub fn validate(&self) -> Result<(), ProfilerError> {
        if self.sample_period_ns == 0 {
            return Err(ProfilerError::Config("sample_period_ns must be non-zero".into()));
        }
        if self.experiment_ns == 0 {
            return Err(ProfilerError::Config("experiment_ns must be non-zero".into()));
        }
        if self.speedups.is_empty() {
            return Err(ProfilerError::Config("speedups must not be empty".into()));
        }
        if self.speedups.iter().any(|s| !(0.0..=1.0).contains(s)) {
            return Err(ProfilerError::Config("speedups must lie in [0, 1]".into()));
        }
        Ok(())
    }
}

fn parse_ns(key: &str, value: &str) -> Result<u64, ProfilerError> {
    value
        .parse()
        .map_err(|_| ProfilerError::Config(format!("{key} must be an integer nanosecond count")))
}

fn parse_speedups(value: &str) -> Result<Vec<f64>, ProfilerError> {
    value
        .split(',')
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| ProfilerError::Config(format!("bad speedup fraction {s:?}")))
        })
        .collect()
}
