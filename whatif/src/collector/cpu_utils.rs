//! CPU utility functions
//!
//! Utilities for querying CPU information from /sys filesystem.

use anyhow::{Context, Result};
use std::fs;

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// The format in /sys is like "0-3" or "0-3,8-11" for NUMA systems.
///
/// # Errors
/// Returns an error if /sys/devices/system/cpu/online cannot be read or parsed
pub fn online_cpus() -> Result<Vec<u32>> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online")
        .context("Failed to read /sys/devices/system/cpu/online")?;
    parse_cpu_list(content.trim())
}

fn parse_cpu_list(content: &str) -> Result<Vec<u32>> {
    let cpu_ranges: Vec<Vec<u32>> = content
        .split(',')
        .map(|range| -> Result<Vec<u32>> {
            if let Some((start, end)) = range.split_once('-') {
                // Range like "0-3"
                let start: u32 = start.parse()?;
                let end: u32 = end.parse()?;
                Ok((start..=end).collect())
            } else {
                // Single CPU like "5"
                let cpu: u32 = range.parse()?;
                Ok(vec![cpu])
            }
        })
        .collect::<Result<Vec<Vec<u32>>>>()?;

    Ok(cpu_ranges.into_iter().flatten().collect())
}
