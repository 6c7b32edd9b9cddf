//! Identifier newtypes
//!
//! Thin wrappers that keep process, thread, and line identifiers from being
//! mixed up in function signatures.

use std::fmt;

/// Process ID (TGID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// OS thread ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Identifier of a progress line, the unit of causal selection.
///
/// Index 0 is reserved for the unattributed sentinel: samples whose
/// instruction pointer cannot be resolved land there and are never selected
/// for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u64);

impl LineId {
    /// Sentinel for samples whose IP did not resolve to any known line.
    pub const UNATTRIBUTED: LineId = LineId(0);

    #[must_use]
    pub fn is_unattributed(self) -> bool {
        self == Self::UNATTRIBUTED
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
        assert_eq!(Tid(7).to_string(), "TID:7");
        assert_eq!(LineId(3).to_string(), "line:3");
    }

    #[test]
    fn unattributed_sentinel() {
        assert!(LineId::UNATTRIBUTED.is_unattributed());
        assert!(!LineId(1).is_unattributed());
    }
}
