//! Progress line index
//!
//! Maps instruction pointers to progress lines, the unit of causal selection.
//! IP-to-location resolution is delegated to a [`LineResolver`] supplied by
//! the embedding loader (the symbol/CFI walker lives outside this crate); a
//! [`RangeResolver`] backed by address ranges ships for tests and simple
//! embeddings. Unknown IPs land on the unattributed sentinel line, which is
//! counted but never selected for an experiment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::LineId;

/// Resolves an instruction pointer to a stable location name, e.g.
/// `src/worker.rs:42`.
pub trait LineResolver: Send + Sync {
    fn resolve(&self, ip: u64) -> Option<String>;
}

/// One progress line with its causal-analysis counters.
#[derive(Debug)]
pub struct ProgressLine {
    name: String,
    /// On-CPU samples observed at this line.
    visits: AtomicU64,
    /// Sample periods for which this line was the selected line of an
    /// experiment.
    global_delays: AtomicU64,
    /// Off-CPU time (I/O and lock waits) attributed to this line.
    blocked_ns: AtomicU64,
}

impl ProgressLine {
    fn new(name: String) -> Self {
        Self {
            name,
            visits: AtomicU64::new(0),
            global_delays: AtomicU64::new(0),
            blocked_ns: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn visits(&self) -> u64 {
        self.visits.load(Ordering::Relaxed)
    }

    pub fn add_visit(&self) {
        self.visits.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn global_delays(&self) -> u64 {
        self.global_delays.load(Ordering::Relaxed)
    }

    pub fn add_global_delays(&self, periods: u64) {
        self.global_delays.fetch_add(periods, Ordering::Relaxed);
    }

    #[must_use]
    pub fn blocked_ns(&self) -> u64 {
        self.blocked_ns.load(Ordering::Relaxed)
    }

    pub fn add_blocked_ns(&self, ns: u64) {
        self.blocked_ns.fetch_add(ns, Ordering::Relaxed);
    }
}

struct Inner {
    lines: Vec<Arc<ProgressLine>>,
    by_name: HashMap<String, LineId>,
    ip_cache: HashMap<u64, LineId>,
}

pub struct LineIndex {
    resolver: Box<dyn LineResolver>,
    inner: RwLock<Inner>,
    /// Allow-list of selectable line names; empty means all lines.
    target_lines: Vec<String>,
    attribution_misses: AtomicU64,
}

impl LineIndex {
    #[must_use]
    pub fn new(resolver: Box<dyn LineResolver>, target_lines: Vec<String>) -> Self {
        let sentinel = Arc::new(ProgressLine::new("<unattributed>".to_string()));
        let mut by_name = HashMap::new();
        by_name.insert(sentinel.name.clone(), LineId::UNATTRIBUTED);
        Self {
            resolver,
            inner: RwLock::new(Inner { lines: vec![sentinel], by_name, ip_cache: HashMap::new() }),
            target_lines,
            attribution_misses: AtomicU64::new(0),
        }
    }

    /// Classify an instruction pointer, interning a new line on first sight.
    pub fn classify(&self, ip: u64) -> LineId {
        if let Some(id) = self.inner.read().expect("line index poisoned").ip_cache.get(&ip) {
            return *id;
        }

        let resolved = self.resolver.resolve(ip);
        let mut inner = self.inner.write().expect("line index poisoned");
        let id = match resolved {
            Some(name) => match inner.by_name.get(&name) {
                Some(id) => *id,
                None => {
                    let id = LineId(inner.lines.len() as u64);
                    inner.lines.push(Arc::new(ProgressLine::new(name.clone())));
                    inner.by_name.insert(name, id);
                    id
                }
            },
            None => {
                self.attribution_misses.fetch_add(1, Ordering::Relaxed);
                LineId::UNATTRIBUTED
            }
        };
        inner.ip_cache.insert(ip, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: LineId) -> Option<Arc<ProgressLine>> {
        let inner = self.inner.read().expect("line index poisoned");
        inner.lines.get(id.0 as usize).cloned()
    }

    /// Snapshot of every known line, in id order, for the controller's
    /// selection pass.
    #[must_use]
    pub fn all_lines(&self) -> Vec<(LineId, Arc<ProgressLine>)> {
        let inner = self.inner.read().expect("line index poisoned");
        inner
            .lines
            .iter()
            .enumerate()
            .map(|(i, line)| (LineId(i as u64), Arc::clone(line)))
            .collect()
    }

    /// Whether a line may be chosen as an experiment's selected line.
    #[must_use]
    pub fn is_selectable(&self, id: LineId, line: &ProgressLine) -> bool {
        if id.is_unattributed() {
            return false;
        }
        self.target_lines.is_empty() || self.target_lines.iter().any(|t| t == line.name())
    }

    /// Count of samples whose IP resolved to no known line.
    #[must_use]
    pub fn attribution_misses(&self) -> u64 {
        self.attribution_misses.load(Ordering::Relaxed)
    }
}

/// Address-range backed resolver for tests and simple embeddings.
#[derive(Default)]
pub struct RangeResolver {
    // (start, end, name), half-open ranges
    ranges: Vec<(u64, u64, String)>,
}

impl RangeResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: u64, end: u64, name: impl Into<String>) {
        self.ranges.push((start, end, name.into()));
    }
}

impl LineResolver for RangeResolver {
    fn resolve(&self, ip: u64) -> Option<String> {
        self.ranges
            .iter()
            .find(|(start, end, _)| (*start..*end).contains(&ip))
            .map(|(_, _, name)| name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with_two_lines() -> LineIndex {
        let mut resolver = RangeResolver::new();
        resolver.add(0x1000, 0x2000, "src/a.rs:10");
        resolver.add(0x2000, 0x3000, "src/b.rs:20");
        LineIndex::new(Box::new(resolver), Vec::new())
    }

    #[test]
    fn classify_interns_lines_once() {
        let index = index_with_two_lines();
        let a = index.classify(0x1000);
        let a2 = index.classify(0x1fff);
        let b = index.classify(0x2000);
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(index.get(a).unwrap().name(), "src/a.rs:10");
        // sentinel + two interned lines
        assert_eq!(index.all_lines().len(), 3);
    }

    #[test]
    fn unknown_ip_is_unattributed_and_counted() {
        let index = index_with_two_lines();
        assert_eq!(index.classify(0xdead_0000), LineId::UNATTRIBUTED);
        assert_eq!(index.attribution_misses(), 1);
        // cached sentinel hits do not recount
        assert_eq!(index.classify(0xdead_0000), LineId::UNATTRIBUTED);
        assert_eq!(index.attribution_misses(), 1);
    }

    #[test]
    fn unattributed_is_never_selectable() {
        let index = index_with_two_lines();
        let sentinel = index.get(LineId::UNATTRIBUTED).unwrap();
        assert!(!index.is_selectable(LineId::UNATTRIBUTED, &sentinel));

        let a = index.classify(0x1000);
        assert!(index.is_selectable(a, &index.get(a).unwrap()));
    }

    #[test]
    fn allow_list_restricts_selection() {
        let mut resolver = RangeResolver::new();
        resolver.add(0x1000, 0x2000, "src/a.rs:10");
        resolver.add(0x2000, 0x3000, "src/b.rs:20");
        let index =
            LineIndex::new(Box::new(resolver), vec!["src/b.rs:20".to_string()]);

        let a = index.classify(0x1000);
        let b = index.classify(0x2000);
        assert!(!index.is_selectable(a, &index.get(a).unwrap()));
        assert!(index.is_selectable(b, &index.get(b).unwrap()));
    }

    #[test]
    fn line_counters_accumulate() {
        let index = index_with_two_lines();
        let a = index.classify(0x1000);
        let line = index.get(a).unwrap();
        line.add_visit();
        line.add_visit();
        line.add_blocked_ns(500_000);
        line.add_global_delays(500);
        assert_eq!(line.visits(), 2);
        assert_eq!(line.blocked_ns(), 500_000);
        assert_eq!(line.global_delays(), 500);
    }
}
