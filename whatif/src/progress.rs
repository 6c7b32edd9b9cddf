//! Progress points
//!
//! Named counters the instrumented program bumps at semantically meaningful
//! locations. The bump path is a read-lock plus one relaxed atomic increment;
//! the controller snapshots all counters around each experiment to measure
//! the progress delta.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct ProgressPoint {
    name: String,
    count: AtomicU64,
}

impl ProgressPoint {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bump(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct ProgressRegistry {
    points: RwLock<HashMap<String, Arc<ProgressPoint>>>,
}

impl ProgressRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a progress point, returning the existing one if the name is
    /// already registered.
    pub fn declare(&self, name: &str) -> Arc<ProgressPoint> {
        if let Some(point) = self.points.read().expect("progress registry poisoned").get(name) {
            return Arc::clone(point);
        }
        let mut points = self.points.write().expect("progress registry poisoned");
        Arc::clone(points.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ProgressPoint { name: name.to_string(), count: AtomicU64::new(0) })
        }))
    }

    /// Bump a progress point, declaring it on first use.
    pub fn bump(&self, name: &str) {
        if let Some(point) = self.points.read().expect("progress registry poisoned").get(name) {
            point.bump();
            return;
        }
        self.declare(name).bump();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.read().expect("progress registry poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name-ordered snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.points
            .read()
            .expect("progress registry poisoned")
            .iter()
            .map(|(name, point)| (name.clone(), point.count()))
            .collect()
    }
}

/// Per-point deltas between two snapshots, in name order. Points that did
/// not advance still appear, with a zero delta.
#[must_use]
pub fn snapshot_delta(
    before: &BTreeMap<String, u64>,
    after: &BTreeMap<String, u64>,
) -> Vec<(String, u64)> {
    after
        .iter()
        .map(|(name, count)| {
            let base = before.get(name).copied().unwrap_or(0);
            (name.clone(), count.saturating_sub(base))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent() {
        let registry = ProgressRegistry::new();
        let a = registry.declare("loop_iter");
        let b = registry.declare("loop_iter");
        a.bump();
        assert_eq!(b.count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bump_declares_on_first_use() {
        let registry = ProgressRegistry::new();
        registry.bump("requests");
        registry.bump("requests");
        assert_eq!(registry.snapshot().get("requests"), Some(&2));
    }

    #[test]
    fn snapshot_delta_covers_new_points() {
        let registry = ProgressRegistry::new();
        registry.bump("a");
        let before = registry.snapshot();
        registry.bump("a");
        registry.bump("a");
        registry.bump("b");
        let after = registry.snapshot();

        let delta = snapshot_delta(&before, &after);
        assert_eq!(delta, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }
}
