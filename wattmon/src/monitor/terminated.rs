//! Retention of terminated workloads.
//!
//! A workload that disappears between two ticks must still surface its
//! final energy attribution to the exporter once; dropping it
//! immediately would systematically under-count short-lived workloads.

use std::collections::HashMap;

use crate::units::Energy;

use super::snapshot::TrackedWorkload;

/// Bounded cache of terminated workloads, ranked by total energy.
///
/// `max_terminated > 0` keeps the top-N workloads by energy, evicting
/// the lowest on insert when full; `0` disables tracking entirely;
/// a negative value retains everything. Workloads below
/// `min_energy_threshold` are never tracked.
pub struct TerminatedTracker<T: TrackedWorkload> {
    max_terminated: i64,
    min_energy_threshold: Energy,
    items: HashMap<String, T>,
}

impl<T: TrackedWorkload> TerminatedTracker<T> {
    pub fn new(max_terminated: i64, min_energy_threshold: Energy) -> TerminatedTracker<T> {
        TerminatedTracker {
            max_terminated,
            min_energy_threshold,
            items: HashMap::new(),
        }
    }

    /// Inserts a terminated workload, applying the retention policy.
    ///
    /// The caller passes an owned clone; the tracker never shares
    /// storage with the live snapshot. A given workload id is inserted
    /// at most once.
    pub fn add(&mut self, workload: T) {
        if self.max_terminated == 0 {
            return;
        }
        let energy = workload.total_energy();
        if energy < self.min_energy_threshold {
            return;
        }
        let id = workload.workload_id();
        if self.items.contains_key(&id) {
            return;
        }

        if self.max_terminated > 0 && self.items.len() >= self.max_terminated as usize {
            // full: the new workload must beat the current minimum
            let min = self
                .items
                .iter()
                .min_by_key(|(_, w)| w.total_energy())
                .map(|(id, w)| (id.clone(), w.total_energy()));
            match min {
                Some((min_id, min_energy)) if energy > min_energy => {
                    self.items.remove(&min_id);
                }
                _ => return,
            }
        }
        self.items.insert(id, workload);
    }

    /// The retained workloads, highest energy first.
    pub fn items(&self) -> Vec<T> {
        let mut items: Vec<T> = self.items.values().cloned().collect();
        items.sort_by(|a, b| b.total_energy().cmp(&a.total_energy()));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ZoneId;
    use crate::monitor::snapshot::{Process, Usage};

    fn process(pid: i32, energy_uj: u64) -> Process {
        let mut p = Process {
            pid,
            comm: format!("proc-{pid}"),
            ..Default::default()
        };
        p.zones.insert(
            ZoneId::new("package", 0),
            Usage {
                energy_total: Energy::from_micro_joules(energy_uj),
                ..Default::default()
            },
        );
        p
    }

    #[test]
    fn keeps_top_n_by_energy() {
        let mut tracker = TerminatedTracker::new(2, Energy::ZERO);
        tracker.add(process(1, 100));
        tracker.add(process(2, 300));
        tracker.add(process(3, 200));

        let items = tracker.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].pid, 2);
        assert_eq!(items[1].pid, 3);
    }

    #[test]
    fn low_energy_insert_does_not_evict() {
        let mut tracker = TerminatedTracker::new(2, Energy::ZERO);
        tracker.add(process(1, 100));
        tracker.add(process(2, 300));
        tracker.add(process(3, 50));

        let pids: Vec<i32> = tracker.items().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 1]);
    }

    #[test]
    fn disabled_tracker_drops_everything() {
        let mut tracker = TerminatedTracker::new(0, Energy::ZERO);
        tracker.add(process(1, 1_000_000));
        assert!(tracker.is_empty());
    }

    #[test]
    fn negative_capacity_is_unbounded() {
        let mut tracker = TerminatedTracker::new(-1, Energy::ZERO);
        for pid in 0..1000 {
            tracker.add(process(pid, pid as u64 + 1));
        }
        assert_eq!(tracker.len(), 1000);
    }

    #[test]
    fn threshold_filters_small_workloads() {
        let mut tracker = TerminatedTracker::new(10, Energy::from_micro_joules(500));
        tracker.add(process(1, 499));
        tracker.add(process(2, 500));
        let pids: Vec<i32> = tracker.items().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2]);
    }

    #[test]
    fn same_id_inserted_once() {
        let mut tracker = TerminatedTracker::new(10, Energy::ZERO);
        tracker.add(process(1, 100));
        tracker.add(process(1, 900));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.items()[0].total_energy(), Energy::from_micro_joules(100));
    }

    #[test]
    fn clear_empties_the_tracker() {
        let mut tracker = TerminatedTracker::new(10, Energy::ZERO);
        tracker.add(process(1, 100));
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
