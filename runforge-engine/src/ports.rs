//! Port range allocation for concurrently active runs
//!
//! Each run gets a half-open port interval `[base, base + count)` plus a
//! spacing margin reserved exclusively for it while active. The trainer's
//! internal environment workers communicate over these ports, so two live
//! allocations must never overlap, margins included.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// A reserved port interval for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port of the interval
    pub base: u16,
    /// Number of ports in use by the run itself (one per environment)
    pub count: u16,
}

impl PortRange {
    /// End of the span this range blocks for other runs, margin included.
    fn reserved_end(&self, spacing: u16) -> u32 {
        self.base as u32 + self.count as u32 + spacing as u32
    }
}

/// Assigns non-overlapping port ranges to active runs
///
/// Both operations take the single internal mutex for the duration of the
/// table mutation only, so allocation is atomic with respect to concurrent
/// allocate/release calls from runs starting or finishing at the same time.
pub struct PortAllocator {
    floor: u16,
    spacing: u16,
    held: Mutex<HashMap<Uuid, PortRange>>,
}

impl PortAllocator {
    pub fn new(floor: u16, spacing: u16) -> Self {
        Self {
            floor,
            spacing,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves `count` ports for `run_id` and returns the interval.
    ///
    /// Scans held intervals sorted by start and takes the first gap at or
    /// after the floor large enough for `count` ports plus the spacing
    /// margin; if no gap exists, places the interval after the last one.
    pub fn allocate(&self, run_id: Uuid, count: u16) -> Result<PortRange> {
        let count = count.max(1);
        let mut held = self.held.lock().expect("port table poisoned");

        // A re-allocation for the same run replaces its previous interval.
        held.remove(&run_id);

        let mut ranges: Vec<PortRange> = held.values().copied().collect();
        ranges.sort_by_key(|r| r.base);

        let mut candidate = self.floor as u32;
        for range in &ranges {
            if candidate + count as u32 + self.spacing as u32 <= range.base as u32 {
                break;
            }
            candidate = range.reserved_end(self.spacing);
        }

        if candidate + count as u32 > u16::MAX as u32 {
            anyhow::bail!(
                "port space exhausted: cannot fit {} ports above {}",
                count,
                candidate
            );
        }

        let range = PortRange {
            base: candidate as u16,
            count,
        };
        held.insert(run_id, range);
        info!(
            "Allocated ports {}-{} for run {} ({} envs)",
            range.base,
            range.base + range.count - 1,
            run_id,
            range.count
        );
        Ok(range)
    }

    /// Frees the interval held by `run_id`, if any. Idempotent.
    pub fn release(&self, run_id: &Uuid) {
        let mut held = self.held.lock().expect("port table poisoned");
        if let Some(range) = held.remove(run_id) {
            debug!(
                "Released ports {}-{} for run {}",
                range.base,
                range.base + range.count - 1,
                run_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn overlaps(a: PortRange, b: PortRange, spacing: u16) -> bool {
        let (a_start, a_end) = (a.base as u32, a.reserved_end(spacing));
        let (b_start, b_end) = (b.base as u32, b.reserved_end(spacing));
        a_start < b_end && b_start < a_end
    }

    #[test]
    fn test_first_allocation_starts_at_floor() {
        let allocator = PortAllocator::new(5000, 10);
        let a = allocator.allocate(Uuid::new_v4(), 4).unwrap();
        assert_eq!(a.base, 5000);

        let b = allocator.allocate(Uuid::new_v4(), 4).unwrap();
        assert!(b.base >= 5014, "second range must clear the margin, got {}", b.base);
        assert!(!overlaps(a, b, 10));
    }

    #[test]
    fn test_release_reopens_gap() {
        let allocator = PortAllocator::new(5000, 10);
        let first = Uuid::new_v4();
        allocator.allocate(first, 4).unwrap();
        let b = allocator.allocate(Uuid::new_v4(), 4).unwrap();

        allocator.release(&first);
        let c = allocator.allocate(Uuid::new_v4(), 4).unwrap();
        assert_eq!(c.base, 5000, "freed gap before {} should be reused", b.base);
    }

    #[test]
    fn test_reallocation_replaces_previous_interval() {
        let allocator = PortAllocator::new(5000, 10);
        let id = Uuid::new_v4();
        allocator.allocate(id, 4).unwrap();
        let again = allocator.allocate(id, 8).unwrap();
        assert_eq!(again.base, 5000);
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(5000, 10);
        let id = Uuid::new_v4();
        allocator.allocate(id, 2).unwrap();
        allocator.release(&id);
        allocator.release(&id);
    }

    #[test]
    fn test_no_overlap_across_mixed_sequences() {
        let allocator = PortAllocator::new(5000, 10);
        let mut live: Vec<(Uuid, PortRange)> = Vec::new();

        for i in 0..20u16 {
            let id = Uuid::new_v4();
            let range = allocator.allocate(id, 1 + i % 5).unwrap();
            live.push((id, range));

            // Periodically release one in the middle to create gaps
            if i % 3 == 0 && live.len() > 1 {
                let (gone, _) = live.remove(live.len() / 2);
                allocator.release(&gone);
            }

            for (i, (_, a)) in live.iter().enumerate() {
                for (_, b) in live.iter().skip(i + 1) {
                    assert!(!overlaps(*a, *b, 10), "{:?} overlaps {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let allocator = Arc::new(PortAllocator::new(5000, 10));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                let id = Uuid::new_v4();
                let range = allocator.allocate(id, 4).unwrap();
                (id, range)
            }));
        }

        let ranges: Vec<(Uuid, PortRange)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        for (i, (_, a)) in ranges.iter().enumerate() {
            for (_, b) in ranges.iter().skip(i + 1) {
                assert!(!overlaps(*a, *b, 10), "{:?} overlaps {:?}", a, b);
            }
        }
    }
}
