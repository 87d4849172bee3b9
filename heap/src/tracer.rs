use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::{AllocationSpace, GarbageCollector, SpaceAccounting};

const MAX_EVENTS: usize = 32;

/// One finished collection.
#[derive(Debug, Clone)]
pub struct GcEvent {
    pub collector: GarbageCollector,
    pub reason: &'static str,
    /// Bytes in all spaces before and after.
    pub size_before: usize,
    pub size_after: usize,
    /// Bytes moved from new space into old space.
    pub promoted_bytes: usize,
    /// Bytes copied within new space.
    pub copied_bytes: usize,
    pub duration: Duration,
}

/// Running totals and the most recent collections.
#[derive(Debug, Default)]
pub(crate) struct GcTracer {
    events: VecDeque<GcEvent>,
    pub(crate) scavenges: usize,
    pub(crate) mark_compacts: usize,
    pub(crate) promoted_bytes: usize,
    pub(crate) copied_bytes: usize,
    pub(crate) total_pause: Duration,
    pub(crate) max_pause: Duration,
    pub(crate) survival_rate: f64,
}

impl GcTracer {
    pub(crate) fn record(&mut self, event: GcEvent) {
        match event.collector {
            GarbageCollector::Scavenger => self.scavenges += 1,
            GarbageCollector::MarkCompactor => self.mark_compacts += 1,
        }
        self.promoted_bytes += event.promoted_bytes;
        self.copied_bytes += event.copied_bytes;
        self.total_pause += event.duration;
        self.max_pause = self.max_pause.max(event.duration);
        log::debug!(
            "{:?} ({}): {} -> {} bytes, promoted {}, copied {}, {:?}",
            event.collector,
            event.reason,
            event.size_before,
            event.size_after,
            event.promoted_bytes,
            event.copied_bytes,
            event.duration
        );
        if self.events.len() == MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &GcEvent> {
        self.events.iter()
    }
}

/// Usage of one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStats {
    pub space: AllocationSpace,
    pub capacity: usize,
    pub size: usize,
    pub available: usize,
    pub waste: usize,
}

impl SpaceStats {
    pub(crate) fn paged(space: AllocationSpace, accounting: SpaceAccounting) -> Self {
        Self {
            space,
            capacity: accounting.capacity,
            size: accounting.size,
            available: accounting.available,
            waste: accounting.waste,
        }
    }
}

/// A snapshot of the heap.
#[derive(Debug, Clone)]
pub struct HeapStats {
    pub spaces: Vec<SpaceStats>,
    pub scavenges: usize,
    pub mark_compacts: usize,
    pub promoted_bytes: usize,
    pub copied_bytes: usize,
    pub total_pause: Duration,
    pub max_pause: Duration,
    /// Fraction of new space that survived the last scavenge.
    pub survival_rate: f64,
    pub old_generation_size: usize,
    pub promotion_limit: usize,
    pub allocation_limit: usize,
    pub external_memory: usize,
    pub array_buffers: usize,
    pub freed_array_buffers: usize,
    pub global_handles: usize,
    pub recent: Vec<GcEvent>,
}

impl HeapStats {
    pub fn space(&self, space: AllocationSpace) -> Option<&SpaceStats> {
        self.spaces.iter().find(|stats| stats.space == space)
    }

    /// Bytes in all spaces.
    pub fn total_size(&self) -> usize {
        self.spaces.iter().map(|stats| stats.size).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.spaces.iter().map(|stats| stats.capacity).sum()
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:>12} {:>12} {:>12} {:>10}",
            "space", "capacity", "size", "available", "waste"
        )?;
        for stats in &self.spaces {
            writeln!(
                f,
                "{:<12} {:>12} {:>12} {:>12} {:>10}",
                stats.space.name(),
                stats.capacity,
                stats.size,
                stats.available,
                stats.waste
            )?;
        }
        writeln!(
            f,
            "scavenges: {}, mark-compacts: {}, total pause {:?}, max pause {:?}",
            self.scavenges, self.mark_compacts, self.total_pause, self.max_pause
        )?;
        writeln!(
            f,
            "promoted {} bytes, copied {} bytes, last survival rate {:.1}%",
            self.promoted_bytes,
            self.copied_bytes,
            self.survival_rate * 100.0
        )?;
        writeln!(
            f,
            "old generation {} bytes (promotion limit {}, allocation limit {})",
            self.old_generation_size, self.promotion_limit, self.allocation_limit
        )?;
        write!(
            f,
            "external {} bytes, {} array buffers ({} freed), {} global handles",
            self.external_memory, self.array_buffers, self.freed_array_buffers, self.global_handles
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(collector: GarbageCollector, millis: u64) -> GcEvent {
        GcEvent {
            collector,
            reason: "test",
            size_before: 100,
            size_after: 50,
            promoted_bytes: 10,
            copied_bytes: 20,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn totals_and_bounded_history() {
        let mut tracer = GcTracer::default();
        for i in 0..40 {
            let collector = if i % 4 == 0 {
                GarbageCollector::MarkCompactor
            } else {
                GarbageCollector::Scavenger
            };
            tracer.record(event(collector, i));
        }
        assert_eq!(tracer.scavenges, 30);
        assert_eq!(tracer.mark_compacts, 10);
        assert_eq!(tracer.promoted_bytes, 400);
        assert_eq!(tracer.max_pause, Duration::from_millis(39));
        assert_eq!(tracer.events().count(), MAX_EVENTS);
        assert_eq!(
            tracer.events().next().map(|e| e.duration),
            Some(Duration::from_millis(8))
        );
    }
}
