//! Marking in small steps between mutator turns.
//!
//! Incremental marking shares the mark bits, deque and weak lists with the
//! mark-compact collector. A cycle starts by marking the roots, advances in
//! bounded steps and is finished by the next mark-compact, which rescans
//! the roots and drains whatever is still gray. Stores into black objects
//! go through [`Heap::record_write`], which grays their targets.

use object::HeapObject;

use crate::marking::{Marker, is_marked};
use crate::{Heap, HeapState, VisitMode};

/// Where an incremental marking cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingPhase {
    #[default]
    Stopped,
    Marking,
    /// Nothing is gray; the next mark-compact only has to finalize.
    Complete,
}

#[derive(Debug, Default)]
pub(crate) struct IncrementalMarking {
    phase: MarkingPhase,
    steps: usize,
}

impl IncrementalMarking {
    #[inline(always)]
    pub(crate) fn is_active(&self) -> bool {
        self.phase != MarkingPhase::Stopped
    }

    #[inline(always)]
    pub(crate) fn is_complete(&self) -> bool {
        self.phase == MarkingPhase::Complete
    }

    pub(crate) fn stop(&mut self) {
        self.phase = MarkingPhase::Stopped;
        self.steps = 0;
    }
}

impl Heap {
    pub fn marking_phase(&self) -> MarkingPhase {
        self.incremental.phase
    }

    /// Whether an incremental marking cycle is in progress.
    pub fn is_marking(&self) -> bool {
        self.incremental.is_active()
    }

    /// Reset mark state for a new cycle.
    pub(crate) fn prepare_marking(&mut self, compacting: bool) {
        self.marking.reset();
        self.marking.compacting = compacting;
        for chunk in self.allocator.chunks() {
            chunk.set_live_bytes(0);
        }
        self.array_buffers.start_discovery();
    }

    /// Gray everything the strong roots reference.
    pub(crate) fn mark_roots(&mut self) {
        let Heap {
            shapes,
            allocator,
            new_space,
            roots,
            marking,
            array_buffers,
            ..
        } = self;
        let mut marker = Marker {
            shapes: &**shapes,
            allocator,
            new_space,
            state: marking,
            array_buffers,
        };
        roots.iterate(&mut |value| marker.mark_value(*value), VisitMode::StrongOnly);
    }

    /// Begin an incremental cycle. Does nothing if one is running.
    pub fn start_incremental_marking(&mut self) {
        if !self.has_been_setup()
            || self.state != HeapState::NotInGc
            || self.incremental.is_active()
        {
            return;
        }
        log::debug!("starting incremental marking");
        for space in &mut self.paged_spaces {
            space.close_linear_allocation_area();
        }
        self.prepare_marking(false);
        self.incremental.phase = MarkingPhase::Marking;
        self.mark_roots();
    }

    /// Visit up to `budget` bytes of gray objects. Returns true once
    /// marking is complete.
    pub fn incremental_marking_step(&mut self, budget: usize) -> bool {
        match self.incremental.phase {
            MarkingPhase::Stopped => return false,
            MarkingPhase::Complete => return true,
            MarkingPhase::Marking => {}
        }
        let Heap {
            shapes,
            allocator,
            new_space,
            marking,
            array_buffers,
            incremental,
            ..
        } = self;
        let mut marker = Marker {
            shapes: &**shapes,
            allocator,
            new_space,
            state: marking,
            array_buffers,
        };
        let visited = marker.drain(budget);
        if marker.state.deque.is_empty() {
            marker.refill_from_overflow();
        }
        if marker.is_done() {
            marker.process_ephemerons();
        }
        incremental.steps += 1;
        if marker.is_done() {
            incremental.phase = MarkingPhase::Complete;
            log::debug!(
                "incremental marking complete after {} steps, {} bytes visited",
                incremental.steps,
                marker.state.visited_bytes
            );
            return true;
        }
        log::trace!(
            "marking step visited {visited} bytes, {} gray left",
            marker.state.deque.len()
        );
        false
    }

    /// Abandon the current cycle and drop every mark.
    pub(crate) fn abort_incremental_marking(&mut self) {
        log::debug!("aborting incremental marking");
        self.marking.reset();
        self.array_buffers.abort_discovery();
        for chunk in self.allocator.chunks() {
            chunk.marks().clear();
        }
        self.new_space.to_space().marks().clear();
        self.new_space.from_space().marks().clear();
        self.incremental.stop();
    }

    /// The marking half of the write barrier: a black host must never point
    /// at a white object.
    #[cold]
    pub(crate) fn record_write_marking(&mut self, host: HeapObject, target: HeapObject) {
        if !is_marked(&self.new_space, &self.allocator, host) {
            return;
        }
        let Heap {
            shapes,
            allocator,
            new_space,
            marking,
            array_buffers,
            incremental,
            ..
        } = self;
        let mut marker = Marker {
            shapes: &**shapes,
            allocator,
            new_space,
            state: marking,
            array_buffers,
        };
        if !is_marked(marker.new_space, marker.allocator, target) {
            marker.mark_object(target);
            // A completed cycle has gray objects again
            if incremental.phase == MarkingPhase::Complete {
                incremental.phase = MarkingPhase::Marking;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use object::{Value, layout};

    use crate::{AllocationContext, HeapSettings, Pretenure};

    use super::*;

    fn create_test_heap() -> Heap {
        let settings = HeapSettings {
            page_size: 64 * 1024,
            initial_semispace_size: 128 * 1024,
            max_semispace_size: 256 * 1024,
            code_range_size: 0,
            concurrent_unmapping: false,
            verify_heap: true,
            ..HeapSettings::default()
        };
        let mut heap = Heap::new(settings);
        heap.setup(true).unwrap();
        heap
    }

    #[test]
    fn steps_reach_completion() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let array = heap.allocate_fixed_array(ctx, 100, Value::ZERO, Pretenure::Tenured);
        heap.create_handle(array.into());
        heap.start_incremental_marking();
        assert_eq!(heap.marking_phase(), MarkingPhase::Marking);
        let mut steps = 0;
        while !heap.incremental_marking_step(64) {
            steps += 1;
            assert!(steps < 10_000);
        }
        assert_eq!(heap.marking_phase(), MarkingPhase::Complete);
        assert!(heap.is_marking());
        heap.collect_all_garbage(false);
        assert_eq!(heap.marking_phase(), MarkingPhase::Stopped);
    }

    #[test]
    fn barrier_grays_targets_of_black_hosts() {
        let mut heap = create_test_heap();
        let ctx = AllocationContext::mutator();
        let host = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::Tenured);
        let handle = heap.create_handle(host.into());
        heap.start_incremental_marking();
        while !heap.incremental_marking_step(usize::MAX) {}

        let young = heap.allocate_fixed_array(ctx, 1, Value::smi(9), Pretenure::NotTenured);
        let host = heap.handle_value(handle).as_object().unwrap();
        assert!(is_marked(&heap.new_space, &heap.allocator, host));
        unsafe { heap.write_field(host, layout::fixed_array::element_offset(0), young.into()) };
        assert!(is_marked(&heap.new_space, &heap.allocator, young));
        assert_eq!(heap.marking_phase(), MarkingPhase::Marking);

        heap.collect_all_garbage(false);
        let host = heap.handle_value(handle).as_object().unwrap();
        let element = unsafe { host.field(layout::fixed_array::element_offset(0)) };
        let young = element.as_object().unwrap();
        assert_eq!(
            unsafe { young.field(layout::fixed_array::element_offset(0)) },
            Value::smi(9)
        );
    }
}
