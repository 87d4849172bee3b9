use object::Slot;

/// Slots that point into one evacuation candidate, recorded while marking.
///
/// The buffer has a fixed capacity. A full buffer refuses further slots
/// and its page is evicted from the candidate set instead.
#[derive(Debug)]
pub struct SlotsBuffer {
    slots: Vec<Slot>,
    capacity: usize,
}

impl SlotsBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Append a slot. Returns false if the buffer is full.
    #[inline]
    pub fn record(&mut self, slot: Slot) -> bool {
        if self.slots.len() >= self.capacity {
            return false;
        }
        self.slots.push(slot);
        true
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn take(&mut self) -> Vec<Slot> {
        std::mem::take(&mut self.slots)
    }

    pub fn clear(&mut self) {
        self.slots = Vec::new();
    }
}
