//! Deferred release of freed chunks.
//!
//! Regular pages are uncommitted and kept in a pool for reuse; large and
//! executable chunks are unmapped. The work runs on a bounded number of
//! background threads so a collection does not pay for the syscalls.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{HeapSettings, VirtualMemory};

#[derive(Default)]
struct Queues {
    /// Committed regular pages waiting to be uncommitted.
    regular: Vec<VirtualMemory>,
    /// Uncommitted regular pages ready for reuse.
    pooled: Vec<VirtualMemory>,
    /// Chunks that are unmapped, never pooled.
    non_regular: Vec<VirtualMemory>,
    active_tasks: usize,
}

struct Shared {
    queues: Mutex<Queues>,
    idle: Condvar,
    max_pooled: usize,
}

pub struct Unmapper {
    shared: Arc<Shared>,
    max_tasks: usize,
    concurrent: bool,
}

/// Decrements the task count even if a release panics.
struct TaskGuard<'a>(&'a Shared);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let mut queues = self.0.queues.lock();
        queues.active_tasks -= 1;
        self.0.idle.notify_all();
    }
}

impl Unmapper {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                idle: Condvar::new(),
                max_pooled: settings.max_pooled_pages,
            }),
            max_tasks: settings.unmapper_max_tasks,
            concurrent: settings.concurrent_unmapping,
        }
    }

    /// Queue a freed chunk. `regular` chunks are eligible for pooling.
    pub fn add(&self, memory: VirtualMemory, regular: bool) {
        let mut queues = self.shared.queues.lock();
        if regular {
            queues.regular.push(memory);
        } else {
            queues.non_regular.push(memory);
        }
    }

    /// Take a pooled page for reuse. The caller must commit it again.
    pub fn try_take_pooled(&self) -> Option<VirtualMemory> {
        let mut queues = self.shared.queues.lock();
        if let Some(memory) = queues.pooled.pop() {
            return Some(memory);
        }
        queues.regular.pop()
    }

    /// Process the queues, on a background thread when allowed.
    pub fn free_queued_chunks(&self) {
        {
            let mut queues = self.shared.queues.lock();
            if queues.regular.is_empty() && queues.non_regular.is_empty() {
                return;
            }
            if !self.concurrent || queues.active_tasks >= self.max_tasks {
                drop(queues);
                if !self.concurrent {
                    perform_free_memory_on_queued_chunks(&self.shared);
                }
                return;
            }
            queues.active_tasks += 1;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("unmapper".into())
            .spawn(move || {
                let _guard = TaskGuard(&shared);
                log::trace!("unmapper task started");
                perform_free_memory_on_queued_chunks(&shared);
                log::trace!("unmapper task finished");
            });
        if let Err(err) = spawned {
            log::warn!("could not spawn unmapper task, unmapping inline: {err}");
            self.shared.queues.lock().active_tasks -= 1;
            perform_free_memory_on_queued_chunks(&self.shared);
        }
    }

    /// Wait for background tasks, then finish any remaining queued work on
    /// this thread. Must run before the owning allocator goes away.
    pub fn ensure_unmapping_completed(&self) {
        {
            let mut queues = self.shared.queues.lock();
            while queues.active_tasks > 0 {
                self.shared.idle.wait(&mut queues);
            }
        }
        perform_free_memory_on_queued_chunks(&self.shared);
    }

    /// Drain everything, including the pool.
    pub fn tear_down(&self) {
        self.ensure_unmapping_completed();
        let pooled = std::mem::take(&mut self.shared.queues.lock().pooled);
        drop(pooled);
    }

    pub fn pooled_count(&self) -> usize {
        self.shared.queues.lock().pooled.len()
    }

    pub fn queued_count(&self) -> usize {
        let queues = self.shared.queues.lock();
        queues.regular.len() + queues.non_regular.len()
    }

    pub fn active_tasks(&self) -> usize {
        self.shared.queues.lock().active_tasks
    }
}

impl Drop for Unmapper {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl core::fmt::Debug for Unmapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Unmapper")
            .field("queued", &self.queued_count())
            .field("pooled", &self.pooled_count())
            .finish()
    }
}

fn perform_free_memory_on_queued_chunks(shared: &Shared) {
    loop {
        let (regular, non_regular) = {
            let mut queues = shared.queues.lock();
            (queues.regular.pop(), queues.non_regular.pop())
        };
        if regular.is_none() && non_regular.is_none() {
            break;
        }
        if let Some(memory) = regular {
            if !memory.uncommit(memory.address(), memory.size()) {
                log::error!("failed to uncommit {memory:?}");
                panic!("failed to uncommit pooled page");
            }
            let mut queues = shared.queues.lock();
            if queues.pooled.len() < shared.max_pooled {
                queues.pooled.push(memory);
            } else {
                drop(queues);
                memory.release();
            }
        }
        if let Some(memory) = non_regular {
            memory.release();
        }
    }
}
