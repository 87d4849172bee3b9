mod system;

mod allocation;
mod array_buffer_tracker;
mod bitmap;
mod chunk;
mod code_range;
mod error;
mod external_string_table;
mod free_list;
mod heap;
mod incremental_marking;
mod large_object_space;
mod mark_compact;
mod marking;
mod memory_allocator;
mod new_space;
mod paged_space;
mod read_only;
mod roots;
mod scavenger;
mod settings;
mod slots_buffer;
mod space;
mod sweeper;
mod tracer;
mod unmapper;
mod verify;

pub use system::OS_PAGE_SIZE;

pub use allocation::{AllocationContext, AllocationResult};
pub use array_buffer_tracker::{ArrayBufferTracker, BackingStore};
pub use bitmap::Bitmap;
pub(crate) use chunk::ChunkBacking;
pub use chunk::{ChunkFlags, ChunkId, MarkBits, MemoryChunk, PageHandle};
pub use code_range::{CodeRange, CodeRangeAddressHint, SharedAddressHint};
pub use error::{HeapError, fatal_out_of_memory};
pub use external_string_table::{ExternalStringResource, ExternalStringTable};
pub use free_list::{FreeBlock, FreeList};
pub use heap::{
    GarbageCollector, GcCallback, GcTypeFlags, GlobalGcCallback, Heap, HeapState, MoveListener,
    Pretenure,
};
pub use incremental_marking::MarkingPhase;
pub use large_object_space::LargeObjectSpace;
pub use memory_allocator::{FreeMode, MemoryAllocator, VirtualMemory};
pub use new_space::{NewSpace, SemiSpace};
pub use paged_space::{PagedSpace, SpaceAccounting};
pub use roots::{GlobalHandles, Handle, RootIndex, RootProvider, Roots, RootsTable, VisitMode};
pub use settings::HeapSettings;
pub use slots_buffer::SlotsBuffer;
pub use space::{AllocationSpace, Executability, PAGED_SPACE_COUNT};
pub use tracer::{GcEvent, HeapStats, SpaceStats};
pub use unmapper::Unmapper;
