use clap::Parser as ClapParser;

use heap::{AllocationContext, ExternalStringResource, Handle, Heap, HeapSettings, Pretenure};
use object::{ShapeFlags, ShapeId, Value, WORD_SIZE, layout};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of workload steps
    #[arg(short, long, default_value_t = 200_000)]
    iterations: usize,

    /// Seed for the workload generator
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// How many objects the mutator keeps rooted at once
    #[arg(long, default_value_t = 2_000)]
    live_roots: usize,

    #[arg(long, default_value_t = 256, help = "Page size in KiB")]
    page_kb: usize,

    #[arg(long, default_value_t = 512, help = "Initial semispace size in KiB")]
    semispace_kb: usize,

    #[arg(long, default_value_t = 8192, help = "Maximum semispace size in KiB")]
    max_semispace_kb: usize,

    #[arg(long, default_value_t = 256, help = "Maximum old generation size in MiB")]
    max_old_mb: usize,

    /// Send an idle notification every this many steps (0 disables)
    #[arg(long, default_value_t = 5_000)]
    idle_every: usize,

    #[arg(long, help = "Disable incremental marking")]
    no_incremental: bool,

    #[arg(long, help = "Verify the heap after every collection")]
    verify: bool,

    #[arg(long, help = "Promote immutable objects to read-only space at the end")]
    read_only: bool,
}

struct OwnedBytes(Vec<u8>);

impl ExternalStringResource for OwnedBytes {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Roots held by the mutator; the oldest is dropped when full.
struct RootRing {
    handles: Vec<Handle>,
    next: usize,
    capacity: usize,
}

impl RootRing {
    fn new(capacity: usize) -> Self {
        Self {
            handles: Vec::with_capacity(capacity),
            next: 0,
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, heap: &mut Heap, value: Value) {
        let handle = heap.create_handle(value);
        if self.handles.len() < self.capacity {
            self.handles.push(handle);
            return;
        }
        heap.destroy_handle(self.handles[self.next]);
        self.handles[self.next] = handle;
        self.next = (self.next + 1) % self.capacity;
    }

    fn pick(&self, heap: &Heap, roll: u64) -> Value {
        if self.handles.is_empty() {
            return Value::ZERO;
        }
        heap.handle_value(self.handles[roll as usize % self.handles.len()])
    }

    fn drop_one(&mut self, heap: &mut Heap) {
        if let Some(handle) = self.handles.pop() {
            heap.destroy_handle(handle);
            if self.next >= self.handles.len() {
                self.next = 0;
            }
        }
    }
}

fn next_rand(seed: &mut u64) -> u64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    *seed >> 33
}

fn build_list(heap: &mut Heap, ctx: AllocationContext, node: ShapeId, length: usize) -> Value {
    let mut next = Value::ZERO;
    for index in 0..length {
        let cell = heap.allocate_struct(ctx, node, next, Pretenure::NotTenured);
        // SAFETY: the struct was just allocated with two fields
        unsafe { heap.write_field(cell, layout::HEADER_SIZE, Value::smi(index as i64)) };
        next = cell.into();
    }
    next
}

fn build_cycle(heap: &mut Heap, ctx: AllocationContext) -> Value {
    let a = heap.allocate_fixed_array(ctx, 1, Value::ZERO, Pretenure::NotTenured);
    let b = heap.allocate_fixed_array(ctx, 1, a.into(), Pretenure::NotTenured);
    let offset = layout::fixed_array::element_offset(0);
    // SAFETY: b is fresh and holds the current location of a
    unsafe {
        if let Some(a) = b.field(offset).as_object() {
            heap.write_field(a, offset, b.into());
        }
    }
    b.into()
}

fn run(cli: &Cli, heap: &mut Heap) {
    let ctx = AllocationContext::mutator();
    let node = heap.register_struct_shape("list-node", 2, ShapeFlags::NONE);
    let mut roots = RootRing::new(cli.live_roots);
    let mut seed = cli.seed;
    let large_length = heap.settings().max_regular_object_size() / WORD_SIZE;

    for step in 0..cli.iterations {
        let roll = next_rand(&mut seed) % 100;
        let value = match roll {
            0..30 => {
                let length = 1 + next_rand(&mut seed) as usize % 16;
                Some(build_list(heap, ctx, node, length))
            }
            30..45 => {
                let length = if next_rand(&mut seed) % 500 == 0 {
                    large_length
                } else {
                    next_rand(&mut seed) as usize % 64
                };
                let fill = roots.pick(heap, next_rand(&mut seed));
                Some(heap.allocate_fixed_array(ctx, length, fill, Pretenure::NotTenured).into())
            }
            45..55 => Some(build_cycle(heap, ctx)),
            55..62 => {
                let target = roots.pick(heap, next_rand(&mut seed));
                Some(heap.allocate_weak_cell(ctx, target, Pretenure::NotTenured).into())
            }
            62..67 => {
                let length = 16 + next_rand(&mut seed) as usize % 4096;
                Some(heap.allocate_array_buffer(ctx, length, Pretenure::NotTenured).into())
            }
            67..70 => {
                let text = format!("external string {step}").into_bytes();
                let resource = Box::new(OwnedBytes(text));
                Some(heap.allocate_external_string(ctx, resource, Pretenure::NotTenured).into())
            }
            70..74 => {
                let text = format!("constant {}", step % 97);
                Some(heap.allocate_byte_string(ctx, text.as_bytes(), Pretenure::Tenured).into())
            }
            74..75 => {
                let pool = roots.pick(heap, next_rand(&mut seed));
                Some(heap.allocate_code(ctx, &[0x90; 48], pool).into())
            }
            75..80 => {
                roots.drop_one(heap);
                None
            }
            _ => {
                let bytes = 8 + next_rand(&mut seed) as usize % 256;
                heap.allocate_byte_array(ctx, bytes, Pretenure::NotTenured);
                None
            }
        };
        if let Some(value) = value {
            roots.push(heap, value);
        }
        if cli.idle_every > 0 && step % cli.idle_every == cli.idle_every - 1 {
            heap.idle_notification(4);
        }
    }
    log::info!("workload finished after {} steps", cli.iterations);
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = HeapSettings {
        page_size: cli.page_kb * 1024,
        initial_semispace_size: cli.semispace_kb * 1024,
        max_semispace_size: cli.max_semispace_kb * 1024,
        max_old_generation_size: cli.max_old_mb * 1024 * 1024,
        incremental_marking: !cli.no_incremental,
        verify_heap: cli.verify,
        ..HeapSettings::default()
    };
    let mut heap = Heap::new(settings);
    if let Err(err) = heap.setup(true) {
        eprintln!("Error setting up heap: {err}");
        std::process::exit(1);
    }

    run(&cli, &mut heap);

    if cli.read_only {
        let promoted = heap.promote_read_only();
        println!("promoted {promoted} objects to read-only space");
    }
    heap.collect_all_garbage(true);
    if cli.verify {
        heap.verify_heap();
    }

    let stats = heap.stats();
    println!("{stats}");
    println!("recent collections:");
    for event in &stats.recent {
        println!(
            "  {:?} ({}): {} -> {} bytes, promoted {}, copied {}, {:?}",
            event.collector,
            event.reason,
            event.size_before,
            event.size_after,
            event.promoted_bytes,
            event.copied_bytes,
            event.duration
        );
    }
}
