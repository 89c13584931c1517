//! The fixed-layout header sent to the loader at start.

use std::time::Duration;

pub const IMAGE_INFO_SIZE: usize = 104;

pub const MAGIC_1: u32 = 0x7e1c_5d67;
pub const MAGIC_2: u64 = 0x7873_f1b6_e7a6_1d2c;

/// Fresh start: the stack is untouched.
pub const INIT_ROUTINE_ENTER: u32 = 0;
/// Resume from a snapshot: the stack holds a suspended call chain.
pub const INIT_ROUTINE_RESUME: u32 = 1;

// Disjoint address ranges the loader maps text, stack and heap into.
const TEXT_ADDR_MIN: u64 = 0x0000_1000_0000;
const TEXT_ADDR_MAX: u64 = 0x0fff_f000_0000;
const STACK_ADDR_MIN: u64 = 0x1000_0000_0000;
const STACK_ADDR_MAX: u64 = 0x1fff_f000_0000;
const HEAP_ADDR_MIN: u64 = 0x2000_0000_0000;
const HEAP_ADDR_MAX: u64 = 0x3fff_f000_0000;

/// Size of the header the loader leaves at offset 0 of the state file (the
/// bottom of the stack region) when a program stops.
pub const STACK_VARS_SIZE: usize = 16;

/// WebAssembly linear memory grows in units of 64 KiB.
pub const WASM_PAGE_SIZE: u32 = 65536;

/// Random bytes consumed by the address layout.
pub const LAYOUT_RANDOM_SIZE: usize = 12;
/// Random bytes seeded into programs that import the RNG.
pub const SEED_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageInfo {
    pub magic1: u32,
    pub page_size: u32,
    pub text_addr: u64,
    pub stack_addr: u64,
    pub heap_addr: u64,
    pub random: [u8; SEED_SIZE],
    pub text_size: u32,
    pub stack_size: u32,
    pub stack_unused: u32,
    pub globals_size: u32,
    pub init_memory_size: u32,
    pub grow_memory_size: u32,
    pub init_routine: u32,
    pub start_addr: u32,
    pub entry_addr: u32,
    pub time_mask: u32,
    pub monotonic_time: u64,
    pub magic2: u64,
}

const _: () = assert!(std::mem::size_of::<ImageInfo>() == IMAGE_INFO_SIZE);

impl ImageInfo {
    pub fn encode(&self) -> [u8; IMAGE_INFO_SIZE] {
        let mut buf = [0u8; IMAGE_INFO_SIZE];
        let mut w = Writer {
            buf: &mut buf,
            pos: 0,
        };
        w.u32(self.magic1);
        w.u32(self.page_size);
        w.u64(self.text_addr);
        w.u64(self.stack_addr);
        w.u64(self.heap_addr);
        w.bytes(&self.random);
        w.u32(self.text_size);
        w.u32(self.stack_size);
        w.u32(self.stack_unused);
        w.u32(self.globals_size);
        w.u32(self.init_memory_size);
        w.u32(self.grow_memory_size);
        w.u32(self.init_routine);
        w.u32(self.start_addr);
        w.u32(self.entry_addr);
        w.u32(self.time_mask);
        w.u64(self.monotonic_time);
        w.u64(self.magic2);
        buf
    }

    /// Parses a header, rejecting it if either magic number is wrong.
    pub fn decode(buf: &[u8; IMAGE_INFO_SIZE]) -> Option<Self> {
        let mut r = Reader { buf, pos: 0 };
        let info = ImageInfo {
            magic1: r.u32(),
            page_size: r.u32(),
            text_addr: r.u64(),
            stack_addr: r.u64(),
            heap_addr: r.u64(),
            random: r.array(),
            text_size: r.u32(),
            stack_size: r.u32(),
            stack_unused: r.u32(),
            globals_size: r.u32(),
            init_memory_size: r.u32(),
            grow_memory_size: r.u32(),
            init_routine: r.u32(),
            start_addr: r.u32(),
            entry_addr: r.u32(),
            time_mask: r.u32(),
            monotonic_time: r.u64(),
            magic2: r.u64(),
        };
        (info.magic1 == MAGIC_1 && info.magic2 == MAGIC_2).then_some(info)
    }

    pub fn is_resume(&self) -> bool {
        self.init_routine == INIT_ROUTINE_RESUME
    }
}

/// Stack-vars header: how far a stopped program got.
///
/// ```text
/// 0   u32  stack_unused
/// 4   u32  memory_pages
/// 8   u64  monotonic_time (loader clock at the stop, informational)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackVars {
    pub stack_unused: u32,
    pub memory_pages: u32,
    pub monotonic_time: u64,
}

impl StackVars {
    pub fn encode(&self) -> [u8; STACK_VARS_SIZE] {
        let mut buf = [0u8; STACK_VARS_SIZE];
        buf[0..4].copy_from_slice(&self.stack_unused.to_le_bytes());
        buf[4..8].copy_from_slice(&self.memory_pages.to_le_bytes());
        buf[8..16].copy_from_slice(&self.monotonic_time.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; STACK_VARS_SIZE]) -> Self {
        let mut stack_unused = [0u8; 4];
        let mut memory_pages = [0u8; 4];
        let mut monotonic_time = [0u8; 8];
        stack_unused.copy_from_slice(&buf[0..4]);
        memory_pages.copy_from_slice(&buf[4..8]);
        monotonic_time.copy_from_slice(&buf[8..16]);
        Self {
            stack_unused: u32::from_le_bytes(stack_unused),
            memory_pages: u32::from_le_bytes(memory_pages),
            monotonic_time: u64::from_le_bytes(monotonic_time),
        }
    }

    /// Linear memory size in bytes, or `None` if it does not fit in `u32`.
    pub fn mem_size(&self) -> Option<u32> {
        self.memory_pages.checked_mul(WASM_PAGE_SIZE)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8; IMAGE_INFO_SIZE],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8; IMAGE_INFO_SIZE],
    pos: usize,
}

impl Reader<'_> {
    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
}

/// Text, stack and heap placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub text_addr: u64,
    pub stack_addr: u64,
    pub heap_addr: u64,
}

impl Layout {
    /// Picks page-aligned addresses from the random bytes. A non-zero
    /// `fixed_text` (a resumed program's text) is kept as is.
    pub fn randomize(page_size: u32, fixed_text: u64, random: &[u8; LAYOUT_RANDOM_SIZE]) -> Self {
        let page = u64::from(page_size);
        let text_addr = if fixed_text != 0 {
            fixed_text
        } else {
            random_addr(TEXT_ADDR_MIN, TEXT_ADDR_MAX, page, &random[0..4])
        };
        Self {
            text_addr,
            stack_addr: random_addr(STACK_ADDR_MIN, STACK_ADDR_MAX, page, &random[4..8]),
            heap_addr: random_addr(HEAP_ADDR_MIN, HEAP_ADDR_MAX, page, &random[8..12]),
        }
    }
}

fn random_addr(min: u64, max: u64, page: u64, random: &[u8]) -> u64 {
    let pages = (max - min) / page;
    let n = u64::from(u32::from_le_bytes([random[0], random[1], random[2], random[3]]));
    min + (n % pages) * page
}

/// Bitmask that clears clock bits below the time resolution.
///
/// Zero or anything coarser than a second means one second. The resolution
/// is rounded up to a power of two nanoseconds.
pub fn time_mask(resolution: Duration) -> u32 {
    let ns = if resolution.is_zero() || resolution > Duration::from_secs(1) {
        1_000_000_000
    } else {
        resolution.as_nanos() as u32
    };
    !(ns.next_power_of_two() - 1)
}
