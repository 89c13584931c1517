//! The process facade: starting, serving, suspending and killing programs.

mod debug;
pub mod image_info;
mod process;
mod serve;
pub mod status;

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

pub use debug::DebugLog;
pub use image_info::ImageInfo;
pub use process::Process;
pub use serve::SEND_QUEUE_LEN;
pub use status::Outcome;

/// Largest linear memory a program may grow to (32768 WebAssembly pages).
pub const MAX_MEMORY_SIZE: u32 = 0x8000_0000;
pub const MAX_STACK_SIZE: u32 = 0x0800_0000;

/// Compiled program text.
pub trait ProgramCode: Send + Sync {
    fn page_size(&self) -> u32;
    fn text_size(&self) -> u32;
    /// Descriptor the loader maps the text from.
    fn text_fd(&self) -> BorrowedFd<'_>;
    /// Whether the program imports the random seed.
    fn random_seed(&self) -> bool;
}

/// Mutable program state: stack, globals and memory, plus the metadata the
/// loader needs to map them.
pub trait ProgramState: Send + Sync {
    /// Text address of a resumed program, or 0 to pick a random one.
    fn text_addr(&self) -> u64;
    fn stack_size(&self) -> u32;
    /// Bytes of stack in use; 0 for a fresh program.
    fn stack_usage(&self) -> u32;
    fn globals_size(&self) -> u32;
    fn mem_size(&self) -> u32;
    fn max_mem_size(&self) -> u32;
    fn start_addr(&self) -> u32;
    fn entry_addr(&self) -> u32;
    /// Clock base carried over from a snapshot.
    fn monotonic_time(&self) -> u64;

    /// Marks the state as being mutated and returns a read-write
    /// descriptor of it. The mark stays until the owner clears it.
    fn begin_mutation(&self, text_addr: u64) -> io::Result<OwnedFd>;
}

/// Per-run settings.
pub struct Policy {
    /// Clock precision exposed to the program.
    pub time_resolution: Duration,
    /// Destination of the program's debug output, if wanted.
    pub debug_log: Option<DebugLog>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            time_resolution: Duration::from_millis(1),
            debug_log: None,
        }
    }
}
