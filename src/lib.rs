//! Runs untrusted WebAssembly programs in sandboxed processes, all hosted
//! by a single container per [`Executor`].

pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod packet;
pub mod runtime;
pub mod service;
pub mod snapshot;
pub mod trap;

pub use error::{Error, ErrorKind, Result};
pub use executor::Executor;
pub use runtime::{Outcome, Policy, Process, ProgramCode, ProgramState};
pub use snapshot::{Buffers, Snapshot};
pub use trap::{ProgramResult, TrapId};
