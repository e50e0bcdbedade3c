//! Virtual memory substrate for garbage collected arenas.
//!
//! An arena asks for one big reservation of address space up front and then
//! grows and shrinks by committing ("mapping") and decommitting
//! ("unmapping") page aligned pieces of it. This crate only does that
//! bookkeeping: it never decides when to collect, never looks at objects
//! and never hands out individual allocations.
//!
//! ```text
//!        Vm::create                Vm::map / Vm::unmap              Vm::destroy
//!  +-----------------------+   +---------------------------+   +--------------------+
//!  | reserve size + slack  |-->| commit / decommit pages   |-->| release everything |
//!  | align base to grain   |   | inside [base, limit)      |   | (mapped must be 0) |
//!  +-----------------------+   +---------------------------+   +--------------------+
//! ```
//!
//! Recoverable failures (no address space, no memory to commit) come back
//! as [`VmError`]; see [`VmError::kind`] to tell them apart. Misuse, such as
//! mapping misaligned or out of window ranges, panics.
//!
//! Talking to the OS goes through [`VirtualMemory`], implemented by
//! [`Platform`] on Unix (`mmap`) and Windows (`VirtualAlloc`). Events are
//! reported through the [`log`] facade.

pub mod align;
mod error;
mod params;
mod platform;
#[cfg(test)]
mod simulated;
mod vm;

pub use error::{ErrorKind, VmError, VmResult};
pub use params::{VmArg, VmParams};
pub use platform::{page_size, Platform, VirtualMemory};
pub use vm::{Signature, Vm};
