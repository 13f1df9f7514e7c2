//! Dynamic memory-access probing for x86-64 basic blocks
//!
//! Given the raw bytes of a straight-line sequence of x86-64 instructions,
//! this crate discovers which page-aligned memory regions the code reads or
//! writes for a chosen initial register file. The block is executed for
//! real, inside a forked child traced by its parent:
//!
//! 1. The child maps the block — wrapped in a register-loading prelude and
//!    an aborting postlude — into a fresh executable page and jumps to it.
//! 2. Any access to unmapped memory stops the child with SIGSEGV. The parent
//!    reads the faulting address and records its page; the next attempt maps
//!    that page (seeded with a recognizable pattern) before running again.
//! 3. The loop converges once an attempt discovers nothing new.
//!
//! Faults that depend on the initial register values — division traps, or a
//! register-derived address that cannot be mapped — restart the loop with a
//! freshly randomized register file, a bounded number of times.
//!
//! # Example
//!
//! ```no_run
//! use blockprobe::find_accessed_addrs;
//!
//! // mov rax, [rax]
//! let accessed = find_accessed_addrs(&[0x48, 0x8b, 0x00])?;
//! for block in &accessed.accessed_blocks {
//!     println!("{block:#x}");
//! }
//! # Ok::<(), blockprobe::ProbeError>(())
//! ```
//!
//! # Platform support
//!
//! x86-64 Linux only: the implementation leans on ptrace, fork, and the SysV
//! calling convention of the generated prelude.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("blockprobe only supports x86-64 Linux");

mod child;
mod driver;
mod error;
mod harness;
mod ipc;
mod parent;
mod regs;
mod stubs;

pub use driver::{find_accessed_addrs, AccessedAddrs, Prober};
pub use error::{ProbeError, ProbeResult};
pub use regs::{RegisterPolicy, X64Regs, INITIAL_REG_VALUE};
pub use stubs::{after_block_code, before_block_code};
