//! Convergence driver
//!
//! One traced execution exposes at most the first unmapped access: the child
//! stops on the first segfault. The driver therefore loops — map everything
//! discovered so far, run again — until an attempt adds nothing new, at
//! which point the set is a fixed point for the current register file.
//!
//! Register-sensitive failures (a floating-point trap, or a discovered page
//! that stopped being mappable) invalidate the accumulated set, since its
//! addresses may have been reached through register arithmetic. Those
//! attempts restart with freshly randomized registers, up to a bounded
//! number of times.

use log::debug;

use crate::error::ProbeResult;
use crate::harness;
use crate::regs::{RegisterPolicy, X64Regs};

/// Attempts restarted with fresh registers before giving up
const MAX_REGISTER_RETRIES: u32 = 100;

/// The pages a basic block touches, with the configuration that produced
/// them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessedAddrs {
    /// Preferred virtual address for the code page. Zero lets the kernel
    /// choose; pinned to the first successful placement so that every later
    /// attempt reuses the same address.
    pub code_location: u64,
    /// Host page size. Every element of `accessed_blocks` is a multiple.
    pub block_size: usize,
    /// Page-aligned fault addresses in order of first discovery.
    pub accessed_blocks: Vec<u64>,
    /// Register file handed to the before-block stub on the next attempt.
    pub initial_regs: X64Regs,
}

impl AccessedAddrs {
    pub fn new() -> Self {
        Self {
            code_location: 0,
            block_size: page_size(),
            accessed_blocks: Vec::new(),
            initial_regs: X64Regs::default(),
        }
    }
}

impl Default for AccessedAddrs {
    fn default() -> Self {
        Self::new()
    }
}

fn page_size() -> usize {
    // _SC_PAGESIZE does not fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Drives repeated traced executions of one basic block until the set of
/// faulting pages stops growing
///
/// # Example
///
/// ```no_run
/// use blockprobe::Prober;
///
/// // mov rax, [rax]
/// let accessed = Prober::with_seed(7).run(&[0x48, 0x8b, 0x00])?;
/// assert_eq!(accessed.accessed_blocks, vec![0x15000]);
/// # Ok::<(), blockprobe::ProbeError>(())
/// ```
pub struct Prober {
    accessed: AccessedAddrs,
    policy: RegisterPolicy,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            accessed: AccessedAddrs::new(),
            policy: RegisterPolicy::new(),
        }
    }

    /// Fix the register-randomization seed, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            accessed: AccessedAddrs::new(),
            policy: RegisterPolicy::with_seed(seed),
        }
    }

    /// Resume from a previously discovered state, e.g. to re-verify it
    ///
    /// Seeding with a prior result's state converges in a single attempt
    /// when the block behaves the same.
    pub fn with_state(accessed: AccessedAddrs) -> Self {
        Self {
            accessed,
            policy: RegisterPolicy::new(),
        }
    }

    /// Probe `basic_block` to a fixed point
    pub fn run(mut self, basic_block: &[u8]) -> ProbeResult<AccessedAddrs> {
        let mut attempts = 0u32;
        loop {
            let blocks_before = self.accessed.accessed_blocks.len();
            match harness::fork_and_probe(basic_block, &mut self.accessed) {
                Ok(()) => {}
                Err(err) if err.is_register_sensitive() => {
                    if attempts > MAX_REGISTER_RETRIES {
                        return Err(err);
                    }
                    debug!("register-sensitive failure, rerolling registers: {err}");
                    // The accumulated pages may have been reached through
                    // register-derived addresses; they are stale now.
                    self.accessed.accessed_blocks.clear();
                    self.policy.randomize(&mut self.accessed.initial_regs);
                }
                Err(err) => return Err(err),
            }
            attempts += 1;

            if self.accessed.accessed_blocks.len() == blocks_before {
                break;
            }
        }
        debug!(
            "converged after {attempts} attempt(s): {} accessed block(s) at code location {:#x}",
            self.accessed.accessed_blocks.len(),
            self.accessed.code_location,
        );
        Ok(self.accessed)
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

/// Discover the page-aligned memory regions `basic_block` reads or writes
/// when started from the default register file
///
/// Returns the converged [`AccessedAddrs`], or an error once probing is
/// known to be pointless: [`ProbeError::InvalidArgument`] when no register
/// assignment dodged a register-sensitive fault within the retry budget,
/// [`ProbeError::Internal`] or [`ProbeError::Os`] otherwise.
///
/// Two caveats are inherent to fault-driven discovery: accesses to memory
/// the process already maps (stack, loader data) never fault and so never
/// appear in the result, and a block that neither faults nor terminates
/// hangs the call.
///
/// [`ProbeError::InvalidArgument`]: crate::ProbeError::InvalidArgument
/// [`ProbeError::Internal`]: crate::ProbeError::Internal
/// [`ProbeError::Os`]: crate::ProbeError::Os
pub fn find_accessed_addrs(basic_block: &[u8]) -> ProbeResult<AccessedAddrs> {
    Prober::new().run(basic_block)
}
