//! Pipe-and-fork plumbing for one probe attempt

use nix::unistd::{fork, pipe, ForkResult};

use crate::child;
use crate::driver::AccessedAddrs;
use crate::error::{ProbeError, ProbeResult};
use crate::parent;

/// Fork once, run the block under trace, and fold the observation (a newly
/// discovered page, or the pinned code address) into `accessed`
pub(crate) fn fork_and_probe(basic_block: &[u8], accessed: &mut AccessedAddrs) -> ProbeResult<()> {
    let (pipe_read, pipe_write) = pipe().map_err(|e| ProbeError::os("pipe", e))?;

    // Safety: the child works only on its own copy of the address space and
    // never returns from `child::run`.
    match unsafe { fork() }.map_err(|e| ProbeError::os("fork", e))? {
        ForkResult::Child => {
            // The child only writes.
            drop(pipe_read);
            child::run(basic_block, pipe_write, accessed)
        }
        ForkResult::Parent { child } => {
            // The parent only reads.
            drop(pipe_write);
            parent::supervise(child, pipe_read, accessed)
        }
    }
}
