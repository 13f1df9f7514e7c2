//! Parent-side supervisor
//!
//! The parent's view of the child:
//!
//! ```text
//! ATTACHING --initial stop--> ATTACHED --continue--> RUNNING
//! RUNNING --SIGSEGV--> page discovered --kill + reap--> TERMINATED
//! RUNNING --SIGABRT--> block complete  --kill + reap--> TERMINATED
//! RUNNING --SIGFPE---> register-sensitive error
//! RUNNING --other----> fatal error (register dump)
//! ```
//!
//! Whatever happens, the child is killed with SIGKILL and reaped. Detaching
//! instead would resume it into its pending signal, and a SIGSEGV escaping
//! to the host environment is expected noise here, not an event anyone
//! should see. Only after teardown is the status pipe read.

use std::os::fd::OwnedFd;

use log::trace;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::driver::AccessedAddrs;
use crate::error::{ProbeError, ProbeResult};
use crate::ipc::{self, StatusCode};

/// Supervise one traced child to completion and merge its outcome into
/// `accessed`
///
/// The ptrace outcome and the piped record combine as follows: a ptrace
/// error stands on its own (the pipe is not read); a ptrace success defers
/// to any error the child reported over the pipe.
pub(crate) fn supervise(
    child: Pid,
    pipe_read: OwnedFd,
    accessed: &mut AccessedAddrs,
) -> ProbeResult<()> {
    let outcome = observe_child(child, accessed);
    let teardown = tear_down(child);
    // An observation error wins over a teardown error; a teardown error
    // overrides an otherwise clean run.
    outcome?;
    teardown?;

    let record = ipc::read_record(pipe_read)?;
    match record.status_code() {
        Some(StatusCode::Ok) => {
            accessed.code_location = record.code_address();
            Ok(())
        }
        Some(StatusCode::InvalidArgument) => Err(ProbeError::invalid_argument(record.message())),
        Some(StatusCode::Internal) => Err(ProbeError::internal(record.message())),
        None => Err(ProbeError::internal(format!(
            "child reported unknown status code {}",
            record.raw_status_code()
        ))),
    }
}

/// Wait out the child's two stops and classify the second one
fn observe_child(child: Pid, accessed: &mut AccessedAddrs) -> ProbeResult<()> {
    let status = waitpid(child, None).map_err(|e| ProbeError::os("waitpid", e))?;
    if !matches!(status, WaitStatus::Stopped(_, _)) {
        return Err(ProbeError::internal(format!(
            "child terminated with an unexpected status: {status:?}"
        )));
    }

    // The child is stopped and we are attached.
    // TODO: with no ptrace options set, check whether the child could skip
    // its initial SIGSTOP and run straight from traceme, making this
    // stop/continue pair unnecessary.
    ptrace::cont(child, None).map_err(|e| ProbeError::os("ptrace cont", e))?;

    let status = waitpid(child, None).map_err(|e| ProbeError::os("waitpid", e))?;
    let signal = match status {
        WaitStatus::Stopped(_, signal) => signal,
        other => {
            return Err(ProbeError::internal(format!(
                "child terminated with an unexpected status: {other:?}"
            )))
        }
    };

    match signal {
        Signal::SIGSEGV => {
            // The block touched unmapped memory: record the faulting page.
            let info =
                ptrace::getsiginfo(child).map_err(|e| ProbeError::os("ptrace getsiginfo", e))?;
            let fault_address = unsafe { info.si_addr() } as u64;
            let block = align_down(fault_address, accessed.block_size as u64);
            if !accessed.accessed_blocks.contains(&block) {
                trace!("discovered accessed block {block:#x} (fault at {fault_address:#x})");
                accessed.accessed_blocks.push(block);
            }
            Ok(())
        }
        // The after-block stub fired: the block ran to the end without
        // touching unmapped memory.
        Signal::SIGABRT => Ok(()),
        // Potentially fixable with different register values.
        Signal::SIGFPE => Err(ProbeError::invalid_argument("floating point exception")),
        Signal::SIGBUS => {
            let info =
                ptrace::getsiginfo(child).map_err(|e| ProbeError::os("ptrace getsiginfo", e))?;
            let regs = ptrace::getregs(child).map_err(|e| ProbeError::os("ptrace getregs", e))?;
            Err(ProbeError::internal(format!(
                "child stopped with unexpected signal: {}, address {:#x}\n{}",
                signal.as_str(),
                unsafe { info.si_addr() } as u64,
                format_regs(&regs)
            )))
        }
        other => {
            // Capture the registers for ease of debugging.
            let regs = ptrace::getregs(child).map_err(|e| ProbeError::os("ptrace getregs", e))?;
            Err(ProbeError::internal(format!(
                "child stopped with unexpected signal: {}\n{}",
                other.as_str(),
                format_regs(&regs)
            )))
        }
    }
}

/// Kill the child and reap it so it cannot linger as a zombie
fn tear_down(child: Pid) -> ProbeResult<()> {
    kill(child, Signal::SIGKILL).map_err(|e| ProbeError::os("kill", e))?;
    waitpid(child, None).map_err(|e| ProbeError::os("waitpid", e))?;
    Ok(())
}

fn align_down(address: u64, alignment: u64) -> u64 {
    address - (address % alignment)
}

fn format_regs(regs: &libc::user_regs_struct) -> String {
    format!(
        "\trsp={:016x} rbp={:016x} rip={:016x}\n\
         \trax={:016x} rbx={:016x} rcx={:016x}\n\
         \trdx={:016x} rsi={:016x} rdi={:016x}\n\
         \t r8={:016x}  r9={:016x} r10={:016x}\n\
         \tr11={:016x} r12={:016x} r13={:016x}\n\
         \tr14={:016x} r15={:016x}",
        regs.rsp,
        regs.rbp,
        regs.rip,
        regs.rax,
        regs.rbx,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.r8,
        regs.r9,
        regs.r10,
        regs.r11,
        regs.r12,
        regs.r13,
        regs.r14,
        regs.r15,
    )
}
