//! Child-side executor
//!
//! Runs in the forked child and never returns. The sequence is:
//!
//! 1. Request tracing and self-stop, so the parent is attached before
//!    anything observable happens.
//! 2. Unmap the sentinel window. Freshly seeded data pages read back
//!    `0x0000_0008_0000_0008` in aligned 8-byte loads, and that value must
//!    stay unmapped so dereferencing it faults visibly.
//! 3. Re-map every previously discovered page at its exact address and seed
//!    it. A page that cannot be mapped at all is an internal failure; one
//!    that lands elsewhere is register-sensitive (the address came from
//!    register arithmetic) and reported with the distinct code.
//! 4. Map the code page, publish its actual address over the pipe, install
//!    `before || block || after`, and jump in.
//!
//! Every error path ends in `abort()`: the parent interprets the SIGABRT
//! stop and then reads whatever record made it down the pipe.

use std::arch::asm;
use std::os::fd::OwnedFd;

use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};

use crate::driver::AccessedAddrs;
use crate::ipc::{self, StatusCode, StatusRecord};
use crate::regs::X64Regs;
use crate::stubs;

/// Fixed low-range window kept unmapped so that loads through the seeded
/// page pattern produce observable segfaults.
const SENTINEL_ADDRESS: u64 = 0x8_0000_0000;
const SENTINEL_LENGTH: usize = 0x10000;

/// Preferred code page address: the middle of a normally-empty range, so
/// rip-relative addressing in the block tends to hit unmapped memory. If the
/// kernel places the mapping elsewhere, the actual address is accepted and
/// reported to the parent.
const DEFAULT_CODE_LOCATION: u64 = 0x2b00_0000_0000;

pub(crate) fn run(basic_block: &[u8], pipe_write: OwnedFd, accessed: &AccessedAddrs) -> ! {
    // Attach before doing anything the parent might want to observe. Neither
    // call has a useful failure mode from the child's side.
    let _ = ptrace::traceme();
    let _ = raise(Signal::SIGSTOP);

    // Best-effort: the block may never chase the seeded value, so a failed
    // unmap is not worth aborting over.
    unsafe {
        libc::munmap(SENTINEL_ADDRESS as *mut libc::c_void, SENTINEL_LENGTH);
    }

    if let Err((code, reason)) = map_discovered_blocks(accessed) {
        abort_with(pipe_write, code, &reason);
    }

    let before = stubs::before_block_code();
    let after = stubs::after_block_code();
    let total_size = before.len() + basic_block.len() + after.len();

    let wanted = if accessed.code_location == 0 {
        DEFAULT_CODE_LOCATION
    } else {
        accessed.code_location
    };
    let code = unsafe {
        libc::mmap(
            wanted as *mut libc::c_void,
            total_size,
            libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if code == libc::MAP_FAILED {
        // No record for this one: the parent observes death by a
        // non-segfault signal and the empty pipe.
        std::process::abort();
    }

    // Publish before touching the mapping. The parent reads the record only
    // once the child is dead, so ordering on this side is all that matters.
    if ipc::write_record(pipe_write, &StatusRecord::ok(code as u64)).is_err() {
        std::process::abort();
    }

    // Install before || block || after. The copy is pinned to `rep movsb`;
    // an open-coded loop may be rewritten into a memcpy call, and the libc
    // mapping backing it is not guaranteed usable after the memory surgery
    // above.
    unsafe {
        let dst = code as *mut u8;
        rep_movsb(dst, before.as_ptr(), before.len());
        rep_movsb(dst.add(before.len()), basic_block.as_ptr(), basic_block.len());
        rep_movsb(
            dst.add(before.len() + basic_block.len()),
            after.as_ptr(),
            after.len(),
        );
    }

    // Safety: the mapping starts with the prelude, which takes the register
    // file pointer as its single SysV argument; the postlude terminates the
    // process rather than returning.
    let entry: extern "C" fn(*const X64Regs) = unsafe { std::mem::transmute(code) };
    entry(&accessed.initial_regs);

    // The postlude aborts, so control cannot get here.
    std::process::abort()
}

/// Map and seed every previously discovered page
fn map_discovered_blocks(accessed: &AccessedAddrs) -> Result<(), (StatusCode, String)> {
    for &block_address in &accessed.accessed_blocks {
        let wanted = block_address as *mut libc::c_void;
        let mapped = unsafe {
            libc::mmap(
                wanted,
                accessed.block_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err((
                StatusCode::Internal,
                format!("mapping previously discovered address {block_address:#x} failed"),
            ));
        }
        if mapped != wanted {
            // The address came from register arithmetic and may simply not
            // be mappable; the distinct code tells the driver to retry with
            // different register seeds.
            return Err((
                StatusCode::InvalidArgument,
                format!(
                    "tried to map previously discovered address {block_address:#x}, \
                     but mmap placed it elsewhere"
                ),
            ));
        }

        // Seed every fourth byte with 0x08: aligned 8-byte loads then read
        // 0x0000_0008_0000_0008 (inside the sentinel window, cleanly
        // mappable) and aligned 4-byte loads read 0x8 (non-zero, safe as a
        // divisor).
        let page = mapped as *mut u8;
        for i in (0..accessed.block_size).step_by(4) {
            unsafe { page.add(i).write(8) };
        }
    }
    Ok(())
}

/// Report an error over the pipe, then die by SIGABRT
fn abort_with(pipe_write: OwnedFd, code: StatusCode, message: &str) -> ! {
    let _ = ipc::write_record(pipe_write, &StatusRecord::error(code, message));
    std::process::abort()
}

/// Byte copy pinned to the x86 string-move instruction
///
/// # Safety
///
/// `dst` and `src` must be valid for `count` bytes and must not overlap.
#[inline(always)]
unsafe fn rep_movsb(dst: *mut u8, src: *const u8, count: usize) {
    asm!(
        "rep movsb",
        inout("rdi") dst => _,
        inout("rsi") src => _,
        inout("rcx") count => _,
        options(nostack, preserves_flags),
    );
}
