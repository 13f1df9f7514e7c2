//! Machine-code stubs wrapped around the probed block
//!
//! The child installs `before || block || after` in one executable mapping.
//! The before-block stub receives a pointer to an [`X64Regs`] in `rdi` (the
//! only SysV argument) and loads every field into its register, `rdi` itself
//! last since it holds the struct pointer. The after-block stub terminates
//! the child with a deliberate SIGABRT so that a block which runs to the end
//! stops the tracer in a recognizable way instead of running off into
//! unmapped memory.
//!
//! Both stubs are hand-assembled. The after-block raises the signal through
//! raw `getpid`/`kill` syscalls: by the time it runs, `rsp` holds whatever
//! the register file said, so it must not touch the stack, and the libc
//! mappings cannot be assumed usable either.
//!
//! [`X64Regs`]: crate::regs::X64Regs

/// `mov r, [rdi + offset_of(field)]` for each register, `rdi` last.
///
/// Every instruction is REX + 8B /r with a disp8, four bytes each; the test
/// below pins each displacement byte to the `X64Regs` field offset.
const BEFORE_BLOCK: [u8; 64] = [
    0x48, 0x8b, 0x47, 0x00, // mov rax, [rdi + 0x00]
    0x48, 0x8b, 0x5f, 0x08, // mov rbx, [rdi + 0x08]
    0x48, 0x8b, 0x4f, 0x10, // mov rcx, [rdi + 0x10]
    0x48, 0x8b, 0x57, 0x18, // mov rdx, [rdi + 0x18]
    0x48, 0x8b, 0x77, 0x20, // mov rsi, [rdi + 0x20]
    0x48, 0x8b, 0x67, 0x30, // mov rsp, [rdi + 0x30]
    0x48, 0x8b, 0x6f, 0x38, // mov rbp, [rdi + 0x38]
    0x4c, 0x8b, 0x47, 0x40, // mov r8,  [rdi + 0x40]
    0x4c, 0x8b, 0x4f, 0x48, // mov r9,  [rdi + 0x48]
    0x4c, 0x8b, 0x57, 0x50, // mov r10, [rdi + 0x50]
    0x4c, 0x8b, 0x5f, 0x58, // mov r11, [rdi + 0x58]
    0x4c, 0x8b, 0x67, 0x60, // mov r12, [rdi + 0x60]
    0x4c, 0x8b, 0x6f, 0x68, // mov r13, [rdi + 0x68]
    0x4c, 0x8b, 0x77, 0x70, // mov r14, [rdi + 0x70]
    0x4c, 0x8b, 0x7f, 0x78, // mov r15, [rdi + 0x78]
    0x48, 0x8b, 0x7f, 0x28, // mov rdi, [rdi + 0x28]
];

/// `kill(getpid(), SIGABRT)` through raw syscalls, then a `ud2` backstop
/// in case the kill somehow returns.
const AFTER_BLOCK: [u8; 23] = [
    0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39 (getpid)
    0x0f, 0x05, //                   syscall
    0x89, 0xc7, //                   mov edi, eax
    0xb8, 0x3e, 0x00, 0x00, 0x00, // mov eax, 62 (kill)
    0xbe, 0x06, 0x00, 0x00, 0x00, // mov esi, 6  (SIGABRT)
    0x0f, 0x05, //                   syscall
    0x0f, 0x0b, //                   ud2
];

/// Code that loads an [`X64Regs`](crate::regs::X64Regs) from the pointer in
/// `rdi` into the CPU
pub fn before_block_code() -> &'static [u8] {
    &BEFORE_BLOCK
}

/// Code that terminates the process with SIGABRT
pub fn after_block_code() -> &'static [u8] {
    &AFTER_BLOCK
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::{AFTER_BLOCK, BEFORE_BLOCK};
    use crate::regs::X64Regs;

    #[test]
    fn test_before_block_displacements_match_field_offsets() {
        // One load per register, in stub order.
        let offsets = [
            offset_of!(X64Regs, rax),
            offset_of!(X64Regs, rbx),
            offset_of!(X64Regs, rcx),
            offset_of!(X64Regs, rdx),
            offset_of!(X64Regs, rsi),
            offset_of!(X64Regs, rsp),
            offset_of!(X64Regs, rbp),
            offset_of!(X64Regs, r8),
            offset_of!(X64Regs, r9),
            offset_of!(X64Regs, r10),
            offset_of!(X64Regs, r11),
            offset_of!(X64Regs, r12),
            offset_of!(X64Regs, r13),
            offset_of!(X64Regs, r14),
            offset_of!(X64Regs, r15),
            offset_of!(X64Regs, rdi),
        ];
        assert_eq!(BEFORE_BLOCK.len(), offsets.len() * 4);
        for (i, offset) in offsets.iter().enumerate() {
            // REX, 0x8B, ModRM, disp8
            assert_eq!(BEFORE_BLOCK[i * 4 + 1], 0x8b, "instruction {i}");
            assert_eq!(BEFORE_BLOCK[i * 4 + 3] as usize, *offset, "instruction {i}");
        }
    }

    #[test]
    fn test_before_block_loads_rdi_last() {
        // Clobbering rdi earlier would corrupt the struct pointer.
        let last = &BEFORE_BLOCK[BEFORE_BLOCK.len() - 4..];
        assert_eq!(last, &[0x48, 0x8b, 0x7f, offset_of!(X64Regs, rdi) as u8]);
    }

    #[test]
    fn test_after_block_raises_sigabrt() {
        // mov esi, imm32 at byte 14 carries the signal number.
        assert_eq!(AFTER_BLOCK[14], 0xbe);
        assert_eq!(AFTER_BLOCK[15] as i32, libc::SIGABRT);
        // ud2 backstop at the tail.
        assert_eq!(&AFTER_BLOCK[AFTER_BLOCK.len() - 2..], &[0x0f, 0x0b]);
    }
}
