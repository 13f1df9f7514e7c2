//! Register file handed to the probed block
//!
//! [`X64Regs`] is the ABI contract with the before-block stub: the stub reads
//! each field at its `#[repr(C)]` offset and loads it into the corresponding
//! register before the block runs. [`RegisterPolicy`] owns the choice of
//! values — a fixed fill for the first attempt and small-palette rerolls when
//! an attempt fails in a register-sensitive way.

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Value every register starts out with.
///
/// Low enough that small negative offsets from a register stay mappable, high
/// enough to leave a generous mappable slab below it.
pub const INITIAL_REG_VALUE: u64 = 0x15000;

/// Candidate values for rerolled registers: zero, a low address, a high
/// address. The palette is deliberately tiny so that arithmetic over several
/// registers still has a decent chance of landing on a mappable address.
const VALUE_PALETTE: [u64; 3] = [0, 0x15000, 0x100_0000];

/// The 16 general-purpose registers of x86-64
///
/// Field order fixes the offsets the before-block stub loads from; changing
/// it requires regenerating the stub bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X64Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl X64Regs {
    /// A register file with every register set to `value`
    pub fn filled(value: u64) -> Self {
        Self {
            rax: value,
            rbx: value,
            rcx: value,
            rdx: value,
            rsi: value,
            rdi: value,
            rsp: value,
            rbp: value,
            r8: value,
            r9: value,
            r10: value,
            r11: value,
            r12: value,
            r13: value,
            r14: value,
            r15: value,
        }
    }
}

impl Default for X64Regs {
    fn default() -> Self {
        Self::filled(INITIAL_REG_VALUE)
    }
}

/// Source of initial register files
///
/// Seedable so that probe runs can be reproduced exactly.
pub struct RegisterPolicy {
    rng: SmallRng,
}

impl RegisterPolicy {
    /// A policy seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }

    /// A policy with a fixed seed, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Overwrite every register with an independent draw from the palette
    pub fn randomize(&mut self, regs: &mut X64Regs) {
        let mut draw = || VALUE_PALETTE[self.rng.gen_range(0..VALUE_PALETTE.len())];
        regs.rax = draw();
        regs.rbx = draw();
        regs.rcx = draw();
        regs.rdx = draw();
        regs.rsi = draw();
        regs.rdi = draw();
        regs.rsp = draw();
        regs.rbp = draw();
        regs.r8 = draw();
        regs.r9 = draw();
        regs.r10 = draw();
        regs.r11 = draw();
        regs.r12 = draw();
        regs.r13 = draw();
        regs.r14 = draw();
        regs.r15 = draw();
    }
}

impl Default for RegisterPolicy {
    fn default() -> Self {
        Self::new()
    }
}
