//! End-to-end probing tests
//!
//! Each test hands a hand-assembled x86-64 block to the prober and checks
//! the converged page set. The blocks run for real in traced children, so
//! everything here is serialized: concurrent tests would race each other's
//! fork/reap cycles (and the zombie check below relies on being the only
//! test with children).

use std::collections::HashSet;

use blockprobe::{find_accessed_addrs, ProbeError, Prober};
use serial_test::serial;

/// `nop`
const NOP: &[u8] = &[0x90];
/// `mov rax, [rax]`
const LOAD_RAX: &[u8] = &[0x48, 0x8b, 0x00];
/// `mov rax, [rax]; mov rbx, [rbx + 0x2000]`
const TWO_LOADS: &[u8] = &[
    0x48, 0x8b, 0x00, // mov rax, [rax]
    0x48, 0x8b, 0x9b, 0x00, 0x20, 0x00, 0x00, // mov rbx, [rbx + 0x2000]
];
/// `mov rax, [rax]; mov rax, [rax]` — the second load dereferences the
/// seeded pattern value
const CHASE_SEEDED_POINTER: &[u8] = &[0x48, 0x8b, 0x00, 0x48, 0x8b, 0x00];
/// `mov rax, [0]` — absolute load from an address mmap will never grant
const LOAD_NULL: &[u8] = &[0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00];
/// `div rcx`
const DIV_RCX: &[u8] = &[0x48, 0xf7, 0xf1];
/// `ud2`
const UD2: &[u8] = &[0x0f, 0x0b];

#[test]
#[serial]
fn empty_block_accesses_nothing() {
    let accessed = find_accessed_addrs(&[]).expect("probe failed");
    assert!(accessed.accessed_blocks.is_empty());
    assert_ne!(accessed.code_location, 0, "code location should be pinned");
}

#[test]
#[serial]
fn nop_accesses_nothing() {
    let accessed = find_accessed_addrs(NOP).expect("probe failed");
    assert!(accessed.accessed_blocks.is_empty());
}

#[test]
#[serial]
fn single_load_discovers_one_page() {
    let accessed = find_accessed_addrs(LOAD_RAX).expect("probe failed");
    assert_eq!(accessed.accessed_blocks, vec![0x15000]);
}

#[test]
#[serial]
fn two_loads_discover_two_pages_in_fault_order() {
    let accessed = find_accessed_addrs(TWO_LOADS).expect("probe failed");
    assert_eq!(accessed.accessed_blocks, vec![0x15000, 0x17000]);
}

#[test]
#[serial]
fn chasing_the_seeded_pointer_discovers_the_sentinel_page() {
    // Iteration one faults on [rax] at 0x15000. Iteration two reads the
    // seeded 0x0000_0008_0000_0008 from the freshly mapped page and faults
    // dereferencing it, landing in the pre-unmapped sentinel window.
    let accessed = find_accessed_addrs(CHASE_SEEDED_POINTER).expect("probe failed");
    assert_eq!(accessed.accessed_blocks, vec![0x15000, 0x8_0000_0000]);
}

#[test]
#[serial]
fn unmappable_address_exhausts_register_retries() {
    // The fault address is page zero, which mmap never places a mapping at,
    // so every remap attempt is register-sensitive and the retry budget
    // eventually runs out.
    let err = find_accessed_addrs(LOAD_NULL).expect_err("probe should give up");
    assert!(
        matches!(err, ProbeError::InvalidArgument { .. }),
        "expected InvalidArgument, got {err:?}"
    );
}

#[test]
#[serial]
fn division_trap_rerolls_registers_to_success() {
    // rdx:rax / rcx overflows whenever rdx >= rcx, so the uniform initial
    // file (rdx == rcx) traps with SIGFPE; rerolled registers converge to a
    // clean run with no memory accesses.
    let accessed = find_accessed_addrs(DIV_RCX).expect("probe failed");
    assert!(accessed.accessed_blocks.is_empty());
}

#[test]
#[serial]
fn illegal_instruction_reports_a_register_dump() {
    let err = find_accessed_addrs(UD2).expect_err("probe should fail");
    match err {
        ProbeError::Internal { reason } => {
            assert!(reason.contains("SIGILL"), "missing signal name: {reason}");
            assert!(reason.contains("rip="), "missing register dump: {reason}");
        }
        other => panic!("expected Internal, got {other:?}"),
    }
}

#[test]
#[serial]
fn discovered_blocks_are_aligned_and_unique() {
    for block in [NOP, LOAD_RAX, TWO_LOADS, CHASE_SEEDED_POINTER] {
        let accessed = find_accessed_addrs(block).expect("probe failed");
        for &address in &accessed.accessed_blocks {
            assert_eq!(address % accessed.block_size as u64, 0, "{address:#x}");
        }
        let unique: HashSet<u64> = accessed.accessed_blocks.iter().copied().collect();
        assert_eq!(unique.len(), accessed.accessed_blocks.len());
    }
}

#[test]
#[serial]
fn probing_is_reproducible_with_a_seed() {
    let first = Prober::with_seed(7).run(TWO_LOADS).expect("probe failed");
    let second = Prober::with_seed(7).run(TWO_LOADS).expect("probe failed");
    assert_eq!(first.accessed_blocks, second.accessed_blocks);
}

#[test]
#[serial]
fn reapplying_a_result_converges_without_changing_it() {
    let first = find_accessed_addrs(TWO_LOADS).expect("probe failed");
    let again = Prober::with_state(first.clone())
        .run(TWO_LOADS)
        .expect("reapply failed");
    assert_eq!(again.accessed_blocks, first.accessed_blocks);
    assert_eq!(again.code_location, first.code_location);
}

#[test]
#[serial]
fn code_location_stays_pinned_across_attempts() {
    // TWO_LOADS takes three attempts; the address published by the first
    // child must survive into the final result.
    let accessed = find_accessed_addrs(TWO_LOADS).expect("probe failed");
    assert_ne!(accessed.code_location, 0);
    assert_eq!(accessed.code_location % accessed.block_size as u64, 0);
}

#[test]
#[serial]
fn no_zombie_children_remain() {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;

    let _ = find_accessed_addrs(TWO_LOADS).expect("probe failed");
    let _ = find_accessed_addrs(UD2).expect_err("probe should fail");

    // Every probe child must have been reaped, on success and failure paths
    // alike; with no children left the wait reports ECHILD.
    let err = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG))
        .expect_err("a probe child was left unreaped");
    assert_eq!(err, Errno::ECHILD);
}
