//! Fixed-layout status record piped from child to parent
//!
//! The protocol is deliberately frameless: per attempt the child writes
//! either nothing (it died before reaching the pipe) or exactly one
//! [`StatusRecord`] as a single byte blob. Both endpoints are the same binary
//! in a parent/child pair, so the in-memory layout agrees on both sides and
//! no serialization is needed. The parent reads the record only after the
//! child is dead, which means a complete record or EOF — never a torn
//! interleaving.
//!
//! When the status is not [`StatusCode::Ok`], only the code and the message
//! are meaningful.

use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;

use crate::error::{ProbeError, ProbeResult};

/// Status carried in a [`StatusRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    InvalidArgument = 1,
    Internal = 2,
}

/// Message buffer size, including the NUL terminator
pub const STATUS_MESSAGE_CAPACITY: usize = 1024;

const RECORD_SIZE: usize = mem::size_of::<StatusRecord>();

/// The record exchanged over the pipe
///
/// `_pad` makes the alignment padding explicit so the whole struct is
/// defined bytes and can be written out as one blob.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct StatusRecord {
    status_code: u32,
    status_message: [u8; STATUS_MESSAGE_CAPACITY],
    _pad: [u8; 4],
    code_address: u64,
}

impl StatusRecord {
    fn zeroed() -> Self {
        Self {
            status_code: 0,
            status_message: [0; STATUS_MESSAGE_CAPACITY],
            _pad: [0; 4],
            code_address: 0,
        }
    }

    /// An ok record carrying the address the code page actually landed at
    pub fn ok(code_address: u64) -> Self {
        let mut record = Self::zeroed();
        record.status_code = StatusCode::Ok as u32;
        record.code_address = code_address;
        record
    }

    /// An error record; the message is truncated to fit with a trailing NUL
    pub fn error(code: StatusCode, message: &str) -> Self {
        let mut record = Self::zeroed();
        record.status_code = code as u32;
        let len = message.len().min(STATUS_MESSAGE_CAPACITY - 1);
        record.status_message[..len].copy_from_slice(&message.as_bytes()[..len]);
        record
    }

    /// The status code, or `None` for a value outside the protocol
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.status_code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::InvalidArgument),
            2 => Some(StatusCode::Internal),
            _ => None,
        }
    }

    pub fn raw_status_code(&self) -> u32 {
        self.status_code
    }

    /// The message up to its NUL terminator
    pub fn message(&self) -> String {
        let len = self
            .status_message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STATUS_MESSAGE_CAPACITY);
        String::from_utf8_lossy(&self.status_message[..len]).into_owned()
    }

    pub fn code_address(&self) -> u64 {
        self.code_address
    }

    fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        // Safety: repr(C) with explicit padding — every byte is initialized.
        unsafe { &*(self as *const Self as *const [u8; RECORD_SIZE]) }
    }
}

fn retryable(errno: Errno) -> bool {
    // EWOULDBLOCK aliases EAGAIN on Linux.
    matches!(errno, Errno::EINTR | Errno::EAGAIN)
}

/// Write the whole record, then close the descriptor
///
/// Short writes and retryable errors are looped; a permanent failure returns
/// an errno-tagged error (leaving the descriptor to close on drop).
pub fn write_record(fd: OwnedFd, record: &StatusRecord) -> ProbeResult<()> {
    let bytes = record.as_bytes();
    let mut offset = 0;
    while offset < bytes.len() {
        let written = unsafe {
            libc::write(
                fd.as_raw_fd(),
                bytes[offset..].as_ptr() as *const libc::c_void,
                bytes.len() - offset,
            )
        };
        if written < 0 {
            let errno = Errno::last();
            if retryable(errno) {
                continue;
            }
            return Err(ProbeError::os("write to status pipe", errno));
        }
        offset += written as usize;
    }
    drop(fd);
    Ok(())
}

/// Read a whole record, then close the descriptor
///
/// EOF before a complete record means the child died without reporting; that
/// is an internal error distinct from a record that itself carries an error.
pub fn read_record(fd: OwnedFd) -> ProbeResult<StatusRecord> {
    let mut bytes = [0u8; RECORD_SIZE];
    let mut offset = 0;
    while offset < bytes.len() {
        let read = unsafe {
            libc::read(
                fd.as_raw_fd(),
                bytes[offset..].as_mut_ptr() as *mut libc::c_void,
                bytes.len() - offset,
            )
        };
        if read < 0 {
            let errno = Errno::last();
            if retryable(errno) {
                continue;
            }
            return Err(ProbeError::os("read from status pipe", errno));
        }
        if read == 0 {
            break;
        }
        offset += read as usize;
    }

    if offset != bytes.len() {
        return Err(ProbeError::internal(format!(
            "read less than expected from status pipe (expected {RECORD_SIZE} B, got {offset} B)"
        )));
    }
    drop(fd);

    // Safety: bytes holds a complete record written by this same binary.
    Ok(unsafe { std::ptr::read(bytes.as_ptr() as *const StatusRecord) })
}
