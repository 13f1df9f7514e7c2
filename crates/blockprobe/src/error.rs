//! Error types for the prober

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for prober operations
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors surfaced by a probe run
///
/// Everything that can go wrong collapses into three kinds:
///
/// - [`ProbeError::Os`]: a host primitive (pipe, fork, waitpid, ptrace, pipe
///   I/O) failed outright.
/// - [`ProbeError::InvalidArgument`]: a register-sensitive failure — a
///   floating-point trap, or a register-derived address the child could not
///   map. The driver retries these with freshly randomized registers and only
///   surfaces them once the retry budget is spent.
/// - [`ProbeError::Internal`]: the child died in a way probing cannot
///   interpret (unexpected signal, truncated status record, failed remap of a
///   previously discovered page).
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("{call} failed: {errno}")]
    Os { call: &'static str, errno: Errno },

    #[error("{reason}")]
    InvalidArgument { reason: String },

    #[error("{reason}")]
    Internal { reason: String },
}

impl ProbeError {
    pub(crate) fn os(call: &'static str, errno: Errno) -> Self {
        Self::Os { call, errno }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// True when retrying with different initial register values may avoid
    /// the failure.
    pub fn is_register_sensitive(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::ProbeError;

    #[test]
    fn test_os_error_names_the_call() {
        let err = ProbeError::os("fork", Errno::EAGAIN);
        let message = err.to_string();
        assert!(message.starts_with("fork failed"), "got: {message}");
    }

    #[test]
    fn test_only_invalid_argument_is_register_sensitive() {
        assert!(ProbeError::invalid_argument("floating point exception").is_register_sensitive());
        assert!(!ProbeError::internal("truncated record").is_register_sensitive());
        assert!(!ProbeError::os("pipe", Errno::EMFILE).is_register_sensitive());
    }
}
