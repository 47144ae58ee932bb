/// Lightweight error enum - only 1 byte!
/// Carries the failure kind; the host-facing message is deliberately coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// The byte stream is not well-formed Lua 5.2 bytecode.
    MalformedBytecode,
    /// The header declares a Lua version or format this crate does not handle.
    UnsupportedVersion,
    /// The stream ended before the root prototype was complete.
    Truncated,
    /// Bytes were supplied after the root prototype was complete.
    SurplusInput,
    /// Prototype nesting exceeded the depth bound fixed at session start.
    RecursionTooDeep,
    /// The memory gauge refused an allocation.
    AllocationFailure,
    /// The bytecode decoded cleanly but the verifier could not prove it safe.
    ///
    /// No finer-grained reason is recorded: a rejection message that named
    /// the failing check would hand an attacker a probe for the verifier.
    VerificationRejected,
    /// A decode/verify invariant broke. Indicates a bug in this crate.
    Internal,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            VerifyError::MalformedBytecode
            | VerifyError::UnsupportedVersion
            | VerifyError::Truncated
            | VerifyError::SurplusInput
            | VerifyError::RecursionTooDeep => "unable to load bytecode",
            VerifyError::AllocationFailure => "insufficient memory",
            VerifyError::VerificationRejected => "verification failed",
            VerifyError::Internal => "unknown decoding error",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for VerifyError {}

pub type VerifyResult<T> = Result<T, VerifyError>;

/// Shorthand used throughout the verifier: a failed check rejects the chunk.
#[inline]
pub(crate) fn ensure(cond: bool) -> VerifyResult<()> {
    if cond {
        Ok(())
    } else {
        Err(VerifyError::VerificationRejected)
    }
}
