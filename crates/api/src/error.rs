//! ElGA error types.

/// The core ElGA error type, used across all crates.
///
/// Protocol and invariant errors are fatal: they indicate a bug somewhere
/// in the cluster and unwind to the top of the owning loop. Argument errors
/// are caught by the binary entry point and produce a usage message.
#[derive(Debug, thiserror::Error)]
pub enum ElgaError {
    /// Invalid command line or configuration input.
    #[error("argument error: {0}")]
    Arg(String),

    /// A message was malformed or arrived in a state that forbids it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A data invariant did not hold.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An underlying IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ElgaError {
    /// Construct an argument error.
    pub fn arg(ctx: impl std::fmt::Display) -> Self {
        Self::Arg(ctx.to_string())
    }

    /// Construct a protocol error.
    pub fn protocol(ctx: impl std::fmt::Display) -> Self {
        Self::Protocol(ctx.to_string())
    }

    /// Construct an invariant violation.
    pub fn invariant(ctx: impl std::fmt::Display) -> Self {
        Self::Invariant(ctx.to_string())
    }

    /// Construct an "other" error.
    pub fn other(ctx: impl std::fmt::Display) -> Self {
        Self::Other(ctx.to_string())
    }
}

/// The core ElGA result type.
pub type ElgaResult<T> = Result<T, ElgaError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "protocol error: bad tag",
            ElgaError::protocol("bad tag").to_string().as_str(),
        );
        assert_eq!(
            "argument error: no ip",
            ElgaError::arg("no ip").to_string().as_str(),
        );
    }

    #[test]
    fn ensure_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(ElgaError::other("bla"));
    }
}
