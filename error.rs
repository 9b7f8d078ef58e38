use thiserror::Error;

/// Generic I/O code used when an OS error carries no raw code.
pub const GENERIC_IO_CODE: i32 = libc::EIO;

/// Failures surfaced by sources, sinks, filters and the pipe engine.
///
/// Errors are `Clone` so a stream can remember its first asynchronous
/// failure and replay it on every later `close`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream was closed, or already delivered its end-of-stream signal
    #[error("stream closed")]
    Closed,

    /// The operating system reported an error for the underlying descriptor
    #[error("os error {code}: {}", std::io::Error::from_raw_os_error(*code))]
    Os { code: i32 },

    /// The driving task was cancelled before the operation completed
    #[error("operation cancelled")]
    Cancelled,

    /// A sealed box failed tag or positional metadata verification
    #[error("authentication failed")]
    Authentication,

    /// The compression codec rejected its input or failed to flush
    #[error("codec error: {0}")]
    Codec(String),

    /// Key material of the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKey { expected: usize, actual: usize },
}

impl StreamError {
    pub fn os(code: i32) -> Self {
        Self::Os { code }
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Raw OS code for `Os` errors.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Os { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Os {
            code: err.raw_os_error().unwrap_or(GENERIC_IO_CODE),
        }
    }
}
