//! Error types for the MJPEG server library.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while configuring or running the server.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Startup**: [`Config`](Self::Config), [`Avi`](Self::Avi): bad
///   configuration text or an unusable AVI file.
/// - **Transport**: [`Io`](Self::Io): socket/file failures.
/// - **Media**: [`Media`](Self::Media): a frame that cannot be delivered.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
///
/// Per-request failures (unknown verb, missing file, bad credentials) are
/// not errors at this level; the dispatcher and scheduler return them as
/// explicit outcomes and answer the client directly.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration text could not be parsed.
    #[error("config error on line {line}: {message}")]
    Config { line: usize, message: String },

    /// An AVI file could not be indexed.
    #[error("cannot index AVI file {}: {kind}", path.display())]
    Avi { path: PathBuf, kind: AviErrorKind },

    /// A frame payload could not be produced.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of AVI indexing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AviErrorKind {
    /// File does not start with a `RIFF` chunk.
    NotRiff,
    /// RIFF form type is not `AVI `.
    NotAvi,
    /// No `idx1` chunk (or an empty one) was found.
    MissingIndex,
    /// The main header's frame interval does not yield a usable frame rate.
    InvalidFrameRate,
    /// File ended inside the RIFF header.
    Truncated,
}

impl fmt::Display for AviErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRiff => write!(f, "not a RIFF file"),
            Self::NotAvi => write!(f, "not an AVI file"),
            Self::MissingIndex => write!(f, "missing idx1 frame index"),
            Self::InvalidFrameRate => write!(f, "frame interval yields no usable frame rate"),
            Self::Truncated => write!(f, "truncated header"),
        }
    }
}

/// A frame that cannot be delivered to the client.
///
/// The scheduler answers with the video error page and then disconnects.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The frame chunk declares a zero-length payload.
    #[error("frame {frame} has an empty payload")]
    EmptyFrame { frame: u32 },

    /// The frame chunk declares more bytes than the configured maximum.
    #[error("frame {frame} payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { frame: u32, len: u64, max: u64 },

    /// The capture source failed to produce an image.
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Convenience alias for `Result<T, ServerError>`.
pub type Result<T> = std::result::Result<T, ServerError>;
