//! Error types for the mux layer.

use thiserror::Error;

/// Result type alias for mux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while multiplexing sessions over a transport.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O on a local or upstream connection failed
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// I/O on the shared transport failed
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Malformed or truncated frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A length field exceeded its cap
    #[error("frame too large: {field} is {len} bytes, max {max}")]
    FrameTooLarge {
        /// Which length field
        field: &'static str,
        /// Declared length
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// The dispatcher could not open the upstream connection
    #[error("dispatch to {destination} failed: {source}")]
    Dispatch {
        /// Requested destination
        destination: String,
        /// Underlying dial error
        #[source]
        source: std::io::Error,
    },

    /// The pool was closed and accepts no more sessions
    #[error("worker closed")]
    WorkerClosed,

    /// No worker accepted the session, even after opening a new one
    #[error("no worker accepted the session after retry")]
    PoolExhausted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new dispatch error
    pub fn dispatch(destination: impl ToString, source: std::io::Error) -> Self {
        Error::Dispatch {
            destination: destination.to_string(),
            source,
        }
    }

    /// Map an I/O error raised while reading a frame from the transport.
    ///
    /// An early EOF means the frame was cut short, which is a framing error
    /// rather than a plain transport failure.
    pub(crate) fn from_frame_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::InvalidFrame("truncated frame".into())
        } else {
            Error::Transport(err)
        }
    }

    /// Check if this error invalidates the whole transport connection.
    ///
    /// Fatal errors close the worker and every session it carries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::InvalidFrame(_)
                | Error::FrameTooLarge { .. }
        )
    }

    /// Check if this error is a framing violation
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Error::InvalidFrame(_) | Error::FrameTooLarge { .. })
    }
}
