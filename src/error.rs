use nix::errno::Errno;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum GadgetError {
    /// The ioctl syscall failed: the kernel rejected the command or the UDC is gone
    #[error("Driver error [{op}]: {errno}")]
    Driver { op: &'static str, errno: Errno },

    /// Payload does not fit the 14-bit size field of the request code
    #[error("Invalid ioctl size: {0} bytes exceeds the 14-bit size field")]
    InvalidSize(usize),

    /// Arguments do not match the command's payload layout
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Gadget is not configured")]
    NotConfigured,

    #[error("Unknown endpoint: {0:#04x}")]
    UnknownEndpoint(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GadgetError {
    /// Build a driver error for the named command
    pub fn driver(op: &'static str, errno: Errno) -> Self {
        GadgetError::Driver { op, errno }
    }

    /// Whether the driver reported that the operation would block
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            GadgetError::Driver {
                errno: Errno::EAGAIN,
                ..
            }
        )
    }

    /// Codec errors come from coding mistakes, not runtime conditions.
    ///
    /// Callers driving the dispatch loop may retry or reset on anything else.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GadgetError::InvalidSize(_) | GadgetError::Codec(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GadgetError>;
