//! Dataplane error types.
//!
//! Configuration errors are fatal to the module being initialised; every
//! other variant is expected on the packet path and handled locally.

use thiserror::Error;

/// Errors returned by the flow table, transport and pipeline modules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataplaneError {
    /// Bad static configuration or a precondition violation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backing storage could not be allocated
    #[error("out of memory allocating {slots} flow table slots")]
    OutOfMemory { slots: u64 },

    /// Insert of a key that is already present
    #[error("flow already exists")]
    AlreadyExists,

    /// Lookup or delete miss
    #[error("flow not found")]
    NotFound,

    /// Table full, or pool/queue exhausted
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Control request the module does not handle
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

impl DataplaneError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DataplaneError::InvalidArgument(msg.into())
    }

    /// Whether the caller must abort initialisation
    pub fn is_fatal(&self) -> bool {
        matches!(self, DataplaneError::InvalidArgument(_) | DataplaneError::OutOfMemory { .. })
    }
}

/// Result type for dataplane operations.
pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Reasons a frame yields no flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("frame too short for headers")]
    Truncated,

    #[error("not an IPv4-over-Ethernet frame")]
    NotIpv4,

    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),
}
