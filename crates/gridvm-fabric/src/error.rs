//! Error types for the messaging fabric

use core::fmt;
use std::io;

use crate::address::Address;

/// Result type for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors that can occur in the fabric and VM layer
#[derive(Debug)]
pub enum FabricError {
    /// Socket / file descriptor operation failed
    Io(io::Error),

    /// A wire frame failed to encode or decode
    Codec(serde_json::Error),

    /// A node with this address is already registered
    AddressInUse(Address),

    /// The edge arena ran out of slots
    EdgesExhausted,

    /// Signal handler installation failed
    SignalSetup(i32),

    /// The VM was constructed with an unusable configuration
    BadConfig(&'static str),
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::Io(e) => write!(f, "i/o error: {}", e),
            FabricError::Codec(e) => write!(f, "wire codec error: {}", e),
            FabricError::AddressInUse(addr) => {
                write!(f, "address {} already registered", addr)
            }
            FabricError::EdgesExhausted => write!(f, "edge arena exhausted"),
            FabricError::SignalSetup(errno) => {
                write!(f, "signal handler setup failed (errno {})", errno)
            }
            FabricError::BadConfig(what) => write!(f, "bad configuration: {}", what),
        }
    }
}

impl std::error::Error for FabricError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FabricError::Io(e) => Some(e),
            FabricError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FabricError {
    fn from(e: io::Error) -> Self {
        FabricError::Io(e)
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::Codec(e)
    }
}
