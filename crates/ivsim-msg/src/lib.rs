//! ---
//! ivsim_section: "02-messaging-transport"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Message envelopes and transport contracts."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Message envelopes and the transport/shadow contracts the simulation engine
//! drives. Concrete backends live in `ivsim-net`; the loopback transport here
//! backs tests and offline runs.

pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures raised by transports, shadows and connection providers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The backend does not offer the requested capability.
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
    /// The backend refused or failed an operation.
    #[error("{operation} failed: {reason}")]
    Rejected {
        /// Operation that failed (`send`, `complete`, `report`, ...).
        operation: &'static str,
        /// Backend supplied reason.
        reason: String,
    },
    /// The session could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),
    /// Device provisioning did not yield an assignment.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use transport::{
    ConnectionProvider, InMemoryShadow, InMemoryTransport, LoopbackProvider, ShadowHandle,
    TransportHandle,
};
pub use types::{CloudMessage, DeviceMessage, PropertyPatch, TransportEvent};
