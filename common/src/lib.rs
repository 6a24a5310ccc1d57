//! pluglink common library
//!
//! This crate holds everything the host and the plugin side of a pluglink
//! session share:
//!
//! - Protocol constants, environment variable names and wire messages
//! - A small length-prefixed RPC layer over local sockets
//! - The [`TransportProvider`] that creates channels and servers, optionally
//!   secured with fingerprint-pinned mutual TLS
//! - The callback [`Broker`] used to stand up extra services mid-session
//! - Ephemeral certificate generation for auto mTLS
//!
//! # Features
//!
//! - **Local sockets only**: Unix domain sockets in a private per-process
//!   directory; other platforms report `UnsupportedPlatform`
//! - **Mutual TLS**: both sides present a throwaway certificate and trust
//!   exactly the peer's fingerprint
//! - **Bidirectional callbacks**: either side can serve, either side can dial

/// Callback broker and its control stream service
pub mod broker;

/// Certificate generation, encoding and validation
pub mod certs;

/// Protocol constants and wire messages
pub mod config;

/// Error types
pub mod error;

/// Run-once cleanup hooks
pub mod hook;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Framed RPC channels, servers and services
pub mod rpc;

/// Mutual TLS configuration
pub mod tls;

/// Channel and server factory
pub mod transport;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use broker::{Broker, BrokerService, DEFAULT_DIAL_TIMEOUT};
pub use certs::{generate_identity, Identity};
pub use config::{ConnectionInfo, Empty, StdioChannel, StdioData, CORE_PROTOCOL_VERSION};
pub use error::PluginError;
pub use hook::ShutdownHook;
pub use rpc::{Channel, Code, Server, ServerCall, Service, Sink, Status, Streaming};
pub use tls::MtlsConfig;
pub use transport::{SocketDir, TransportProvider};
