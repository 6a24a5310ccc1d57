use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

use crate::rpc::Status;

/// Errors raised while starting, negotiating with, or talking to a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The session configuration is unusable. Raised before any process is spawned.
    #[error("invalid plugin configuration: {message}")]
    Configuration { message: String },

    /// The plugin did not print its handshake line in time.
    #[error("plugin did not complete its handshake within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("failed to parse plugin handshake: {message}")]
    Parse { message: String },

    #[error("incompatible core protocol version {plugin} (host speaks {host})")]
    IncompatibleCoreVersion { plugin: u32, host: u32 },

    #[error("unsupported plugin protocol '{kind}', only '{supported}' is supported")]
    UnsupportedProtocol {
        kind:      String,
        supported: &'static str,
    },

    #[error("plugin protocol version {version} is not supported by the host; available versions: {}", format_versions(.available))]
    Negotiation { version: u32, available: Vec<u32> },

    #[error("unsupported network type '{network}', only 'unix' is supported")]
    UnsupportedTransport { network: String },

    #[error("local socket transports are not supported on '{os}'")]
    UnsupportedPlatform { os: &'static str },

    #[error("certificate error: {message}")]
    Certificate { message: String },

    #[error("auto mTLS was requested but the plugin did not send a server certificate")]
    MissingServerCertificate,

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    /// The broker control stream failed; every pending and future dial of the
    /// session resolves with this error.
    #[error("broker control stream failed: {0}")]
    BrokerService(Status),

    #[error("timed out after {timeout:?} waiting for service #{service_id} to be announced")]
    DialTimeout { service_id: u32, timeout: Duration },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("no negotiated plugin provides '{capability}'")]
    NotFound { capability: &'static str },

    #[error(transparent)]
    Rpc(#[from] Status),

    #[error("failed to spawn plugin '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source:  Arc<io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PluginError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// True for errors that report the operation was cut short rather than
    /// rejected: explicit cancellation and broker stream failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::BrokerService(_))
    }
}

fn format_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_error_lists_available_versions() {
        let err = PluginError::Negotiation {
            version:   4,
            available: vec![1, 2, 3],
        };
        assert_eq!(
            err.to_string(),
            "plugin protocol version 4 is not supported by the host; available versions: 1, 2, 3"
        );
    }

    #[test]
    fn broker_failures_count_as_cancellation() {
        assert!(PluginError::BrokerService(Status::unavailable("gone")).is_cancellation());
        assert!(PluginError::cancelled("session killed").is_cancellation());
        assert!(!PluginError::MissingServerCertificate.is_cancellation());
    }
}
