use std::{fmt, net::SocketAddr, str::FromStr};

use pluglink_common::{
    certs,
    config::{CORE_PROTOCOL_VERSION, RPC_PROTOCOL, UNIX_NETWORK},
    PluginError,
};
use rustls::pki_types::CertificateDer;

const MIN_FIELDS: usize = 5;

/// The single line a plugin prints on stdout once it is ready:
/// `core|pluginVersion|networkType|address|rpcKind[|certificate]`.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version:       u32,
    pub plugin_version:     u32,
    pub network_type:       String,
    pub address:            String,
    pub rpc_kind:           String,
    pub server_certificate: Option<CertificateDer<'static>>,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("core_version", &self.core_version)
            .field("plugin_version", &self.plugin_version)
            .field("network_type", &self.network_type)
            .field("address", &self.address)
            .field("rpc_kind", &self.rpc_kind)
            .field(
                "server_certificate",
                &self.server_certificate.as_ref().map(certs::fingerprint),
            )
            .finish()
    }
}

impl Handshake {
    /// Parse and validate a handshake line.
    pub fn parse(line: &str) -> Result<Self, PluginError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < MIN_FIELDS {
            return Err(PluginError::parse(format!(
                "expected at least {MIN_FIELDS} '|'-separated fields, got {}: {line:?}",
                parts.len()
            )));
        }

        let core_version: u32 = parts[0].parse().map_err(|_| {
            PluginError::parse(format!("invalid core protocol version {:?}", parts[0]))
        })?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(PluginError::IncompatibleCoreVersion {
                plugin: core_version,
                host:   CORE_PROTOCOL_VERSION,
            });
        }

        let plugin_version: u32 = parts[1].parse().map_err(|_| {
            PluginError::parse(format!("invalid plugin protocol version {:?}", parts[1]))
        })?;

        let network_type = parts[2];
        if network_type != UNIX_NETWORK {
            return Err(PluginError::UnsupportedTransport {
                network: network_type.to_owned(),
            });
        }

        let address = parts[3];
        if looks_like_loopback(address) {
            tracing::warn!(
                "Plugin address {} looks like a loopback host; only unix sockets are supported",
                address
            );
        }

        let rpc_kind = parts[4];
        if rpc_kind != RPC_PROTOCOL {
            return Err(PluginError::UnsupportedProtocol {
                kind:      rpc_kind.to_owned(),
                supported: RPC_PROTOCOL,
            });
        }

        let server_certificate = match parts.get(5).copied() {
            None | Some("") => None,
            Some(encoded) => Some(certs::parse_encoded_certificate(encoded)?),
        };

        Ok(Self {
            core_version,
            plugin_version,
            network_type: network_type.to_owned(),
            address: address.to_owned(),
            rpc_kind: rpc_kind.to_owned(),
            server_certificate,
        })
    }
}

impl FromStr for Handshake {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn looks_like_loopback(address: &str) -> bool {
    address.contains("localhost") || address.parse::<SocketAddr>().is_ok()
}
