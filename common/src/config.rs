use std::{env, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Version of the handshake/transport protocol itself, independent of the
/// application protocol versions negotiated per plugin.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Protocol tag announced in the fifth handshake field.
///
/// The tag is kept for handshake compatibility only: the wire format behind
/// it is pluglink's own frame protocol, so only pluglink plugins can be
/// talked to. A gRPC plugin announcing the same tag passes the handshake and
/// fails on its first call with an `InvalidData` frame error.
pub const RPC_PROTOCOL: &str = "grpc";

/// The only network type accepted in handshakes and broker announcements.
pub const UNIX_NETWORK: &str = "unix";

/// Comma-separated, ascending list of application versions the host supports.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// PEM certificate of the host when auto mTLS is enabled.
pub const CLIENT_CERT_ENV: &str = "PLUGIN_CLIENT_CERT";

/// Overrides the parent directory of the per-process socket directory.
pub const SOCKET_DIR_ENV: &str = "PLUGLINK_SOCKET_DIR";

pub const BROKER_SERVICE: &str = "plugin.GRPCBroker";
pub const BROKER_START_STREAM: &str = "StartStream";
pub const CONTROLLER_SERVICE: &str = "plugin.GRPCController";
pub const CONTROLLER_SHUTDOWN: &str = "Shutdown";
pub const STDIO_SERVICE: &str = "plugin.GRPCStdio";
pub const STDIO_STREAM: &str = "StreamStdio";

pub(crate) const SOCKET_DIR_PREFIX: &str = "plugins-";
pub(crate) const SOCKET_FILE_PREFIX: &str = "server-";

pub(crate) fn socket_parent_dir() -> PathBuf {
    env::var_os(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
}

/// Announcement of a callback service endpoint, exchanged over the broker
/// control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub service_id: u32,
    pub network:    String,
    pub address:    String,
}

/// Which standard stream a relayed chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdioChannel {
    Stdout,
    Stderr,
}

/// A chunk of plugin output relayed over the stdio service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioData {
    pub channel: StdioChannel,
    pub data:    Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}
