//! pluglink host library
//!
//! This crate launches plugin subprocesses, negotiates a protocol version
//! with them over a one-line handshake, and hands out typed clients bound to
//! the plugin's RPC channel and callback broker.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pluglink_client::{
//!     Broker, Channel, ClientConfig, EncryptionMode, HandshakeConfig, Manager, Plugin, PluginSet,
//! };
//!
//! struct Greeter;
//!
//! struct GreeterClient {
//!     channel: Channel,
//! }
//!
//! impl Plugin for Greeter {
//!     type Client = GreeterClient;
//!
//!     fn client(&self, channel: Channel, _broker: Arc<Broker>) -> GreeterClient {
//!         GreeterClient { channel }
//!     }
//! }
//!
//! # async fn run() -> Result<(), pluglink_client::PluginError> {
//! let manager = Manager::new()?;
//! let config = ClientConfig::new(
//!     ["./greeter-plugin"],
//!     HandshakeConfig::new("GREETER_PLUGIN", "hello").with_protocol_version(1),
//! )
//! .with_plugins(PluginSet::new().with(Greeter))
//! .with_encryption_mode(EncryptionMode::AutoMtls);
//!
//! let session = manager.start(config).await?;
//! let greeter = session.dispense::<GreeterClient>()?;
//! let reply: String = greeter.channel.unary("greeter.Greeter", "Hello", &"world").await?;
//! println!("{reply}");
//!
//! manager.kill_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Version negotiation**: several plugin sets keyed by protocol version,
//!   the plugin picks one and the host dispenses from it
//! - **Auto mTLS**: throwaway certificates on both sides, trust pinned to the
//!   peer's fingerprint
//! - **Diagnostics**: the plugin's stderr is re-emitted through `tracing`
//!   under the `pluglink::plugin` target

mod config;
mod controller;
mod handshake;
mod logs;
mod manager;
mod plugin;
mod process;
mod session;
mod stdio;

pub use config::{ClientConfig, EncryptionMode, HandshakeConfig, OutputSink, StdioMode};
pub use controller::Controller;
pub use handshake::Handshake;
pub use logs::PLUGIN_LOG_TARGET;
pub use manager::Manager;
pub use plugin::{Plugin, PluginSet};
pub use session::Session;
// Re-export the shared types plugin clients are written against
pub use pluglink_common::{
    Broker, Channel, Code, PluginError, Server, ServerCall, Service, Sink, Status, Streaming,
    TransportProvider,
};
