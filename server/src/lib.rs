//! pluglink plugin library
//!
//! The plugin side of a pluglink session. A plugin binary builds a
//! [`ServeConfig`] listing its services per protocol version and hands it to
//! [`serve`], which takes care of the handshake with the host.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pluglink_server::{serve, PluginContext, ServeConfig, Service};
//!
//! # fn greeter(_context: &PluginContext) -> Arc<dyn Service> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), pluglink_server::PluginError> {
//!     let config = ServeConfig::new("GREETER_PLUGIN", "hello").with_service(1, greeter);
//!     serve(config).await
//! }
//! ```
//!
//! # Features
//!
//! - **Version negotiation**: the highest version offered by the host in
//!   `PLUGIN_PROTOCOL_VERSIONS` that the plugin serves
//! - **Auto mTLS**: enabled whenever the host passes `PLUGIN_CLIENT_CERT`
//! - **Built-in services**: broker, controller and stdio relay are always
//!   served next to the application services

mod config;
mod controller;
mod serve;
mod stdio;

pub use config::{HostEnvironment, PluginContext, ServeConfig, ServiceFactory};
pub use controller::ControllerService;
pub use serve::{serve, serve_with};
pub use stdio::{StdioService, StdioWriter};
// Re-export the shared types services are written against
pub use pluglink_common::{
    Broker, Channel, Code, PluginError, Server, ServerCall, Service, Sink, Status, Streaming,
};
