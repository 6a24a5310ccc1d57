//! Test plugin for pluglink
//!
//! Both halves of two small capabilities live here: the services the
//! `fake-plugin` binary serves and the clients a host dispenses for them.
//!
//! - Protocol version 1 serves the key-value store
//! - Protocol version 2 adds the counter, which calls back into the host

pub mod counter;
pub mod kv;

use pluglink_client::{HandshakeConfig, PluginSet};
use pluglink_server::ServeConfig;

pub use counter::{Adder, CounterClient, CounterPlugin, CounterService};
pub use kv::{KvClient, KvPlugin, KvService};

pub const COOKIE_KEY: &str = "FAKE_PLUGIN_COOKIE";
pub const COOKIE_VALUE: &str = "d1c2b3a4-fake-plugin";

/// What the binary serves.
pub fn serve_config() -> ServeConfig {
    ServeConfig::new(COOKIE_KEY, COOKIE_VALUE)
        .with_service(1, KvService::new)
        .with_service(2, KvService::new)
        .with_service(2, CounterService::new)
}

/// Handshake values a host uses to launch the binary.
pub fn handshake() -> HandshakeConfig {
    HandshakeConfig::new(COOKIE_KEY, COOKIE_VALUE)
}

/// Capabilities a host registers for `version`.
pub fn plugins(version: u32) -> PluginSet {
    match version {
        1 => PluginSet::new().with(KvPlugin),
        _ => PluginSet::new().with(KvPlugin).with(CounterPlugin),
    }
}
