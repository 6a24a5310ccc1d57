use std::{collections::BTreeMap, fmt, time::Duration};

use pluglink_common::{PluginError, DEFAULT_DIAL_TIMEOUT};
use tokio::io::AsyncWrite;

use crate::plugin::PluginSet;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Values both sides agree on before any version negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Version served by the flat plugin set, if one is configured.
    pub protocol_version:   Option<u32>,
    /// Environment variable the plugin checks to know it was launched by a host.
    pub magic_cookie_key:   String,
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    pub fn new(magic_cookie_key: impl Into<String>, magic_cookie_value: impl Into<String>) -> Self {
        Self {
            protocol_version:   None,
            magic_cookie_key:   magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = Some(version);
        self
    }
}

/// Boxed writer receiving piped plugin output.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// What to do with the plugin's relayed stdout and stderr.
#[derive(Default)]
pub enum StdioMode {
    /// Drop all output.
    Discard,
    /// Log each line through the diagnostic logger.
    #[default]
    Log,
    /// Forward raw output to the given writers.
    Pipe {
        stdout: OutputSink,
        stderr: OutputSink,
    },
}

impl fmt::Debug for StdioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioMode::Discard => f.write_str("Discard"),
            StdioMode::Log => f.write_str("Log"),
            StdioMode::Pipe { .. } => f.write_str("Pipe"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionMode {
    #[default]
    Plaintext,
    /// Generate an ephemeral certificate, hand it to the plugin and pin the
    /// certificate it answers with.
    AutoMtls,
}

/// Configuration for launching one plugin session
#[derive(Debug)]
pub struct ClientConfig {
    /// Program and arguments of the plugin subprocess
    pub command:           Vec<String>,
    pub handshake:         HandshakeConfig,
    /// Plugins served at `handshake.protocol_version`
    pub plugins:           PluginSet,
    /// Plugins per protocol version
    pub versioned_plugins: BTreeMap<u32, PluginSet>,
    /// How long to wait for the handshake line
    pub start_timeout:     Duration,
    pub stdio_mode:        StdioMode,
    pub encryption_mode:   EncryptionMode,
    /// How long broker dials wait for an announcement
    pub dial_timeout:      Duration,
    /// Bound on graceful channel close and process exit during `kill`
    pub close_timeout:     Duration,
}

impl ClientConfig {
    /// Creates a plugin configuration with default timeouts, logged stdio and
    /// plaintext transport.
    pub fn new<I, S>(command: I, handshake: HandshakeConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            handshake,
            plugins: PluginSet::new(),
            versioned_plugins: BTreeMap::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stdio_mode: StdioMode::default(),
            encryption_mode: EncryptionMode::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Set the plugins served at `handshake.protocol_version`
    pub fn with_plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = plugins;
        self
    }

    /// Add the plugins served at `version`
    pub fn with_versioned_plugins(mut self, version: u32, plugins: PluginSet) -> Self {
        self.versioned_plugins.insert(version, plugins);
        self
    }

    /// Set the handshake timeout
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set how relayed plugin output is handled
    pub fn with_stdio_mode(mut self, mode: StdioMode) -> Self {
        self.stdio_mode = mode;
        self
    }

    /// Set the transport encryption mode
    pub fn with_encryption_mode(mut self, mode: EncryptionMode) -> Self {
        self.encryption_mode = mode;
        self
    }

    /// Set the broker dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the bound used while tearing a session down
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Merge the flat and versioned plugin sets into one map, rejecting
    /// configurations where a version would be served by both or where no
    /// version is served at all.
    pub fn resolve_plugins(&self) -> Result<BTreeMap<u32, PluginSet>, PluginError> {
        if self.command.is_empty() {
            return Err(PluginError::configuration("plugin command is empty"));
        }

        let mut versions = self.versioned_plugins.clone();
        versions.retain(|_, plugins| !plugins.is_empty());

        match self.handshake.protocol_version {
            Some(version) if !self.plugins.is_empty() => {
                if versions.contains_key(&version) {
                    return Err(PluginError::configuration(format!(
                        "protocol version {version} is configured both as the flat plugin set \
                         and in the versioned plugins"
                    )));
                }
                versions.insert(version, self.plugins.clone());
            }
            None if !self.plugins.is_empty() => {
                return Err(PluginError::configuration(
                    "a flat plugin set requires handshake.protocol_version",
                ));
            }
            _ => {}
        }

        if versions.is_empty() {
            return Err(PluginError::configuration("no plugins are configured"));
        }
        Ok(versions)
    }
}
