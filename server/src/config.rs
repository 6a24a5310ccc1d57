use std::{collections::BTreeMap, env, fmt, sync::Arc};

use pluglink_common::{
    config::{CLIENT_CERT_ENV, PROTOCOL_VERSIONS_ENV},
    Broker, PluginError, Service,
};

use crate::stdio::StdioWriter;

/// What application services get to use while they are being built.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Broker of this plugin process, for serving or dialing callbacks.
    pub broker: Arc<Broker>,
    /// Output relayed to the host over the stdio stream.
    pub stdio:  StdioWriter,
}

/// Builds one application service for a negotiated protocol version.
pub type ServiceFactory = Arc<dyn Fn(&PluginContext) -> Arc<dyn Service> + Send + Sync>;

/// Configuration of a plugin process
#[derive(Clone)]
pub struct ServeConfig {
    /// Environment variable the host sets to prove it launched us
    pub cookie_key:   String,
    pub cookie_value: String,
    /// Application services per protocol version
    pub versions:     BTreeMap<u32, Vec<ServiceFactory>>,
}

impl fmt::Debug for ServeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeConfig")
            .field("cookie_key", &self.cookie_key)
            .field("versions", &self.versions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServeConfig {
    /// Creates a configuration serving no versions yet
    pub fn new(cookie_key: impl Into<String>, cookie_value: impl Into<String>) -> Self {
        Self {
            cookie_key:   cookie_key.into(),
            cookie_value: cookie_value.into(),
            versions:     BTreeMap::new(),
        }
    }

    /// Add a service built by `factory` to protocol `version`
    pub fn with_service<F>(mut self, version: u32, factory: F) -> Self
    where
        F: Fn(&PluginContext) -> Arc<dyn Service> + Send + Sync + 'static,
    {
        self.versions
            .entry(version)
            .or_default()
            .push(Arc::new(factory));
        self
    }

    /// Pick the highest version both sides serve. Without an offer from the
    /// host, the highest version we serve is used.
    pub fn negotiate(&self, offered: Option<&str>) -> Result<u32, PluginError> {
        let ours = || self.versions.keys().copied().collect::<Vec<_>>();
        let Some(highest) = self.versions.keys().next_back().copied() else {
            return Err(PluginError::configuration("the plugin serves no protocol versions"));
        };

        let Some(offered) = offered.map(str::trim).filter(|offered| !offered.is_empty()) else {
            return Ok(highest);
        };

        let mut host = Vec::new();
        for version in offered.split(',') {
            let version = version.trim();
            let parsed = version.parse::<u32>().map_err(|_| {
                PluginError::parse(format!(
                    "invalid protocol version {version:?} in {PROTOCOL_VERSIONS_ENV}"
                ))
            })?;
            host.push(parsed);
        }

        let shared = host
            .iter()
            .copied()
            .filter(|version| self.versions.contains_key(version))
            .max();
        shared.ok_or_else(|| {
            host.sort_unstable();
            tracing::debug!("Plugin serves versions {:?}, host offers {:?}", ours(), host);
            PluginError::Negotiation {
                version:   highest,
                available: host,
            }
        })
    }
}

/// The values the host hands a plugin through its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    pub cookie:             Option<String>,
    pub protocol_versions:  Option<String>,
    pub client_certificate: Option<String>,
}

impl HostEnvironment {
    /// Read from the process environment, looking the cookie up under
    /// `cookie_key`.
    pub fn from_env(cookie_key: &str) -> Self {
        Self {
            cookie:             env::var(cookie_key).ok(),
            protocol_versions:  env::var(PROTOCOL_VERSIONS_ENV).ok(),
            client_certificate: env::var(CLIENT_CERT_ENV).ok().filter(|pem| !pem.is_empty()),
        }
    }

    pub(crate) fn check_cookie(&self, config: &ServeConfig) -> Result<(), PluginError> {
        match &self.cookie {
            Some(cookie) if *cookie == config.cookie_value => Ok(()),
            _ => Err(PluginError::configuration(format!(
                "this binary is a plugin and is meant to be launched by its host \
                 ({} is missing or wrong)",
                config.cookie_key
            ))),
        }
    }
}
