use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use pluglink_common::{Broker, Channel, PluginError};

/// A capability the host knows how to talk to.
///
/// Implementations build the typed client handed out by
/// [`crate::Session::dispense`]; the client type doubles as the key the
/// capability is looked up by.
pub trait Plugin: Send + Sync + 'static {
    type Client: Send + 'static;

    fn client(&self, channel: Channel, broker: Arc<Broker>) -> Self::Client;
}

trait ErasedPlugin: Send + Sync {
    fn dispense(&self, channel: Channel, broker: Arc<Broker>) -> Box<dyn Any + Send>;
}

impl<P: Plugin> ErasedPlugin for P {
    fn dispense(&self, channel: Channel, broker: Arc<Broker>) -> Box<dyn Any + Send> {
        Box::new(self.client(channel, broker))
    }
}

/// The capabilities offered for one protocol version, keyed by client type.
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: HashMap<TypeId, Entry>,
}

#[derive(Clone)]
struct Entry {
    name:   &'static str,
    plugin: Arc<dyn ErasedPlugin>,
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.plugins.values().map(|entry| entry.name))
            .finish()
    }
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin`, replacing any plugin with the same client type.
    pub fn with<P: Plugin>(mut self, plugin: P) -> Self {
        self.insert(plugin);
        self
    }

    pub fn insert<P: Plugin>(&mut self, plugin: P) {
        self.plugins.insert(
            TypeId::of::<P::Client>(),
            Entry {
                name:   type_name::<P::Client>(),
                plugin: Arc::new(plugin),
            },
        );
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.plugins.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn dispense<T: Send + 'static>(
        &self,
        channel: &Channel,
        broker: &Arc<Broker>,
    ) -> Result<T, PluginError> {
        let not_found = || PluginError::NotFound {
            capability: type_name::<T>(),
        };
        let entry = self.plugins.get(&TypeId::of::<T>()).ok_or_else(not_found)?;
        entry
            .plugin
            .dispense(channel.clone(), Arc::clone(broker))
            .downcast::<T>()
            .map(|client| *client)
            .map_err(|_| not_found())
    }
}
