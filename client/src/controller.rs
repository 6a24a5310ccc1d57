use pluglink_common::{
    config::{CONTROLLER_SERVICE, CONTROLLER_SHUTDOWN},
    Channel, Empty,
};

/// Client stub of the plugin's controller service.
#[derive(Debug, Clone)]
pub struct Controller {
    channel: Channel,
}

impl Controller {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Ask the plugin to exit. Best effort: a plugin that is already gone or
    /// never answers is not an error.
    pub async fn shutdown(&self) {
        let result = self
            .channel
            .unary::<Empty, Empty>(CONTROLLER_SERVICE, CONTROLLER_SHUTDOWN, &Empty {})
            .await;
        if let Err(status) = result {
            tracing::debug!("Plugin shutdown request failed: {}", status);
        }
    }
}
