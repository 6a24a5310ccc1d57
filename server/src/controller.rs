use std::sync::Arc;

use futures_util::{future::BoxFuture, FutureExt};
use pluglink_common::{
    config::{CONTROLLER_SERVICE, CONTROLLER_SHUTDOWN},
    Empty, ServerCall, Service, Status,
};
use tokio_util::sync::CancellationToken;

/// Lets the host ask this plugin process to exit.
pub struct ControllerService {
    shutdown: CancellationToken,
}

impl ControllerService {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

impl Service for ControllerService {
    fn name(&self) -> &'static str {
        CONTROLLER_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            if call.method() != CONTROLLER_SHUTDOWN {
                return Err(call.unimplemented(CONTROLLER_SERVICE));
            }
            tracing::debug!("Host requested shutdown");
            let replied = call.unary(|_: Empty| async { Ok(Empty {}) }).await;
            self.shutdown.cancel();
            replied
        }
        .boxed()
    }
}
