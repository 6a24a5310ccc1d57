use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use pluglink_common::{Broker, Channel, PluginError, TransportProvider};
use tokio::{
    io::BufReader,
    process::{Child, ChildStderr, ChildStdout},
    sync::Mutex,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    config::StdioMode,
    controller::Controller,
    handshake::Handshake,
    logs::{drain_stdout, relay_diagnostics},
    plugin::PluginSet,
    process, stdio,
};

/// Everything [`crate::Manager::start`] collected before the session exists.
pub(crate) struct SessionParts {
    pub(crate) name:          String,
    pub(crate) child:         Child,
    pub(crate) stdout:        BufReader<ChildStdout>,
    pub(crate) stderr:        ChildStderr,
    pub(crate) handshake:     Handshake,
    pub(crate) plugins:       PluginSet,
    pub(crate) transport:     TransportProvider,
    pub(crate) stdio_mode:    StdioMode,
    pub(crate) dial_timeout:  Duration,
    pub(crate) close_timeout: Duration,
}

/// A running plugin: its process, main channel, broker and relay tasks.
pub struct Session {
    id:            Uuid,
    name:          String,
    handshake:     Handshake,
    channel:       Channel,
    broker:        Arc<Broker>,
    controller:    Controller,
    plugins:       PluginSet,
    transport:     TransportProvider,
    tasks:         TaskTracker,
    cancel:        CancellationToken,
    close_timeout: Duration,
    child:         Mutex<Option<Child>>,
    alive:         AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.handshake.address)
            .field("plugin_version", &self.handshake.plugin_version)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Session {
    /// Wire up the channel, relays and broker of a freshly handshaken plugin.
    pub(crate) fn start(parts: SessionParts) -> Result<Arc<Self>, PluginError> {
        let SessionParts {
            name,
            child,
            stdout,
            stderr,
            handshake,
            plugins,
            transport,
            stdio_mode,
            dial_timeout,
            close_timeout,
        } = parts;

        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();

        spawn_until_cancelled(&tasks, &cancel, relay_diagnostics(stderr, name.clone()));
        spawn_until_cancelled(&tasks, &cancel, drain_stdout(stdout, name.clone()));

        let channel = transport.client_channel(&handshake.network_type, &handshake.address)?;
        let broker = Broker::new(transport.clone(), dial_timeout, cancel.clone());
        stdio::start(
            channel.clone(),
            stdio_mode,
            name.clone(),
            &tasks,
            cancel.clone(),
        );
        broker.start(&channel, &tasks);

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            controller: Controller::new(channel.clone()),
            handshake,
            channel,
            broker,
            plugins,
            transport,
            tasks,
            cancel,
            close_timeout,
            child: Mutex::new(Some(child)),
            alive: AtomicBool::new(true),
        });
        tracing::info!(
            "Plugin {} started at {} (protocol version {})",
            session.name,
            session.handshake.address,
            session.handshake.plugin_version
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the plugin executable, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn transport(&self) -> &TransportProvider {
        &self.transport
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// A new client for the capability whose [`crate::Plugin::Client`] is `T`.
    pub fn dispense<T: Send + 'static>(&self) -> Result<T, PluginError> {
        self.plugins.dispense::<T>(&self.channel, &self.broker)
    }

    /// Tear the session down: stop the relays and the broker, ask the plugin
    /// to exit, close the channel and reap the process. Later and concurrent
    /// calls return once the first one has finished.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let Some(mut process) = child.take() else {
            return;
        };

        self.cancel.cancel();
        self.controller.shutdown().await;
        self.channel.shutdown(self.close_timeout).await;

        self.tasks.close();
        if tokio::time::timeout(self.close_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::debug!("Relay tasks of {} did not stop in time", self.name);
        }

        process::reap(&mut process, &self.name, self.close_timeout).await;
        self.alive.store(false, Ordering::SeqCst);
        tracing::info!("Plugin {} killed", self.name);
    }

    /// Stop the session without waiting: cancel its tasks and send the
    /// process a kill signal. Does nothing while a [`Session::kill`] is
    /// running.
    pub(crate) fn abandon(&self) {
        self.cancel.cancel();
        let Ok(mut child) = self.child.try_lock() else {
            return;
        };
        let Some(mut process) = child.take() else {
            return;
        };
        if let Err(e) = process.start_kill() {
            tracing::debug!("Failed to kill plugin {}: {}", self.name, e);
        }
        self.alive.store(false, Ordering::SeqCst);
        tracing::info!("Plugin {} abandoned", self.name);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // the child itself is killed on drop
        self.cancel.cancel();
    }
}

fn spawn_until_cancelled<F>(tasks: &TaskTracker, cancel: &CancellationToken, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let cancel = cancel.clone();
    tasks.spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = task => {}
        }
    });
}
