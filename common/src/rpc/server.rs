use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    call::ServerCall,
    frame::{Frame, FrameReader, FrameWriter},
    Status,
};
use crate::{
    error::PluginError,
    hook::ShutdownHook,
    platform_socket::{BoxedStream, PlatformListener},
};

/// A named RPC service hosted by a [`Server`].
///
/// Implementations dispatch on [`ServerCall::method`] and drive the call to
/// completion; the returned status is sent to the caller as the final frame.
pub trait Service: Send + Sync + 'static {
    /// Fully qualified service name callers address, e.g. `plugin.GRPCBroker`.
    fn name(&self) -> &'static str;

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>>;
}

type Services = HashMap<&'static str, Arc<dyn Service>>;

/// An RPC server listening on a local socket.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    path:     PathBuf,
    shutdown: CancellationToken,
    tasks:    TaskTracker,
    hook:     ShutdownHook,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.hook.fire();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.inner.path)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Server {
    /// Bind `path` and start accepting calls in the background.
    pub(crate) fn bind(
        path: PathBuf,
        tls: Option<TlsAcceptor>,
        services: Vec<Arc<dyn Service>>,
        hook: ShutdownHook,
    ) -> Result<Self, PluginError> {
        let listener = PlatformListener::bind(&path)?;
        let services: Arc<Services> = Arc::new(
            services
                .into_iter()
                .map(|service| (service.name(), service))
                .collect(),
        );

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(accept_loop(
            listener,
            tls,
            services,
            shutdown.clone(),
            tasks.clone(),
        ));
        tracing::debug!("Server listening on {}", path.display());

        Ok(Self {
            inner: Arc::new(ServerInner {
                path,
                shutdown,
                tasks,
                hook,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Socket path in the textual form used by handshakes and broker
    /// announcements.
    pub fn address(&self) -> String {
        self.inner.path.to_string_lossy().into_owned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`Server::shutdown`] has been requested.
    pub async fn stopped(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Stop accepting, cancel every open call and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if self.inner.hook.fire() {
            tracing::debug!("Server at {} shut down", self.inner.path.display());
        }
    }
}

async fn accept_loop(
    listener: PlatformListener,
    tls: Option<TlsAcceptor>,
    services: Arc<Services>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let socket = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("Connection error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        let tls = tls.clone();
        let services = Arc::clone(&services);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                served = serve_connection(socket, tls, services, shutdown.clone()) => {
                    if let Err(e) = served {
                        tracing::debug!("Connection ended with error: {}", e);
                    }
                }
            }
        });
    }
}

async fn serve_connection(
    socket: BoxedStream,
    tls: Option<TlsAcceptor>,
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let stream: BoxedStream = match tls {
        Some(acceptor) => Box::new(acceptor.accept(socket).await?),
        None => socket,
    };

    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let writer = Arc::new(Mutex::new(FrameWriter::new(write)));

    let (service, method) = match reader.recv().await? {
        Some(Frame::Call { service, method }) => (service, method),
        Some(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection did not start with a call frame",
            ))
        }
        None => return Ok(()),
    };

    let status = match services.get(service.as_str()) {
        Some(handler) => {
            let call = ServerCall::new(method, reader, Arc::clone(&writer), shutdown.child_token());
            match Arc::clone(handler).call(call).await {
                Ok(()) => Status::ok(),
                Err(status) => status,
            }
        }
        None => Status::unimplemented(format!("unknown service {service}")),
    };

    let mut writer = writer.lock().await;
    writer.send(&Frame::Status(status)).await?;
    writer.shutdown().await
}
