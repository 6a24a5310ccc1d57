use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use tempfile::TempDir;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    config::{socket_parent_dir, SOCKET_DIR_PREFIX, SOCKET_FILE_PREFIX, UNIX_NETWORK},
    error::PluginError,
    hook::ShutdownHook,
    platform_socket::ensure_supported,
    rpc::{Channel, Server, Service},
    tls::MtlsConfig,
};

/// Private directory that holds every server socket created by a process.
/// Removed with its contents when the last owner drops it.
pub struct SocketDir {
    dir:  TempDir,
    next: AtomicU64,
}

impl SocketDir {
    pub fn new() -> Result<Self, PluginError> {
        let dir = tempfile::Builder::new()
            .prefix(SOCKET_DIR_PREFIX)
            .tempdir_in(socket_parent_dir())?;
        tracing::debug!("Allocated socket directory {}", dir.path().display());
        Ok(Self {
            dir,
            next: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn next_socket_path(&self) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.dir.path().join(format!("{SOCKET_FILE_PREFIX}{n}"))
    }
}

impl fmt::Debug for SocketDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketDir")
            .field("path", &self.dir.path())
            .finish()
    }
}

/// Creates channels and servers over local sockets, wrapped in mutual TLS
/// when configured. Cheap to clone.
#[derive(Clone)]
pub struct TransportProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    sockets: Arc<SocketDir>,
    tls:     Option<TlsSettings>,
    live:    Arc<AtomicUsize>,
}

struct TlsSettings {
    connector: TlsConnector,
    acceptor:  TlsAcceptor,
}

impl fmt::Debug for TransportProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportProvider")
            .field("sockets", &self.inner.sockets)
            .field("secure", &self.is_secure())
            .field("live_handles", &self.live_handles())
            .finish()
    }
}

impl TransportProvider {
    /// A provider with its own socket directory.
    pub fn new(mtls: Option<&MtlsConfig>) -> Result<Self, PluginError> {
        ensure_supported()?;
        Self::with_socket_dir(Arc::new(SocketDir::new()?), mtls)
    }

    /// A provider allocating server sockets in a shared directory.
    pub fn with_socket_dir(
        sockets: Arc<SocketDir>,
        mtls: Option<&MtlsConfig>,
    ) -> Result<Self, PluginError> {
        ensure_supported()?;
        let tls = match mtls {
            Some(config) => Some(TlsSettings {
                connector: config.connector()?,
                acceptor:  config.acceptor()?,
            }),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(ProviderInner {
                sockets,
                tls,
                live: Arc::new(AtomicUsize::new(0)),
            }),
        })
    }

    pub fn is_secure(&self) -> bool {
        self.inner.tls.is_some()
    }

    pub fn socket_dir(&self) -> &Path {
        self.inner.sockets.path()
    }

    /// Channels and servers created by this provider that have not been shut
    /// down yet.
    pub fn live_handles(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// A channel to the server listening at `address`.
    pub fn client_channel(&self, network: &str, address: &str) -> Result<Channel, PluginError> {
        check_network(network)?;

        let live = Arc::clone(&self.inner.live);
        let hook = ShutdownHook::new(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        let connector = self.inner.tls.as_ref().map(|tls| tls.connector.clone());
        let channel = Channel::new(PathBuf::from(address), connector, hook);
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    /// A server hosting `services` on a fresh socket in the socket directory.
    pub fn server(
        &self,
        network: &str,
        services: Vec<Arc<dyn Service>>,
    ) -> Result<Server, PluginError> {
        check_network(network)?;

        let path = self.inner.sockets.next_socket_path();
        let live = Arc::clone(&self.inner.live);
        let socket = path.clone();
        let hook = ShutdownHook::new(move || {
            if let Err(e) = fs::remove_file(&socket) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!("Failed to remove socket {}: {}", socket.display(), e);
                }
            }
            live.fetch_sub(1, Ordering::SeqCst);
        });
        let acceptor = self.inner.tls.as_ref().map(|tls| tls.acceptor.clone());
        let server = Server::bind(path, acceptor, services, hook)?;
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Ok(server)
    }
}

fn check_network(network: &str) -> Result<(), PluginError> {
    if network == UNIX_NETWORK {
        Ok(())
    } else {
        Err(PluginError::UnsupportedTransport {
            network: network.to_owned(),
        })
    }
}
