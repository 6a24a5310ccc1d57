use std::{io, path::Path};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::PluginError;

/// Any bidirectional byte stream a call can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Platform listener backing a [`crate::rpc::Server`]
pub(crate) enum PlatformListener {
    #[cfg(unix)]
    /// Unix domain socket listener
    Unix(UnixListener),
}

impl PlatformListener {
    /// Bind a listener at a filesystem path
    pub(crate) fn bind(path: &Path) -> Result<Self, PluginError> {
        #[cfg(unix)]
        {
            let listener = UnixListener::bind(path)?;
            Ok(PlatformListener::Unix(listener))
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Err(unsupported_platform())
        }
    }

    /// Accept the next incoming connection
    pub(crate) async fn accept(&self) -> io::Result<BoxedStream> {
        #[cfg(unix)]
        {
            let PlatformListener::Unix(listener) = self;
            let (stream, _addr) = listener.accept().await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        match *self {}
    }
}

/// Connect to a listener bound at `path`
pub(crate) async fn connect_socket(path: &Path) -> io::Result<BoxedStream> {
    #[cfg(unix)]
    {
        let stream = UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            unsupported_platform().to_string(),
        ))
    }
}

/// Fails fast on targets without local socket support.
pub(crate) fn ensure_supported() -> Result<(), PluginError> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(unsupported_platform())
    }
}

fn unsupported_platform() -> PluginError {
    PluginError::UnsupportedPlatform {
        os: std::env::consts::OS,
    }
}
