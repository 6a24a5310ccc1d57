use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustls::pki_types::ServerName;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::{
    call::{CallGuard, InFlight, Sink, Streaming},
    frame::{Frame, FrameReader, FrameWriter},
    Status,
};
use crate::{
    hook::ShutdownHook,
    platform_socket::{connect_socket, BoxedStream},
};

/// Name presented in SNI. Peers are authenticated by certificate
/// fingerprint, so the value only has to match the generated certificates.
const TLS_SERVER_NAME: &str = "localhost";

/// A client handle to a plugin or callback server. Every call opens its own
/// connection to the server socket; clones share shutdown state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    path:      PathBuf,
    tls:       Option<TlsConnector>,
    closing:   CancellationToken,
    force:     CancellationToken,
    in_flight: Arc<InFlight>,
    hook:      ShutdownHook,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.force.cancel();
        self.hook.fire();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("path", &self.inner.path)
            .field("secure", &self.inner.tls.is_some())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(path: PathBuf, tls: Option<TlsConnector>, hook: ShutdownHook) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                path,
                tls,
                closing: CancellationToken::new(),
                force: CancellationToken::new(),
                in_flight: Arc::default(),
                hook,
            }),
        }
    }

    /// Socket path this channel connects to
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_secure(&self) -> bool {
        self.inner.tls.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Calls currently open on this channel
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Send one request and wait for one response.
    pub async fn unary<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (requests, mut responses) = self.bidi_streaming::<Req, Resp>(service, method).await?;
        let sent = async {
            requests.send(request).await?;
            requests.close().await
        }
        .await;
        if let Err(status) = sent {
            // The callee may have rejected the call before reading it.
            return Err(responses.message().await.err().unwrap_or(status));
        }

        let response = responses
            .message()
            .await?
            .ok_or_else(|| Status::internal(format!("{service}/{method} returned no response")))?;
        if responses.message().await?.is_some() {
            return Err(Status::internal(format!(
                "{service}/{method} returned more than one response"
            )));
        }
        Ok(response)
    }

    /// Send one request and receive a stream of responses.
    pub async fn server_streaming<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Streaming<Resp>, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (requests, mut responses) = self.bidi_streaming::<Req, Resp>(service, method).await?;
        let sent = async {
            requests.send(request).await?;
            requests.close().await
        }
        .await;
        if let Err(status) = sent {
            return Err(responses.message().await.err().unwrap_or(status));
        }
        Ok(responses)
    }

    /// Open a call with independent request and response streams.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(Sink<Req>, Streaming<Resp>), Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (reader, writer, guard) = self.open(service, method).await?;
        let sink = Sink::new(writer, self.inner.force.clone(), Some(Arc::clone(&guard)));
        let stream = Streaming::new(reader, self.inner.force.clone(), Some(guard));
        Ok((sink, stream))
    }

    async fn open(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(FrameReader, Arc<Mutex<FrameWriter>>, Arc<CallGuard>), Status> {
        if self.is_shut_down() {
            return Err(Status::unavailable("channel has been shut down"));
        }
        let guard = Arc::new(self.inner.in_flight.enter());

        let connect = async {
            let socket = connect_socket(&self.inner.path)
                .await
                .map_err(Status::from_io)?;
            let stream: BoxedStream = match &self.inner.tls {
                Some(connector) => {
                    let server_name = ServerName::try_from(TLS_SERVER_NAME)
                        .map_err(|e| Status::internal(format!("Invalid server name: {e}")))?;
                    let tls = connector
                        .connect(server_name, socket)
                        .await
                        .map_err(Status::from_io)?;
                    Box::new(tls)
                }
                None => socket,
            };

            let (read, write) = tokio::io::split(stream);
            let mut writer = FrameWriter::new(write);
            writer
                .send(&Frame::Call {
                    service: service.to_owned(),
                    method:  method.to_owned(),
                })
                .await
                .map_err(Status::from_io)?;
            Ok::<_, Status>((FrameReader::new(read), Arc::new(Mutex::new(writer))))
        };

        let (reader, writer) = tokio::select! {
            () = self.inner.force.cancelled() => {
                return Err(Status::cancelled("channel was shut down"));
            }
            opened = connect => opened?,
        };
        Ok((reader, writer, guard))
    }

    /// Stop accepting calls, give in-flight calls up to `grace` to finish,
    /// then force the rest closed. Safe to call repeatedly and concurrently;
    /// the release hook runs once.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closing.cancel();
        if tokio::time::timeout(grace, self.inner.in_flight.wait_idle())
            .await
            .is_err()
        {
            tracing::debug!(
                "Forcing {} in-flight call(s) on {} closed",
                self.in_flight(),
                self.inner.path.display()
            );
        }
        self.inner.force.cancel();
        self.inner.hook.fire();
    }
}
