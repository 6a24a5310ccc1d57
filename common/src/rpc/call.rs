use std::{
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::{
    frame::{decode, encode, Frame, FrameReader, FrameWriter},
    Status,
};

/// Counts the calls open on a channel so shutdown can wait for them.
#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle:  Notify,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> CallGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        CallGuard {
            in_flight: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Held by both halves of an outgoing call; the call stops counting as in
/// flight once both are dropped.
pub(crate) struct CallGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// Incoming messages of a call.
pub struct Streaming<T> {
    reader:   FrameReader,
    cancel:   CancellationToken,
    finished: bool,
    _guard:   Option<Arc<CallGuard>>,
    _message: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Streaming<T> {
    pub(crate) fn new(
        reader: FrameReader,
        cancel: CancellationToken,
        guard: Option<Arc<CallGuard>>,
    ) -> Self {
        Self {
            reader,
            cancel,
            finished: false,
            _guard: guard,
            _message: PhantomData,
        }
    }

    /// Next message, `Ok(None)` once the peer finished cleanly, or the status
    /// the call failed with.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        if self.finished {
            return Ok(None);
        }

        let frame = tokio::select! {
            () = self.cancel.cancelled() => {
                self.finished = true;
                return Err(Status::cancelled("call was cancelled"));
            }
            frame = self.reader.recv() => frame,
        };

        match frame {
            Ok(Some(Frame::Message(bytes))) => decode(&bytes).map(Some),
            Ok(Some(Frame::Status(status))) => {
                self.finished = true;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status)
                }
            }
            Ok(Some(Frame::Close)) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Some(Frame::Call { .. })) => {
                self.finished = true;
                Err(Status::internal("unexpected call frame inside a call"))
            }
            Ok(None) => {
                self.finished = true;
                Err(Status::unavailable("connection closed before the call completed"))
            }
            Err(e) => {
                self.finished = true;
                Err(Status::from_io(e))
            }
        }
    }
}

/// Outgoing messages of a call. Cloning shares the underlying connection.
pub struct Sink<T> {
    writer:   Arc<Mutex<FrameWriter>>,
    cancel:   CancellationToken,
    _guard:   Option<Arc<CallGuard>>,
    _message: PhantomData<fn(T)>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            writer:   Arc::clone(&self.writer),
            cancel:   self.cancel.clone(),
            _guard:   self._guard.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Serialize> Sink<T> {
    pub(crate) fn new(
        writer: Arc<Mutex<FrameWriter>>,
        cancel: CancellationToken,
        guard: Option<Arc<CallGuard>>,
    ) -> Self {
        Self {
            writer,
            cancel,
            _guard: guard,
            _message: PhantomData,
        }
    }

    pub async fn send(&self, message: &T) -> Result<(), Status> {
        let bytes = encode(message)?;
        self.write(Frame::Message(bytes)).await
    }

    /// Tell the peer no more messages follow.
    pub async fn close(&self) -> Result<(), Status> {
        self.write(Frame::Close).await
    }

    async fn write(&self, frame: Frame) -> Result<(), Status> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Status::cancelled("call was cancelled")),
            written = async { self.writer.lock().await.send(&frame).await } => {
                written.map_err(Status::from_io)
            }
        }
    }
}

/// A call received by a [`crate::rpc::Server`], handed to the matching
/// [`crate::rpc::Service`].
pub struct ServerCall {
    method: String,
    reader: FrameReader,
    writer: Arc<Mutex<FrameWriter>>,
    cancel: CancellationToken,
}

impl ServerCall {
    pub(crate) fn new(
        method: String,
        reader: FrameReader,
        writer: Arc<Mutex<FrameWriter>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method,
            reader,
            writer,
            cancel,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Fires when the serving [`crate::rpc::Server`] shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Split into the request stream and the response sink.
    pub fn into_streams<Req, Resp>(self) -> (Streaming<Req>, Sink<Resp>)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
    {
        let requests = Streaming::new(self.reader, self.cancel.clone(), None);
        let responses = Sink::new(self.writer, self.cancel, None);
        (requests, responses)
    }

    /// Serve a single-request, single-response call.
    pub async fn unary<Req, Resp, F, Fut>(self, handler: F) -> Result<(), Status>
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp, Status>>,
    {
        let method = self.method.clone();
        let (mut requests, responses) = self.into_streams::<Req, Resp>();
        let request = requests
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument(format!("{method} received no request")))?;
        let response = handler(request).await?;
        responses.send(&response).await
    }

    /// Serve a single-request call that streams its responses.
    pub async fn server_streaming<Req, Resp, F, Fut>(self, handler: F) -> Result<(), Status>
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: FnOnce(Req, Sink<Resp>) -> Fut,
        Fut: Future<Output = Result<(), Status>>,
    {
        let method = self.method.clone();
        let (mut requests, responses) = self.into_streams::<Req, Resp>();
        let request = requests
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument(format!("{method} received no request")))?;
        handler(request, responses).await
    }

    pub fn unimplemented(&self, service: &str) -> Status {
        Status::unimplemented(format!("{service} has no method {}", self.method))
    }
}
