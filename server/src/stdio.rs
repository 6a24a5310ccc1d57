use std::sync::{Arc, Mutex};

use futures_util::{future::BoxFuture, FutureExt};
use pluglink_common::{
    config::{STDIO_SERVICE, STDIO_STREAM},
    Empty, ServerCall, Service, Sink, Status, StdioChannel, StdioData,
};
use tokio::sync::mpsc;

/// Handle for writing output that the host receives over its stdio stream.
#[derive(Debug, Clone)]
pub struct StdioWriter {
    chunks: mpsc::UnboundedSender<StdioData>,
}

impl StdioWriter {
    pub fn stdout(&self, data: impl Into<Vec<u8>>) {
        self.write(StdioChannel::Stdout, data.into());
    }

    pub fn stderr(&self, data: impl Into<Vec<u8>>) {
        self.write(StdioChannel::Stderr, data.into());
    }

    fn write(&self, channel: StdioChannel, data: Vec<u8>) {
        if self.chunks.send(StdioData { channel, data }).is_err() {
            tracing::debug!("Dropping {:?} output, the stdio stream is gone", channel);
        }
    }
}

/// Serves the output written through [`StdioWriter`] to the first host that
/// subscribes.
pub struct StdioService {
    chunks: Mutex<Option<mpsc::UnboundedReceiver<StdioData>>>,
}

impl StdioService {
    pub fn new() -> (StdioWriter, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StdioWriter { chunks: tx },
            Self {
                chunks: Mutex::new(Some(rx)),
            },
        )
    }

    fn take(&self) -> Option<mpsc::UnboundedReceiver<StdioData>> {
        self.chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Service for StdioService {
    fn name(&self) -> &'static str {
        STDIO_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            if call.method() != STDIO_STREAM {
                return Err(call.unimplemented(STDIO_SERVICE));
            }
            let Some(mut chunks) = self.take() else {
                return Err(Status::failed_precondition("stdio is already being streamed"));
            };
            let cancelled = call.cancellation();
            call.server_streaming(|_: Empty, output: Sink<StdioData>| async move {
                loop {
                    let chunk = tokio::select! {
                        () = cancelled.cancelled() => return Ok(()),
                        chunk = chunks.recv() => chunk,
                    };
                    let Some(chunk) = chunk else {
                        return Ok(());
                    };
                    output.send(&chunk).await?;
                }
            })
            .await
        }
        .boxed()
    }
}
