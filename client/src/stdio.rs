use pluglink_common::{
    config::{STDIO_SERVICE, STDIO_STREAM},
    Channel, Empty, Status, StdioChannel, StdioData,
};
use tokio::io::AsyncWriteExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{config::StdioMode, logs::log_plugin_line};

/// Subscribe to the plugin's relayed stdout/stderr and handle it per `mode`
/// until the stream ends or `cancel` fires.
pub(crate) fn start(
    channel: Channel,
    mode: StdioMode,
    plugin: String,
    tasks: &TaskTracker,
    cancel: CancellationToken,
) {
    tasks.spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            relayed = relay(&channel, mode, &plugin) => {
                if let Err(status) = relayed {
                    tracing::debug!("Stdio stream of {} ended: {}", plugin, status);
                }
            }
        }
    });
}

async fn relay(channel: &Channel, mut mode: StdioMode, plugin: &str) -> Result<(), Status> {
    let mut chunks = channel
        .server_streaming::<Empty, StdioData>(STDIO_SERVICE, STDIO_STREAM, &Empty {})
        .await?;
    while let Some(chunk) = chunks.message().await? {
        handle(&mut mode, plugin, chunk).await;
    }
    Ok(())
}

async fn handle(mode: &mut StdioMode, plugin: &str, chunk: StdioData) {
    match mode {
        StdioMode::Discard => {}
        StdioMode::Log => {
            let text = String::from_utf8_lossy(&chunk.data);
            for line in text.lines().filter(|line| !line.is_empty()) {
                log_plugin_line(plugin, line);
            }
        }
        StdioMode::Pipe { stdout, stderr } => {
            let sink = match chunk.channel {
                StdioChannel::Stdout => stdout,
                StdioChannel::Stderr => stderr,
            };
            let written = async {
                sink.write_all(&chunk.data).await?;
                sink.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!("Failed to forward {:?} of {}: {}", chunk.channel, plugin, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    };

    use tokio::io::AsyncWrite;

    use super::*;

    /// Writer that appends into shared memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().expect("lock").clone()
        }
    }

    impl AsyncWrite for Captured {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn chunk(channel: StdioChannel, data: &str) -> StdioData {
        StdioData {
            channel,
            data: data.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn pipe_mode_routes_by_channel() {
        let out = Captured::default();
        let err = Captured::default();
        let mut mode = StdioMode::Pipe {
            stdout: Box::new(out.clone()),
            stderr: Box::new(err.clone()),
        };

        handle(&mut mode, "test", chunk(StdioChannel::Stdout, "hello ")).await;
        handle(&mut mode, "test", chunk(StdioChannel::Stderr, "oops")).await;
        handle(&mut mode, "test", chunk(StdioChannel::Stdout, "world")).await;

        assert_eq!(out.contents(), b"hello world");
        assert_eq!(err.contents(), b"oops");
    }

    #[tokio::test]
    async fn discard_and_log_modes_accept_any_output() {
        let mut discard = StdioMode::Discard;
        handle(&mut discard, "test", chunk(StdioChannel::Stdout, "ignored")).await;

        let mut log = StdioMode::Log;
        handle(&mut log, "test", chunk(StdioChannel::Stderr, "line one\nline two\n")).await;
    }
}
