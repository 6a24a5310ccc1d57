//! Services shared by the unit tests of this crate.

use std::sync::Arc;

use futures_util::{future::BoxFuture, FutureExt};

use crate::rpc::{ServerCall, Service, Sink, Status};

pub(crate) const ECHO_SERVICE: &str = "test.Echo";

/// Answers `Send` with the request prefixed, `Count` with the numbers up to
/// the request, and `Chat` by echoing every message of a bidi stream.
pub(crate) struct EchoService;

impl Service for EchoService {
    fn name(&self) -> &'static str {
        ECHO_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            let method = call.method().to_owned();
            match method.as_str() {
                "Send" => {
                    call.unary(|message: String| async move { Ok(format!("[received] {message}")) })
                        .await
                }
                "Count" => {
                    call.server_streaming(|up_to: u32, responses: Sink<u32>| async move {
                        for n in 1..=up_to {
                            responses.send(&n).await?;
                        }
                        Ok(())
                    })
                    .await
                }
                "Chat" => {
                    let (mut requests, responses) = call.into_streams::<String, String>();
                    while let Some(message) = requests.message().await? {
                        responses.send(&message.to_uppercase()).await?;
                    }
                    Ok(())
                }
                "Hang" => {
                    let cancelled = call.cancellation();
                    cancelled.cancelled().await;
                    Err(Status::cancelled("server shut down"))
                }
                _ => Err(call.unimplemented(ECHO_SERVICE)),
            }
        }
        .boxed()
    }
}

pub(crate) fn echo() -> Vec<Arc<dyn Service>> {
    vec![Arc::new(EchoService)]
}
