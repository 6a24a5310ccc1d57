//! A counter whose arithmetic is done by the host: every increment dials back
//! into an adder the host serves over the broker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use pluglink_client::{Broker, Channel, Plugin, PluginError};
use pluglink_server::{PluginContext, ServerCall, Service, Status};
use serde::{Deserialize, Serialize};

pub const COUNTER_SERVICE: &str = "counter.Counter";
pub const ADDER_SERVICE: &str = "counter.Adder";

const ADDER_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementRequest {
    /// Broker id of the adder the host is serving for this call.
    pub adder_id: u32,
    pub key:      String,
    pub value:    i64,
}

/// Host-provided arithmetic.
pub trait Adder: Send + Sync + 'static {
    fn sum(&self, a: i64, b: i64) -> i64;
}

struct AdderService<A> {
    adder: Arc<A>,
}

impl<A: Adder> Service for AdderService<A> {
    fn name(&self) -> &'static str {
        ADDER_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            if call.method() != "Sum" {
                return Err(call.unimplemented(ADDER_SERVICE));
            }
            call.unary(|(a, b): (i64, i64)| async move { Ok(self.adder.sum(a, b)) })
                .await
        }
        .boxed()
    }
}

/// Plugin-side counter.
pub struct CounterService {
    broker: Arc<Broker>,
    totals: Mutex<HashMap<String, i64>>,
}

impl CounterService {
    pub fn new(context: &PluginContext) -> Arc<dyn Service> {
        Arc::new(Self {
            broker: Arc::clone(&context.broker),
            totals: Mutex::new(HashMap::new()),
        })
    }

    async fn increment(&self, request: IncrementRequest) -> Result<i64, Status> {
        let adder = self
            .broker
            .dial(request.adder_id)
            .await
            .map_err(|e| Status::unavailable(format!("cannot reach the host adder: {e}")))?;

        let current = self.total(&request.key);
        let total: Result<i64, Status> =
            adder.unary(ADDER_SERVICE, "Sum", &(current, request.value)).await;
        adder.shutdown(ADDER_CLOSE_TIMEOUT).await;
        let total = total?;

        self.totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request.key, total);
        Ok(total)
    }

    fn total(&self, key: &str) -> i64 {
        self.totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or_default()
    }
}

impl Service for CounterService {
    fn name(&self) -> &'static str {
        COUNTER_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            let method = call.method().to_owned();
            match method.as_str() {
                "Increment" => {
                    call.unary(|request: IncrementRequest| async move {
                        self.increment(request).await
                    })
                    .await
                }
                "Get" => {
                    call.unary(|key: String| async move { Ok(self.total(&key)) })
                        .await
                }
                _ => Err(call.unimplemented(COUNTER_SERVICE)),
            }
        }
        .boxed()
    }
}

/// Host-side registration of the counter.
pub struct CounterPlugin;

impl Plugin for CounterPlugin {
    type Client = CounterClient;

    fn client(&self, channel: Channel, broker: Arc<Broker>) -> CounterClient {
        CounterClient { channel, broker }
    }
}

#[derive(Debug, Clone)]
pub struct CounterClient {
    channel: Channel,
    broker:  Arc<Broker>,
}

impl CounterClient {
    /// Add `value` to `key`, letting the plugin call `adder` to do the sum.
    pub async fn increment<A: Adder>(
        &self,
        key: &str,
        value: i64,
        adder: Arc<A>,
    ) -> Result<i64, PluginError> {
        let adder_id = self.broker.get_next_id();
        let services: Vec<Arc<dyn Service>> = vec![Arc::new(AdderService { adder })];
        let server = self.broker.accept_and_serve(adder_id, services).await?;

        let request = IncrementRequest {
            adder_id,
            key: key.to_owned(),
            value,
        };
        let total: Result<i64, Status> =
            self.channel.unary(COUNTER_SERVICE, "Increment", &request).await;
        server.shutdown().await;
        Ok(total?)
    }

    pub async fn get(&self, key: &str) -> Result<i64, PluginError> {
        Ok(self.channel.unary(COUNTER_SERVICE, "Get", &key.to_owned()).await?)
    }
}
