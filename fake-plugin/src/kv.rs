use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures_util::{future::BoxFuture, FutureExt};
use pluglink_client::{Broker, Channel, Plugin};
use pluglink_common::Empty;
use pluglink_server::{PluginContext, ServerCall, Service, Status, StdioWriter};
use serde::{Deserialize, Serialize};

pub const KV_SERVICE: &str = "kv.KV";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key:   String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

/// In-memory store served by the plugin. Every put is echoed on the relayed
/// stdout.
pub struct KvService {
    values: Mutex<HashMap<String, Vec<u8>>>,
    stdio:  StdioWriter,
}

impl KvService {
    pub fn new(context: &PluginContext) -> Arc<dyn Service> {
        Arc::new(Self {
            values: Mutex::new(HashMap::new()),
            stdio:  context.stdio.clone(),
        })
    }

    fn put(&self, request: PutRequest) {
        tracing::debug!("put {}", request.key);
        self.stdio.stdout(format!("stored {}\n", request.key));
        self.lock().insert(request.key, request.value);
    }

    fn get(&self, request: &GetRequest) -> Result<Vec<u8>, Status> {
        self.lock()
            .get(&request.key)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no value for {:?}", request.key)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Service for KvService {
    fn name(&self) -> &'static str {
        KV_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            let method = call.method().to_owned();
            match method.as_str() {
                "Put" => {
                    call.unary(|request: PutRequest| async move {
                        self.put(request);
                        Ok(Empty {})
                    })
                    .await
                }
                "Get" => {
                    call.unary(|request: GetRequest| async move { self.get(&request) })
                        .await
                }
                _ => Err(call.unimplemented(KV_SERVICE)),
            }
        }
        .boxed()
    }
}

/// Host-side registration of the store.
pub struct KvPlugin;

impl Plugin for KvPlugin {
    type Client = KvClient;

    fn client(&self, channel: Channel, _broker: Arc<Broker>) -> KvClient {
        KvClient { channel }
    }
}

#[derive(Debug, Clone)]
pub struct KvClient {
    channel: Channel,
}

impl KvClient {
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), Status> {
        let request = PutRequest {
            key:   key.to_owned(),
            value: value.to_vec(),
        };
        let _: Empty = self.channel.unary(KV_SERVICE, "Put", &request).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, Status> {
        let request = GetRequest {
            key: key.to_owned(),
        };
        self.channel.unary(KV_SERVICE, "Get", &request).await
    }
}
