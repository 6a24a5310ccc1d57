//! Callback broker: lets either side of a session stand up extra RPC servers
//! and lets the other side dial them by numeric service id.
//!
//! Both ends hold a [`Broker`]. Announcements of new endpoints travel over a
//! single bidirectional control stream (`plugin.GRPCBroker/StartStream`);
//! the host opens it with [`Broker::start`] and the plugin serves it with
//! [`BrokerService`].

mod pending;

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use self::pending::PendingDial;
use crate::{
    config::{ConnectionInfo, BROKER_SERVICE, BROKER_START_STREAM, UNIX_NETWORK},
    error::PluginError,
    rpc::{Channel, Server, ServerCall, Service, Sink, Status, Streaming},
    transport::TransportProvider,
};

/// How long [`Broker::dial`] waits for an announcement by default.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);

const ANNOUNCEMENT_QUEUE: usize = 16;

struct Announcement {
    info:      ConnectionInfo,
    delivered: oneshot::Sender<()>,
}

#[derive(Default)]
struct BrokerState {
    pending: HashMap<u32, PendingDial>,
    failure: Option<Status>,
}

pub struct Broker {
    next_id:      AtomicU32,
    transport:    TransportProvider,
    dial_timeout: Duration,
    cancel:       CancellationToken,
    state:        Mutex<BrokerState>,
    outbound:     mpsc::Sender<Announcement>,
    outbound_rx:  Mutex<Option<mpsc::Receiver<Announcement>>>,
    failed:       CancellationToken,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("dial_timeout", &self.dial_timeout)
            .field("failed", &self.failed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// A broker whose servers and channels come from `transport`. Cancelling
    /// `cancel` tears down the control stream and every waiting dial.
    pub fn new(
        transport: TransportProvider,
        dial_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(ANNOUNCEMENT_QUEUE);
        Arc::new(Self {
            next_id: AtomicU32::new(0),
            transport,
            dial_timeout,
            cancel,
            state: Mutex::new(BrokerState::default()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            failed: CancellationToken::new(),
        })
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// A fresh service id, unique for this broker. The first id is 1.
    pub fn get_next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start hosting `services` under `service_id` and announce the endpoint
    /// to the peer. Returns once the announcement has been written to the
    /// control stream; if it cannot be delivered the new server is shut down
    /// and the call fails with a cancellation.
    pub async fn accept_and_serve(
        &self,
        service_id: u32,
        services: Vec<Arc<dyn Service>>,
    ) -> Result<Server, PluginError> {
        if let Some(status) = self.failure() {
            return Err(PluginError::BrokerService(status));
        }

        let server = self.transport.server(UNIX_NETWORK, services)?;
        tracing::debug!("Service #{} has started at {}", service_id, server.address());

        let (delivered, receipt) = oneshot::channel();
        let announcement = Announcement {
            info: ConnectionInfo {
                service_id,
                network: UNIX_NETWORK.to_owned(),
                address: server.address(),
            },
            delivered,
        };

        let announce = async {
            self.outbound.send(announcement).await.ok()?;
            receipt.await.ok()
        };
        let announced = tokio::select! {
            () = self.cancel.cancelled() => None,
            announced = announce => announced,
        };

        if announced.is_none() {
            server.shutdown().await;
            return Err(match self.failure() {
                Some(status) => PluginError::BrokerService(status),
                None => PluginError::cancelled(format!(
                    "announcement of service #{service_id} was not delivered"
                )),
            });
        }
        Ok(server)
    }

    /// Connect to the endpoint the peer announced for `service_id`, waiting up
    /// to the dial timeout for the announcement if it has not arrived yet.
    pub async fn dial(&self, service_id: u32) -> Result<Channel, PluginError> {
        tracing::debug!("Dialing service #{}", service_id);
        let mut slot = self.pending_entry(service_id);

        let waited = tokio::select! {
            () = self.cancel.cancelled() => {
                return Err(PluginError::cancelled(format!(
                    "dial of service #{service_id} was cancelled"
                )));
            }
            waited = tokio::time::timeout(self.dial_timeout, slot.wait_for(Option::is_some)) => waited,
        };

        let outcome = match waited {
            Err(_elapsed) => {
                return Err(PluginError::DialTimeout {
                    service_id,
                    timeout: self.dial_timeout,
                })
            }
            Ok(Err(_closed)) => None,
            Ok(Ok(resolved)) => (*resolved).clone(),
        };

        match outcome {
            Some(Ok(info)) => self.transport.client_channel(&info.network, &info.address),
            Some(Err(status)) => Err(PluginError::BrokerService(status)),
            None => Err(PluginError::cancelled(format!(
                "dial of service #{service_id} was abandoned"
            ))),
        }
    }

    /// Open the control stream on the plugin's main channel and run it on
    /// `tasks` until it fails or the broker is cancelled.
    pub fn start(self: &Arc<Self>, channel: &Channel, tasks: &TaskTracker) {
        let broker = Arc::clone(self);
        let channel = channel.clone();
        tasks.spawn(async move {
            let opened = tokio::select! {
                () = broker.cancel.cancelled() => return,
                opened = channel.bidi_streaming::<ConnectionInfo, ConnectionInfo>(
                    BROKER_SERVICE,
                    BROKER_START_STREAM,
                ) => opened,
            };
            let result = match opened {
                Ok((sink, stream)) => broker.serve_control_stream(sink, stream).await,
                Err(status) => {
                    broker.fail(status.clone());
                    Err(status)
                }
            };
            if let Err(status) = result {
                tracing::debug!("Broker control stream ended: {}", status);
            }
        });
    }

    /// Resolves once the control stream has failed.
    pub async fn failed(&self) {
        self.failed.cancelled().await;
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Pump both directions of an established control stream.
    pub(crate) async fn serve_control_stream(
        &self,
        sink: Sink<ConnectionInfo>,
        mut inbound: Streaming<ConnectionInfo>,
    ) -> Result<(), Status> {
        let Some(mut outbound) = self.take_outbound() else {
            return Err(Status::failed_precondition(
                "broker control stream is already established",
            ));
        };

        let send_loop = async {
            while let Some(announcement) = outbound.recv().await {
                sink.send(&announcement.info).await?;
                let _ = announcement.delivered.send(());
            }
            Ok::<(), Status>(())
        };
        let recv_loop = async {
            while let Some(info) = inbound.message().await? {
                self.announced(info);
            }
            Err::<(), Status>(Status::unavailable("broker control stream closed by peer"))
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(Status::cancelled("session is shutting down")),
            sent = send_loop => sent,
            received = recv_loop => received,
        };
        if let Err(status) = &result {
            self.fail(status.clone());
        }
        result
    }

    /// Record the peer's endpoint for `info.service_id`, completing a waiting
    /// dial or leaving a resolved entry for a later one.
    pub(crate) fn announced(&self, info: ConnectionInfo) {
        tracing::debug!(
            "Received connection info for service #{}: {}",
            info.service_id,
            info.address
        );
        let mut state = self.lock_state();
        match state.pending.entry(info.service_id) {
            Entry::Occupied(entry) => {
                if !entry.get().resolve(Ok(info)) {
                    tracing::warn!("Ignoring repeated announcement for service #{}", entry.key());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingDial::resolved(Ok(info)));
            }
        }
    }

    /// Mark the control stream as failed and fail every pending dial.
    pub(crate) fn fail(&self, status: Status) {
        let mut state = self.lock_state();
        if state.failure.is_some() {
            return;
        }
        for pending in state.pending.values() {
            pending.resolve(Err(status.clone()));
        }
        state.failure = Some(status);
        drop(state);
        self.failed.cancel();
    }

    fn failure(&self) -> Option<Status> {
        self.lock_state().failure.clone()
    }

    fn pending_entry(&self, service_id: u32) -> tokio::sync::watch::Receiver<pending::Outcome> {
        let mut state = self.lock_state();
        let failure = state.failure.clone();
        state
            .pending
            .entry(service_id)
            .or_insert_with(|| match failure {
                Some(status) => PendingDial::resolved(Err(status)),
                None => PendingDial::new(),
            })
            .subscribe()
    }

    fn take_outbound(&self) -> Option<mpsc::Receiver<Announcement>> {
        self.outbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Plugin-side endpoint of the broker control stream.
pub struct BrokerService {
    broker: Arc<Broker>,
}

impl BrokerService {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

impl Service for BrokerService {
    fn name(&self) -> &'static str {
        BROKER_SERVICE
    }

    fn call(self: Arc<Self>, call: ServerCall) -> BoxFuture<'static, Result<(), Status>> {
        async move {
            if call.method() != BROKER_START_STREAM {
                return Err(call.unimplemented(BROKER_SERVICE));
            }
            let (inbound, sink) = call.into_streams::<ConnectionInfo, ConnectionInfo>();
            self.broker.serve_control_stream(sink, inbound).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests;
