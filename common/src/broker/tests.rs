use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::*;
use crate::test_support::{echo, ECHO_SERVICE};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn broker_with_timeout(dial_timeout: Duration) -> Arc<Broker> {
    let transport = TransportProvider::new(None).expect("transport provider");
    Broker::new(transport, dial_timeout, CancellationToken::new())
}

#[fixture]
fn broker() -> Arc<Broker> {
    broker_with_timeout(DEFAULT_DIAL_TIMEOUT)
}

fn info(service_id: u32) -> ConnectionInfo {
    ConnectionInfo {
        service_id,
        network: "unix".to_owned(),
        address: format!("/tmp/plugins-test/server-{service_id}"),
    }
}

/// A host broker whose control stream is served by a plugin-side broker over
/// a real socket.
struct Linked {
    host:   Arc<Broker>,
    plugin: Arc<Broker>,
    server: Server,
    tasks:  TaskTracker,
}

fn linked() -> Linked {
    let host = broker_with_timeout(DEFAULT_DIAL_TIMEOUT);
    let plugin = broker_with_timeout(DEFAULT_DIAL_TIMEOUT);

    let plugin_transport = TransportProvider::new(None).expect("plugin transport");
    let server = plugin_transport
        .server(
            "unix",
            vec![Arc::new(BrokerService::new(Arc::clone(&plugin)))],
        )
        .expect("broker server");
    let channel = host
        .transport
        .client_channel("unix", &server.address())
        .expect("channel to plugin");

    let tasks = TaskTracker::new();
    host.start(&channel, &tasks);
    Linked {
        host,
        plugin,
        server,
        tasks,
    }
}

#[rstest]
fn ids_start_at_one_and_increase(broker: Arc<Broker>) {
    assert_eq!(broker.get_next_id(), 1);
    assert_eq!(broker.get_next_id(), 2);
    assert_eq!(broker.get_next_id(), 3);
}

#[rstest]
#[tokio::test]
async fn dial_waits_for_a_later_announcement(broker: Arc<Broker>) {
    let dialer = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dial(7).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.announced(info(7));

    let channel = dialer
        .await
        .expect("dial task")
        .expect("dial resolves after the announcement");
    assert_eq!(channel.path().to_str(), Some(info(7).address.as_str()));
}

#[rstest]
#[tokio::test]
async fn dial_uses_an_earlier_announcement(broker: Arc<Broker>) {
    broker.announced(info(3));
    let channel = broker.dial(3).await.expect("dial");
    assert_eq!(channel.path().to_str(), Some(info(3).address.as_str()));
}

#[rstest]
#[tokio::test]
async fn concurrent_dials_share_one_entry(broker: Arc<Broker>) {
    let first = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dial(9).await })
    };
    let second = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dial(9).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.lock_state().pending.len(), 1);

    broker.announced(info(9));
    first.await.expect("first task").expect("first dial");
    second.await.expect("second task").expect("second dial");
}

#[rstest]
#[tokio::test]
async fn repeated_announcements_keep_the_first(broker: Arc<Broker>) {
    broker.announced(info(4));
    let mut moved = info(4);
    moved.address = "/tmp/elsewhere".to_owned();
    broker.announced(moved);

    let channel = broker.dial(4).await.expect("dial");
    assert_eq!(channel.path().to_str(), Some(info(4).address.as_str()));
}

#[tokio::test]
async fn dial_times_out_after_the_configured_timeout() {
    let timeout = Duration::from_millis(200);
    let broker = broker_with_timeout(timeout);

    let started = Instant::now();
    let Err(PluginError::DialTimeout {
        service_id,
        timeout: reported,
    }) = broker.dial(42).await
    else {
        panic!("dial without an announcement must time out");
    };
    assert!(started.elapsed() >= timeout);
    assert_eq!(service_id, 42);
    assert_eq!(reported, timeout);
}

#[rstest]
#[tokio::test]
async fn stream_failure_fails_pending_and_future_dials(broker: Arc<Broker>) {
    let pending = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dial(5).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.fail(Status::unavailable("plugin went away"));
    assert!(broker.is_failed());

    let Err(PluginError::BrokerService(status)) = pending.await.expect("dial task") else {
        panic!("pending dial must see the stream failure");
    };
    assert_eq!(status.message(), "plugin went away");

    let Err(err) = broker.dial(6).await else {
        panic!("later dials must fail too");
    };
    assert!(err.is_cancellation());

    let Err(err) = broker.accept_and_serve(7, echo()).await else {
        panic!("a failed broker cannot announce");
    };
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn cancelling_the_session_cancels_dials() {
    let cancel = CancellationToken::new();
    let transport = TransportProvider::new(None).expect("transport provider");
    let broker = Broker::new(transport, DEFAULT_DIAL_TIMEOUT, cancel.clone());

    let dialer = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dial(1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = tokio::time::timeout(TEST_TIMEOUT, dialer)
        .await
        .expect("dial returns promptly")
        .expect("dial task");
    let Err(PluginError::Cancelled { .. }) = result else {
        panic!("dial must report cancellation");
    };
}

#[tokio::test]
async fn host_services_are_reachable_from_the_plugin() {
    let linked = linked();
    let id = linked.host.get_next_id();
    let server = linked
        .host
        .accept_and_serve(id, echo())
        .await
        .expect("accept and serve");
    assert!(server.address().contains("plugins-"));

    let channel = linked.plugin.dial(id).await.expect("plugin dials host");
    let reply: String = channel
        .unary(ECHO_SERVICE, "Send", &"from plugin".to_owned())
        .await
        .expect("callback call");
    assert_eq!(reply, "[received] from plugin");

    server.shutdown().await;
}

#[tokio::test]
async fn plugin_services_are_reachable_from_the_host() {
    let linked = linked();
    let id = linked.plugin.get_next_id();

    // Dial first; the announcement arrives while the host is waiting.
    let dialer = {
        let host = Arc::clone(&linked.host);
        tokio::spawn(async move { host.dial(id).await })
    };
    let server = linked
        .plugin
        .accept_and_serve(id, echo())
        .await
        .expect("accept and serve");

    let channel = dialer.await.expect("dial task").expect("host dials plugin");
    let reply: String = channel
        .unary(ECHO_SERVICE, "Send", &"from host".to_owned())
        .await
        .expect("call into plugin");
    assert_eq!(reply, "[received] from host");

    server.shutdown().await;
}

#[tokio::test]
async fn accept_and_serve_fails_once_the_control_stream_is_gone() {
    let linked = linked();
    linked.server.shutdown().await;

    tokio::time::timeout(TEST_TIMEOUT, linked.host.failed())
        .await
        .expect("host notices the broken control stream");

    let id = linked.host.get_next_id();
    let Err(err) = linked.host.accept_and_serve(id, echo()).await else {
        panic!("announcement over a dead stream must fail");
    };
    assert!(err.is_cancellation());

    linked.tasks.close();
    tokio::time::timeout(TEST_TIMEOUT, linked.tasks.wait())
        .await
        .expect("control stream task exits");
}

#[tokio::test]
async fn control_stream_failure_when_plugin_has_no_broker() {
    let host = broker_with_timeout(DEFAULT_DIAL_TIMEOUT);
    let plugin_transport = TransportProvider::new(None).expect("plugin transport");
    let server = plugin_transport.server("unix", echo()).expect("server");
    let channel = host
        .transport
        .client_channel("unix", &server.address())
        .expect("channel");

    let tasks = TaskTracker::new();
    host.start(&channel, &tasks);
    tokio::time::timeout(TEST_TIMEOUT, host.failed())
        .await
        .expect("missing broker service fails the stream");

    let Err(PluginError::BrokerService(status)) = host.dial(1).await else {
        panic!("dial must surface the stream failure");
    };
    assert_eq!(status.code(), crate::rpc::Code::Unimplemented);
}
