//! End-to-end sessions between a host and the `fake-plugin` binary.

use std::{
    fs,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use fake_plugin::{handshake, plugins, Adder, CounterClient, KvClient};
use pluglink_client::{ClientConfig, Code, EncryptionMode, Manager, PluginError, StdioMode};
use rstest::rstest;
use tokio::io::AsyncWrite;

fn config(versions: &[u32]) -> ClientConfig {
    versions.iter().fold(
        ClientConfig::new([env!("CARGO_BIN_EXE_fake-plugin")], handshake())
            .with_start_timeout(Duration::from_secs(10))
            .with_close_timeout(Duration::from_secs(2)),
        |config, version| config.with_versioned_plugins(*version, plugins(*version)),
    )
}

fn socket_files(manager: &Manager) -> usize {
    fs::read_dir(manager.socket_dir())
        .expect("socket dir")
        .count()
}

/// Adds and counts how often the plugin called back.
#[derive(Default)]
struct CountingAdder {
    calls: AtomicUsize,
}

impl Adder for CountingAdder {
    fn sum(&self, a: i64, b: i64) -> i64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        a + b
    }
}

/// Writer that appends into shared memory.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned()
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

#[rstest]
#[case::plaintext(EncryptionMode::Plaintext)]
#[case::auto_mtls(EncryptionMode::AutoMtls)]
#[tokio::test]
async fn put_then_get_round_trips(#[case] encryption: EncryptionMode) {
    let manager = Manager::new().expect("manager");
    let session = manager
        .start(config(&[1, 2]).with_encryption_mode(encryption))
        .await
        .expect("start plugin");
    assert_eq!(session.handshake().plugin_version, 2);
    assert_eq!(
        session.channel().is_secure(),
        encryption == EncryptionMode::AutoMtls
    );

    let kv = session.dispense::<KvClient>().expect("kv client");
    kv.put("hello", b"world").await.expect("put");
    assert_eq!(kv.get("hello").await.expect("get"), b"world");

    let Err(status) = kv.get("missing").await else {
        panic!("missing keys are not found");
    };
    assert_eq!(status.code(), Code::NotFound);

    session.kill().await;
    assert!(!session.is_alive());
    assert_eq!(session.transport().live_handles(), 0);
    assert_eq!(socket_files(&manager), 0);
}

#[rstest]
#[case::plaintext(EncryptionMode::Plaintext)]
#[case::auto_mtls(EncryptionMode::AutoMtls)]
#[tokio::test]
async fn counter_calls_back_into_the_host(#[case] encryption: EncryptionMode) {
    let manager = Manager::new().expect("manager");
    let session = manager
        .start(config(&[1, 2]).with_encryption_mode(encryption))
        .await
        .expect("start plugin");

    let counter = session.dispense::<CounterClient>().expect("counter client");
    let adder = Arc::new(CountingAdder::default());
    assert_eq!(counter.increment("visits", 5, Arc::clone(&adder)).await.expect("first"), 5);
    assert_eq!(counter.increment("visits", 7, Arc::clone(&adder)).await.expect("second"), 12);
    assert_eq!(counter.get("visits").await.expect("get"), 12);
    assert_eq!(adder.calls.load(Ordering::SeqCst), 2);

    // Callback servers are gone once each increment returns.
    assert_eq!(socket_files(&manager), 0);

    manager.kill_all().await;
    assert!(!session.is_alive());
    assert_eq!(session.transport().live_handles(), 0);
}

#[tokio::test]
async fn older_versions_only_dispense_what_they_negotiated() {
    let manager = Manager::new().expect("manager");
    let session = manager.start(config(&[1])).await.expect("start plugin");
    assert_eq!(session.handshake().plugin_version, 1);

    assert!(session.dispense::<KvClient>().is_ok());
    let Err(PluginError::NotFound { capability }) = session.dispense::<CounterClient>() else {
        panic!("the counter is not served at version 1");
    };
    assert!(capability.contains("CounterClient"));

    manager.kill_all().await;
}

#[tokio::test]
async fn relayed_stdout_reaches_piped_sinks() {
    let stdout = Captured::default();
    let stderr = Captured::default();
    let manager = Manager::new().expect("manager");
    let session = manager
        .start(config(&[1]).with_stdio_mode(StdioMode::Pipe {
            stdout: Box::new(stdout.clone()),
            stderr: Box::new(stderr.clone()),
        }))
        .await
        .expect("start plugin");

    let kv = session.dispense::<KvClient>().expect("kv client");
    kv.put("piped", b"1").await.expect("put");

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stdout.text().contains("stored piped") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relayed output in time");
    assert!(stderr.text().is_empty());

    manager.kill_all().await;
}

#[tokio::test]
async fn dropping_the_manager_stops_the_plugin() {
    let manager = Manager::new().expect("manager");
    let session = manager.start(config(&[1, 2])).await.expect("start plugin");
    let address = session.handshake().address.clone();
    assert!(tokio::net::UnixStream::connect(&address).await.is_ok());

    drop(session);
    drop(manager);

    tokio::time::timeout(Duration::from_secs(5), async {
        while tokio::net::UnixStream::connect(&address).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("plugin socket stops accepting connections");
}

#[tokio::test]
async fn concurrent_kills_tear_down_once() {
    let manager = Manager::new().expect("manager");
    let first = manager.start(config(&[1, 2])).await.expect("start first");
    let second = manager.start(config(&[1, 2])).await.expect("start second");
    assert_eq!(manager.session_count().await, 2);

    tokio::join!(first.kill(), first.kill(), manager.kill_all());
    assert!(!first.is_alive());
    assert!(!second.is_alive());
    assert_eq!(manager.session_count().await, 0);

    let kv = first.dispense::<KvClient>().expect("kv client");
    assert!(kv.get("anything").await.is_err());
}
