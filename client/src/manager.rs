use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use pluglink_common::{
    certs,
    config::{CLIENT_CERT_ENV, PROTOCOL_VERSIONS_ENV},
    generate_identity, Identity, MtlsConfig, PluginError, SocketDir, TransportProvider,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    sync::Mutex,
};
use uuid::Uuid;

use crate::{
    config::{ClientConfig, EncryptionMode},
    handshake::Handshake,
    plugin::PluginSet,
    session::{Session, SessionParts},
};

/// Longest handshake line read from a plugin, terminator included.
const MAX_HANDSHAKE_LEN: u64 = 64 * 1024;

/// Launches plugin subprocesses and keeps track of their sessions.
///
/// The manager owns the socket directory shared by every session it starts,
/// so dropping it after [`Manager::kill_all`] removes all socket files.
/// Dropping it without [`Manager::kill_all`] still stops every registered
/// plugin, without the graceful shutdown.
#[derive(Debug)]
pub struct Manager {
    sockets:  Arc<SocketDir>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl Manager {
    pub fn new() -> Result<Self, PluginError> {
        Ok(Self {
            sockets:  Arc::new(SocketDir::new()?),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the sockets of every session started here.
    pub fn socket_dir(&self) -> &Path {
        self.sockets.path()
    }

    /// Spawn the plugin described by `config`, complete the handshake and
    /// register the resulting session.
    pub async fn start(&self, config: ClientConfig) -> Result<Arc<Session>, PluginError> {
        let mut versions = config.resolve_plugins()?;

        let identity = match config.encryption_mode {
            EncryptionMode::AutoMtls => Some(generate_identity()?),
            EncryptionMode::Plaintext => None,
        };

        let name = plugin_name(&config.command);
        let mut child = spawn(&config, &versions, identity.as_ref())?;
        tracing::debug!("Spawned plugin {} (pid {:?})", name, child.id());

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                abandon(&mut child, &name);
                return Err(PluginError::configuration("plugin stdio was not captured"));
            }
        };

        let negotiated = async {
            let (line, stdout) = read_handshake(stdout, config.start_timeout).await?;
            let handshake = Handshake::parse(&line)?;
            let plugins = negotiate(&mut versions, handshake.plugin_version)?;
            let transport = self.transport_for(&handshake, identity)?;
            Ok::<_, PluginError>((handshake, plugins, transport, stdout))
        }
        .await;

        let (handshake, plugins, transport, stdout) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!("Plugin {} failed to start: {}", name, e);
                abandon(&mut child, &name);
                return Err(e);
            }
        };

        let session = Session::start(SessionParts {
            name,
            child,
            stdout,
            stderr,
            handshake,
            plugins,
            transport,
            stdio_mode: config.stdio_mode,
            dial_timeout: config.dial_timeout,
            close_timeout: config.close_timeout,
        })?;

        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| session.is_alive());
        sessions.insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    /// Kill every registered session concurrently and forget them.
    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        tracing::debug!("Killing {} plugin session(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.kill())).await;
    }

    /// Registered sessions, including ones killed individually since the
    /// last [`Manager::start`].
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn transport_for(
        &self,
        handshake: &Handshake,
        identity: Option<Identity>,
    ) -> Result<TransportProvider, PluginError> {
        let Some(identity) = identity else {
            return TransportProvider::with_socket_dir(Arc::clone(&self.sockets), None);
        };
        let Some(server_certificate) = handshake.server_certificate.clone() else {
            return Err(PluginError::MissingServerCertificate);
        };
        tracing::debug!(
            "Pinning plugin certificate {}",
            certs::fingerprint(&server_certificate)
        );
        let mtls = MtlsConfig::new(vec![server_certificate], identity);
        TransportProvider::with_socket_dir(Arc::clone(&self.sockets), Some(&mtls))
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for session in self.sessions.get_mut().values() {
            session.abandon();
        }
    }
}

fn spawn(
    config: &ClientConfig,
    versions: &BTreeMap<u32, PluginSet>,
    identity: Option<&Identity>,
) -> Result<Child, PluginError> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| PluginError::configuration("plugin command is empty"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .env(
            &config.handshake.magic_cookie_key,
            &config.handshake.magic_cookie_value,
        )
        .env(PROTOCOL_VERSIONS_ENV, version_list(versions.keys().copied()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(identity) = identity {
        command.env(CLIENT_CERT_ENV, identity.certificate_pem());
    }

    command.spawn().map_err(|e| PluginError::Spawn {
        command: config.command.join(" "),
        source:  Arc::new(e),
    })
}

/// Ascending, comma separated.
fn version_list(versions: impl IntoIterator<Item = u32>) -> String {
    let mut versions: Vec<u32> = versions.into_iter().collect();
    versions.sort_unstable();
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

async fn read_handshake(
    stdout: ChildStdout,
    timeout: Duration,
) -> Result<(String, BufReader<ChildStdout>), PluginError> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let read = tokio::time::timeout(
        timeout,
        (&mut reader).take(MAX_HANDSHAKE_LEN).read_line(&mut line),
    )
    .await
    .map_err(|_| PluginError::StartupTimeout { timeout })??;
    if read == 0 {
        return Err(PluginError::parse(
            "plugin exited before printing its handshake line",
        ));
    }
    if read as u64 == MAX_HANDSHAKE_LEN && !line.ends_with('\n') {
        return Err(PluginError::parse(format!(
            "handshake line exceeds {MAX_HANDSHAKE_LEN} bytes"
        )));
    }
    Ok((line, reader))
}

fn negotiate(
    versions: &mut BTreeMap<u32, PluginSet>,
    version: u32,
) -> Result<PluginSet, PluginError> {
    versions
        .remove(&version)
        .ok_or_else(|| PluginError::Negotiation {
            version,
            available: versions.keys().copied().collect(),
        })
}

fn plugin_name(command: &[String]) -> String {
    command
        .first()
        .map(|program| {
            Path::new(program)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.clone())
        })
        .unwrap_or_default()
}

/// The plugin never became usable; make sure it does not linger.
fn abandon(child: &mut Child, plugin: &str) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Failed to kill plugin {}: {}", plugin, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, time::Instant};

    use pluglink_common::{Broker, Channel};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::{config::HandshakeConfig, plugin::Plugin};

    struct Noop;
    struct NoopClient;

    impl Plugin for Noop {
        type Client = NoopClient;

        fn client(&self, _channel: Channel, _broker: Arc<Broker>) -> NoopClient {
            NoopClient
        }
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("plugin.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn config(path: &Path) -> ClientConfig {
        ClientConfig::new(
            [path.display().to_string()],
            HandshakeConfig::new("PLUGLINK_TEST_COOKIE", "s3cret"),
        )
        .with_versioned_plugins(3, PluginSet::new().with(Noop))
        .with_versioned_plugins(1, PluginSet::new().with(Noop))
        .with_versioned_plugins(2, PluginSet::new().with(Noop))
        .with_start_timeout(Duration::from_secs(5))
        .with_close_timeout(Duration::from_millis(200))
    }

    #[test]
    fn version_lists_are_ascending() {
        assert_eq!(version_list([3, 1, 2]), "1,2,3");
        assert_eq!(version_list([7]), "7");
    }

    #[test]
    fn negotiation_lists_available_versions() {
        let mut versions = BTreeMap::from([
            (2, PluginSet::new().with(Noop)),
            (1, PluginSet::new().with(Noop)),
        ]);
        let Err(PluginError::Negotiation { version, available }) = negotiate(&mut versions, 5)
        else {
            panic!("version 5 must not negotiate");
        };
        assert_eq!(version, 5);
        assert_eq!(available, vec![1, 2]);
        assert!(negotiate(&mut versions, 2).is_ok());
    }

    #[rstest]
    #[case(&["/usr/local/bin/kv-plugin", "--flag"], "kv-plugin")]
    #[case(&["plugin"], "plugin")]
    fn plugin_names_are_basenames(#[case] command: &[&str], #[case] expected: &str) {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        assert_eq!(plugin_name(&command), expected);
    }

    #[tokio::test]
    async fn environment_reaches_the_plugin() {
        let dir = TempDir::new().expect("tempdir");
        // Fails the handshake with whatever it saw, so the error carries it.
        let path = script(
            &dir,
            "echo \"$PLUGLINK_TEST_COOKIE:$PLUGIN_PROTOCOL_VERSIONS:${PLUGIN_CLIENT_CERT:-none}\"",
        );
        let manager = Manager::new().expect("manager");

        let Err(PluginError::Parse { message }) = manager.start(config(&path)).await else {
            panic!("an echo is not a handshake");
        };
        assert!(message.contains("s3cret:1,2,3:none"), "{message}");
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn silent_plugins_time_out() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "sleep 30");
        let manager = Manager::new().expect("manager");

        let started = Instant::now();
        let result = manager
            .start(config(&path).with_start_timeout(Duration::from_millis(200)))
            .await;
        let Err(PluginError::StartupTimeout { timeout }) = result else {
            panic!("expected a startup timeout");
        };
        assert_eq!(timeout, Duration::from_millis(200));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn plugins_exiting_early_fail_to_parse() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "exit 1");
        let manager = Manager::new().expect("manager");

        let Err(PluginError::Parse { .. }) = manager.start(config(&path)).await else {
            panic!("expected a parse error");
        };
    }

    #[tokio::test]
    async fn oversized_handshake_lines_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "yes | tr -d '\\n'");
        let manager = Manager::new().expect("manager");

        let result = manager
            .start(config(&path).with_start_timeout(Duration::from_secs(10)))
            .await;
        let Err(PluginError::Parse { message }) = result else {
            panic!("expected a parse error");
        };
        assert!(message.contains("exceeds"));
    }

    #[rstest]
    #[case::core_version("2|1|unix|/tmp/sock|grpc")]
    #[case::transport("1|1|tcp|127.0.0.1:1234|grpc")]
    #[case::protocol("1|1|unix|/tmp/sock|netrpc")]
    #[tokio::test]
    async fn invalid_handshakes_are_rejected(#[case] line: &str) {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, &format!("echo '{line}'"));
        let manager = Manager::new().expect("manager");

        assert!(manager.start(config(&path)).await.is_err());
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_plugin_versions_fail_negotiation() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "echo '1|9|unix|/tmp/sock|grpc'");
        let manager = Manager::new().expect("manager");

        let Err(PluginError::Negotiation { version, available }) =
            manager.start(config(&path)).await
        else {
            panic!("expected a negotiation error");
        };
        assert_eq!(version, 9);
        assert_eq!(available, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn auto_mtls_requires_a_plugin_certificate() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "echo '1|1|unix|/tmp/sock|grpc'");
        let manager = Manager::new().expect("manager");

        let result = manager
            .start(config(&path).with_encryption_mode(EncryptionMode::AutoMtls))
            .await;
        let Err(PluginError::MissingServerCertificate) = result else {
            panic!("expected a missing certificate error");
        };
    }

    #[tokio::test]
    async fn configuration_errors_spawn_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("spawned");
        let path = script(&dir, &format!("touch {}", marker.display()));
        let manager = Manager::new().expect("manager");

        let config = ClientConfig::new(
            [path.display().to_string()],
            HandshakeConfig::new("PLUGLINK_TEST_COOKIE", "s3cret"),
        );
        let Err(PluginError::Configuration { .. }) = manager.start(config).await else {
            panic!("expected a configuration error");
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_executables_fail_to_spawn() {
        let manager = Manager::new().expect("manager");
        let config = config(Path::new("/nonexistent/pluglink-plugin"));
        let Err(PluginError::Spawn { command, .. }) = manager.start(config).await else {
            panic!("expected a spawn error");
        };
        assert_eq!(command, "/nonexistent/pluglink-plugin");
    }

    #[tokio::test]
    async fn sessions_register_and_kill_once() {
        let dir = TempDir::new().expect("tempdir");
        // Announces a socket nobody listens on: the session starts, its
        // streams fail and kill still completes.
        let path = script(&dir, "echo '1|2|unix|/nonexistent/sock|grpc'; sleep 30");
        let manager = Manager::new().expect("manager");

        let session = manager.start(config(&path)).await.expect("start");
        assert!(session.is_alive());
        assert_eq!(session.handshake().plugin_version, 2);
        assert_eq!(manager.session_count().await, 1);
        assert!(session.dispense::<NoopClient>().is_ok());

        tokio::join!(session.kill(), session.kill());
        assert!(!session.is_alive());
        session.kill().await;

        manager.kill_all().await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn dropping_the_manager_stops_its_plugins() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("survived");
        let path = script(
            &dir,
            &format!(
                "echo '1|1|unix|/nonexistent/sock|grpc'; sleep 1; touch {}",
                marker.display()
            ),
        );
        let manager = Manager::new().expect("manager");
        let session = manager.start(config(&path)).await.expect("start");

        drop(manager);
        assert!(!session.is_alive());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn cancelled_starts_stop_the_plugin() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("survived");
        let path = script(&dir, &format!("sleep 1; touch {}", marker.display()));
        let manager = Manager::new().expect("manager");

        let start = manager.start(config(&path).with_start_timeout(Duration::from_secs(10)));
        assert!(tokio::time::timeout(Duration::from_millis(200), start)
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn kill_all_stops_every_session() {
        let dir = TempDir::new().expect("tempdir");
        let path = script(&dir, "echo '1|1|unix|/nonexistent/sock|grpc'; sleep 30");
        let manager = Manager::new().expect("manager");

        let first = manager.start(config(&path)).await.expect("start first");
        let second = manager.start(config(&path)).await.expect("start second");
        assert_eq!(manager.session_count().await, 2);

        manager.kill_all().await;
        assert!(!first.is_alive());
        assert!(!second.is_alive());
        assert_eq!(manager.session_count().await, 0);
    }
}
