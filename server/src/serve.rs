use std::sync::Arc;

use pluglink_common::{
    certs,
    config::{RPC_PROTOCOL, UNIX_NETWORK},
    generate_identity, Broker, BrokerService, MtlsConfig, PluginError, Service, TransportProvider,
    CORE_PROTOCOL_VERSION, DEFAULT_DIAL_TIMEOUT,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{HostEnvironment, PluginContext, ServeConfig},
    controller::ControllerService,
    stdio::StdioService,
};

/// Run a plugin process: check that a host launched it, negotiate a protocol
/// version, print the handshake line on stdout and serve until the host asks
/// it to exit or the process is interrupted.
pub async fn serve(config: ServeConfig) -> Result<(), PluginError> {
    let environment = HostEnvironment::from_env(&config.cookie_key);

    let shutdown = CancellationToken::new();
    let interrupted = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, shutting down");
            interrupted.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    serve_with(config, environment, &mut stdout, shutdown).await
}

/// [`serve`] with the environment, the handshake output and the shutdown
/// signal supplied by the caller.
pub async fn serve_with<W>(
    config: ServeConfig,
    environment: HostEnvironment,
    handshake_out: &mut W,
    shutdown: CancellationToken,
) -> Result<(), PluginError>
where
    W: AsyncWrite + Unpin,
{
    environment.check_cookie(&config)?;
    let version = config.negotiate(environment.protocol_versions.as_deref())?;

    let (mtls, certificate) = match environment.client_certificate.as_deref() {
        Some(pem) => {
            let host = certs::parse_pem_certificate(pem)?;
            let identity = generate_identity()?;
            let encoded = identity.encoded_certificate();
            tracing::debug!("Auto mTLS enabled, trusting host {}", certs::fingerprint(&host));
            (Some(MtlsConfig::new(vec![host], identity)), Some(encoded))
        }
        None => (None, None),
    };

    let transport = TransportProvider::new(mtls.as_ref())?;
    let broker = Broker::new(transport.clone(), DEFAULT_DIAL_TIMEOUT, shutdown.child_token());
    let (stdio, stdio_service) = StdioService::new();
    let context = PluginContext {
        broker: Arc::clone(&broker),
        stdio,
    };

    let mut services: Vec<Arc<dyn Service>> = vec![
        Arc::new(BrokerService::new(Arc::clone(&broker))),
        Arc::new(ControllerService::new(shutdown.clone())),
        Arc::new(stdio_service),
    ];
    if let Some(factories) = config.versions.get(&version) {
        services.extend(factories.iter().map(|factory| factory(&context)));
    }

    let server = transport.server(UNIX_NETWORK, services)?;
    let line = handshake_line(version, &server.address(), certificate.as_deref());
    handshake_out.write_all(line.as_bytes()).await?;
    handshake_out.flush().await?;
    tracing::info!("Serving protocol version {} at {}", version, server.address());

    shutdown.cancelled().await;
    server.shutdown().await;
    tracing::info!("Plugin stopped");
    Ok(())
}

fn handshake_line(version: u32, address: &str, certificate: Option<&str>) -> String {
    let mut line =
        format!("{CORE_PROTOCOL_VERSION}|{version}|{UNIX_NETWORK}|{address}|{RPC_PROTOCOL}");
    if let Some(certificate) = certificate {
        line.push('|');
        line.push_str(certificate);
    }
    line.push('\n');
    line
}
