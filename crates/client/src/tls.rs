//! TLS-wrapped upstream transport
//!
//! When `over_tls_enable` is set, the raw outgoing socket is not used.
//! A transport task owns the TCP connection and the rustls session, and
//! drives the tunnel through three callbacks: connection established,
//! data received, and shutting down. Outbound payloads flow the other
//! way over a bounded channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use veiltunnel_core::{Config, SSR_BUFF_SIZE};

/// Callback events the transport raises toward the stage machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsEvent {
    /// TLS handshake completed; the session is ready for the first package.
    Established,
    /// Decoded application bytes arrived from the server.
    Data(Bytes),
    /// The transport is going away; tear the tunnel down.
    ShuttingDown,
}

/// Driver-side handle to a running transport task.
pub(crate) struct TlsHandle {
    pub events: mpsc::Receiver<TlsEvent>,
    pub outbound: mpsc::Sender<Bytes>,
}

/// Build the process-wide TLS client configuration, trusting the
/// Mozilla root CA bundle. Cloning shares the root store.
fn client_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Launch the transport task for one tunnel.
pub(crate) fn launch(tunnel_id: u64, config: &Config) -> TlsHandle {
    let (event_tx, event_rx) = mpsc::channel(32);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(32);

    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;
    let server_name = config.tls_server_name().to_string();
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

    tokio::spawn(async move {
        run_transport(
            tunnel_id,
            remote_host,
            remote_port,
            server_name,
            connect_timeout,
            event_tx,
            out_rx,
        )
        .await;
    });

    TlsHandle {
        events: event_rx,
        outbound: out_tx,
    }
}

async fn run_transport(
    tunnel_id: u64,
    remote_host: String,
    remote_port: u16,
    server_name: String,
    connect_timeout: Duration,
    events: mpsc::Sender<TlsEvent>,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let stream = match tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((remote_host.as_str(), remote_port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("tunnel {}: TLS transport connect failed: {}", tunnel_id, e);
            let _ = events.send(TlsEvent::ShuttingDown).await;
            return;
        }
        Err(_) => {
            warn!("tunnel {}: TLS transport connect timed out", tunnel_id);
            let _ = events.send(TlsEvent::ShuttingDown).await;
            return;
        }
    };

    let sni = match ServerName::try_from(server_name.clone()) {
        Ok(sni) => sni,
        Err(e) => {
            warn!("tunnel {}: invalid TLS server name: {}", tunnel_id, e);
            let _ = events.send(TlsEvent::ShuttingDown).await;
            return;
        }
    };

    let connector = TlsConnector::from(client_config());
    let mut tls = match connector.connect(sni, stream).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!("tunnel {}: TLS handshake failed: {}", tunnel_id, e);
            let _ = events.send(TlsEvent::ShuttingDown).await;
            return;
        }
    };

    debug!("tunnel {}: TLS session established with {}", tunnel_id, server_name);
    if events.send(TlsEvent::Established).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; SSR_BUFF_SIZE];
    loop {
        tokio::select! {
            chunk = outbound.recv() => {
                match chunk {
                    Some(chunk) => {
                        if let Err(e) = tls.write_all(&chunk).await {
                            warn!("tunnel {}: TLS write failed: {}", tunnel_id, e);
                            break;
                        }
                    }
                    // Driver dropped the handle: orderly close.
                    None => break,
                }
            }
            read = tls.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("tunnel {}: TLS peer closed", tunnel_id);
                        break;
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(TlsEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("tunnel {}: TLS read failed: {}", tunnel_id, e);
                        break;
                    }
                }
            }
        }
    }

    let _ = tls.shutdown().await;
    let _ = events.send(TlsEvent::ShuttingDown).await;
}
