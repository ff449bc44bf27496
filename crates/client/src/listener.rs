//! SOCKS5 listener
//!
//! Binds the local endpoint and spawns one driver task per accepted
//! client. Each tunnel registers a shutdown handle before its driver
//! starts, so a broadcast reaches sessions in any stage.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::driver;
use crate::env::Env;
use crate::error::Result;
use crate::tunnel::Tunnel;

pub struct Socks5Listener {
    env: Arc<Env>,
    listen_addr: Option<SocketAddr>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Socks5Listener {
    pub fn new(env: Arc<Env>) -> Self {
        Self {
            env,
            listen_addr: None,
            handle: None,
        }
    }

    /// Bind and start accepting.
    ///
    /// Returns immediately; the accept loop runs in a background task.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind((
            self.env.config.listen_host.as_str(),
            self.env.config.listen_port,
        ))
        .await?;
        let actual_addr = listener.local_addr()?;
        info!("SOCKS5 proxy listening on {}", actual_addr);
        self.listen_addr = Some(actual_addr);

        let env = self.env.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("SOCKS5 connection from {}", peer_addr);
                        let shutdown = Arc::new(Notify::new());
                        let id = env.registry.register(shutdown.clone());
                        let tunnel = Tunnel::new(id, env.clone());
                        tokio::spawn(driver::drive(tunnel, stream, shutdown));
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop accepting new clients. Live tunnels are unaffected; use the
    /// registry broadcast to terminate them.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("SOCKS5 proxy stopped");
        }
    }

    /// The bound address, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }
}

impl Drop for Socks5Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
