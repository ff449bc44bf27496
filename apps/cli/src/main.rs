//! VeilTunnel CLI
//!
//! Runs the local SOCKS5 proxy client: load or assemble the configuration,
//! start the listener, and broadcast shutdown to live tunnels on ctrl-c.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veiltunnel_client::{Env, Socks5Listener};
use veiltunnel_core::config::CipherMethod;
use veiltunnel_core::Config;

/// VeilTunnel - SOCKS5 proxy over an obfuscated upstream
#[derive(Parser)]
#[command(name = "veiltunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forwarding server hostname or IP (overrides the file)
    #[arg(short = 's', long)]
    remote_host: Option<String>,

    /// Forwarding server port (overrides the file)
    #[arg(short = 'p', long)]
    remote_port: Option<u16>,

    /// Local listen host
    #[arg(short = 'b', long)]
    listen_host: Option<String>,

    /// Local listen port
    #[arg(short = 'l', long)]
    listen_port: Option<u16>,

    /// Session password
    #[arg(short = 'k', long)]
    password: Option<String>,

    /// Cipher method (plain, chacha20-poly1305)
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Answer UDP-ASSOCIATE requests with a relay endpoint
    #[arg(long)]
    udp: bool,

    /// Wrap the upstream session in TLS
    #[arg(long)]
    tls: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(host) = &self.remote_host {
            config.remote_host = host.clone();
        }
        if let Some(port) = self.remote_port {
            config.remote_port = port;
        }
        if let Some(host) = &self.listen_host {
            config.listen_host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(method) = &self.method {
            config.method = match method.as_str() {
                "plain" => CipherMethod::Plain,
                "chacha20-poly1305" => CipherMethod::Chacha20Poly1305,
                other => bail!("unknown cipher method: {}", other),
            };
        }
        if self.udp {
            config.udp = true;
        }
        if self.tls {
            config.over_tls_enable = true;
        }

        if config.remote_host.is_empty() {
            bail!("no forwarding server configured; pass --remote-host or --config");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.build_config()?;
    info!(
        "forwarding to {}:{}{}",
        config.remote_host,
        config.remote_port,
        if config.over_tls_enable { " over TLS" } else { "" }
    );

    let env = Env::new(config);
    let mut listener = Socks5Listener::new(env.clone());
    listener.start().await.context("starting SOCKS5 listener")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    listener.stop();
    env.shutdown();

    Ok(())
}
