//! Client configuration

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Client configuration, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Forwarding server hostname or IP literal
    pub remote_host: String,

    /// Forwarding server port
    pub remote_port: u16,

    /// Local SOCKS5 listen host
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Local SOCKS5 listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Cipher method
    #[serde(default)]
    pub method: CipherMethod,

    /// Shared secret the session key is derived from
    #[serde(default)]
    pub password: String,

    /// Answer UDP-ASSOCIATE requests with a usable relay endpoint
    #[serde(default)]
    pub udp: bool,

    /// Wrap the upstream session in TLS
    #[serde(default)]
    pub over_tls_enable: bool,

    /// SNI for the TLS-wrapped path; defaults to `remote_host`
    #[serde(default)]
    pub over_tls_server_domain: Option<String>,

    /// Per-tunnel idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upstream TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_port: 0,
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            method: CipherMethod::default(),
            password: String::new(),
            udp: false,
            over_tls_enable: false,
            over_tls_server_domain: None,
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// The upstream endpoint, when `remote_host` is an IP literal.
    ///
    /// A literal skips the DNS resolution stage entirely.
    pub fn remote_literal_ip(&self) -> Option<SocketAddr> {
        self.remote_host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.remote_port))
    }

    /// Hostname presented during the TLS handshake.
    pub fn tls_server_name(&self) -> &str {
        self.over_tls_server_domain
            .as_deref()
            .unwrap_or(&self.remote_host)
    }
}

/// Supported cipher methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherMethod {
    /// No transform; useful for trusted links and tests
    Plain,
    /// ChaCha20-Poly1305 AEAD records
    #[default]
    Chacha20Poly1305,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.method, CipherMethod::Chacha20Poly1305);
        assert!(!config.udp);
        assert!(!config.over_tls_enable);
        assert_eq!(config.idle_timeout_secs, 300);
    }

    #[test]
    fn test_minimal_json() {
        let config: Config =
            serde_json::from_str(r#"{"remote_host": "proxy.example.net", "remote_port": 8388}"#)
                .unwrap();
        assert_eq!(config.remote_host, "proxy.example.net");
        assert_eq!(config.remote_port, 8388);
        assert_eq!(config.listen_port, 1080);
    }

    #[test]
    fn test_method_names() {
        let config: Config = serde_json::from_str(
            r#"{"remote_host": "h", "remote_port": 1, "method": "plain"}"#,
        )
        .unwrap();
        assert_eq!(config.method, CipherMethod::Plain);
    }

    #[test]
    fn test_remote_literal_ip() {
        let mut config = Config {
            remote_host: "192.0.2.10".to_string(),
            remote_port: 8388,
            ..Default::default()
        };
        assert_eq!(
            config.remote_literal_ip().unwrap().to_string(),
            "192.0.2.10:8388"
        );

        config.remote_host = "proxy.example.net".to_string();
        assert!(config.remote_literal_ip().is_none());
    }

    #[test]
    fn test_tls_server_name_fallback() {
        let mut config = Config {
            remote_host: "proxy.example.net".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tls_server_name(), "proxy.example.net");

        config.over_tls_server_domain = Some("cdn.example.com".to_string());
        assert_eq!(config.tls_server_name(), "cdn.example.com");
    }

    #[test]
    fn test_round_trip_serialization() {
        let config = Config {
            remote_host: "proxy.example.net".to_string(),
            remote_port: 8388,
            over_tls_enable: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.remote_host, config.remote_host);
        assert!(parsed.over_tls_enable);
    }
}
