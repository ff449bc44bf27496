//! End-to-end tunnel flows over localhost.
//!
//! A scripted SOCKS5 client talks to a real listener, which forwards to a
//! fake upstream server accepting the proxy wire format. Loopback
//! destinations are permitted in debug builds, which is what tests run as.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use veiltunnel_cipher::TunnelCipher;
use veiltunnel_client::{Env, Socks5Listener};
use veiltunnel_core::config::CipherMethod;
use veiltunnel_core::{Config, TUNNEL_MTU};

/// Destination record for 203.0.113.5:80 in the proxy wire format.
const DEST_RECORD: [u8; 7] = [0x01, 203, 0, 113, 5, 0x00, 0x50];
const CONNECT_REQUEST: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 203, 0, 113, 5, 0x00, 0x50];

fn client_config(upstream: SocketAddr, method: CipherMethod) -> Config {
    Config {
        remote_host: upstream.ip().to_string(),
        remote_port: upstream.port(),
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        method,
        password: "integration".to_string(),
        ..Default::default()
    }
}

async fn start_proxy(config: Config) -> (std::sync::Arc<Env>, Socks5Listener, SocketAddr) {
    let env = Env::new(config);
    let mut listener = Socks5Listener::new(env.clone());
    listener.start().await.unwrap();
    let addr = listener.listen_addr().unwrap();
    (env, listener, addr)
}

async fn socks5_connect(proxy: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client.write_all(&CONNECT_REQUEST).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..3], &[0x05, 0x00, 0x00]);
    assert_eq!(&reply[3..], &DEST_RECORD);

    client
}

async fn wait_for_registry(env: &Env, len: usize) {
    for _ in 0..100 {
        if env.registry.len() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {} tunnels", len);
}

#[tokio::test]
async fn test_connect_end_to_end_plain() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let server: JoinHandle<()> = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();

        // First upstream payload is the destination record.
        let mut init = [0u8; 7];
        stream.read_exact(&mut init).await.unwrap();
        assert_eq!(init, DEST_RECORD);

        let mut request = [0u8; 5];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"hello");

        stream.write_all(b"world").await.unwrap();
    });

    let (env, _listener, proxy_addr) =
        start_proxy(client_config(upstream_addr, CipherMethod::Plain)).await;
    let mut client = socks5_connect(proxy_addr).await;

    client.write_all(b"hello").await.unwrap();
    let mut response = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"world");

    server.await.unwrap();

    // Closing the client tears the tunnel down and deregisters it.
    drop(client);
    wait_for_registry(&env, 0).await;
}

#[tokio::test]
async fn test_connect_end_to_end_chacha() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let cipher_config = client_config(upstream_addr, CipherMethod::Chacha20Poly1305);
    let server_config = cipher_config.clone();

    let server: JoinHandle<()> = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut rx = TunnelCipher::new(&server_config, TUNNEL_MTU);
        let mut tx = TunnelCipher::new(&server_config, TUNNEL_MTU);

        // Decrypt until the destination record and the request arrive,
        // however TCP happens to segment the records.
        let mut plaintext = BytesMut::new();
        let mut buf = [0u8; 4096];
        while plaintext.len() < DEST_RECORD.len() + 5 {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "upstream saw EOF before the request");
            let mut chunk = BytesMut::from(&buf[..n]);
            rx.decrypt(&mut chunk).unwrap();
            plaintext.extend_from_slice(&chunk);
        }
        assert_eq!(&plaintext[..7], &DEST_RECORD);
        assert_eq!(&plaintext[7..12], b"hello");

        let mut response = BytesMut::from(&b"world"[..]);
        tx.encrypt(&mut response).unwrap();
        stream.write_all(&response).await.unwrap();
    });

    let (_env, _listener, proxy_addr) = start_proxy(cipher_config).await;
    let mut client = socks5_connect(proxy_addr).await;

    client.write_all(b"hello").await.unwrap();
    let mut response = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"world");

    server.await.unwrap();
}

#[tokio::test]
async fn test_unsupported_auth_method_refused() {
    let (_env, _listener, proxy_addr) = start_proxy(client_config(
        "192.0.2.1:8388".parse().unwrap(),
        CipherMethod::Plain,
    ))
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    // Only username/password offered.
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // The proxy closes after the refusal.
    let n = client.read(&mut [0u8; 1]).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_dns_failure_replies_host_unreachable() {
    let config = Config {
        remote_host: "nonexistent.invalid".to_string(),
        remote_port: 8388,
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        method: CipherMethod::Plain,
        ..Default::default()
    };
    let (_env, _listener, proxy_addr) = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client.write_all(&CONNECT_REQUEST).await.unwrap();
    let mut reply = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(30), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [5, 4, 0, 1, 0, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_shutdown_broadcast_terminates_all_stages() {
    let (env, _listener, proxy_addr) = start_proxy(client_config(
        "192.0.2.1:8388".parse().unwrap(),
        CipherMethod::Plain,
    ))
    .await;

    // One tunnel parked mid-greeting, one idle before any bytes.
    let mut mid_handshake = TcpStream::connect(proxy_addr).await.unwrap();
    mid_handshake.write_all(&[0x05]).await.unwrap();
    let idle = TcpStream::connect(proxy_addr).await.unwrap();

    wait_for_registry(&env, 2).await;

    env.shutdown();
    wait_for_registry(&env, 0).await;

    // Both client sockets observe the close.
    let n = mid_handshake.read(&mut [0u8; 1]).await.unwrap();
    assert_eq!(n, 0);
    drop(idle);
}
