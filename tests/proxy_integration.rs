//! Drives the proxy end to end over real loopback sockets, covering the
//! literal scenarios in SPEC_FULL.md §8.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socks5d::config::RuntimeConfig;
use socks5d::logging::AccessLog;
use socks5d::relay;
use socks5d::state::SharedState;
use tempfile::{tempdir, NamedTempFile};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_proxy(config: RuntimeConfig) -> (SocketAddr, Arc<SharedState>) {
    let db_file = NamedTempFile::new().unwrap();
    let shared = SharedState::init(db_file.path().to_path_buf(), config);
    let log_dir = tempdir().unwrap();
    let access_log = Arc::new(AccessLog::new(log_dir.path().join("metrics.log")));
    let pop3_log_path = log_dir.path().join("pop3_credentials.log");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shared_clone = shared.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else { return };
            tokio::spawn(relay::serve_client(
                stream,
                peer_addr,
                shared_clone.clone(),
                pop3_log_path.clone(),
                access_log.clone(),
            ));
        }
    });

    (addr, shared)
}

async fn spawn_proxy_with_pop3_log(config: RuntimeConfig) -> (SocketAddr, Arc<SharedState>, std::path::PathBuf) {
    let db_file = NamedTempFile::new().unwrap();
    let shared = SharedState::init(db_file.path().to_path_buf(), config);
    let log_dir = tempdir().unwrap();
    let access_log = Arc::new(AccessLog::new(log_dir.path().join("metrics.log")));
    let pop3_log_path = log_dir.path().join("pop3_credentials.log");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shared_clone = shared.clone();
    let pop3_log_for_loop = pop3_log_path.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else { return };
            tokio::spawn(relay::serve_client(
                stream,
                peer_addr,
                shared_clone.clone(),
                pop3_log_for_loop.clone(),
                access_log.clone(),
            ));
        }
    });

    (addr, shared, pop3_log_path)
}

#[tokio::test]
async fn no_auth_connect_round_trip_to_a_dummy_destination() {
    let dummy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dummy_addr = dummy.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dummy.accept().await;
    });

    let (proxy_addr, _shared) = spawn_proxy(RuntimeConfig::default()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&dummy_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);
    assert_eq!(reply[3], 0x01);
}

#[tokio::test]
async fn userpass_auth_success_then_wrong_password_fails() {
    let (proxy_addr, shared) = spawn_proxy(RuntimeConfig::default()).await;
    shared.users.preload("alice", "secret");

    let dummy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dummy_addr = dummy.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if dummy.accept().await.is_err() {
                return;
            }
        }
    });

    // success case
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x02]);

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(6);
    auth.extend_from_slice(b"secret");
    client.write_all(&auth).await.unwrap();
    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    // wrong-password case on a fresh connection
    let mut client2 = TcpStream::connect(proxy_addr).await.unwrap();
    client2.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut greeting_reply2 = [0u8; 2];
    client2.read_exact(&mut greeting_reply2).await.unwrap();

    let mut bad_auth = vec![0x01, 5];
    bad_auth.extend_from_slice(b"alice");
    bad_auth.push(5);
    bad_auth.extend_from_slice(b"wrong");
    client2.write_all(&bad_auth).await.unwrap();
    let mut bad_auth_reply = [0u8; 2];
    client2.read_exact(&mut bad_auth_reply).await.unwrap();
    assert_eq!(bad_auth_reply, [0x01, 0x01]);
}

#[tokio::test]
async fn authenticated_users_stats_are_stamped_on_successful_connect() {
    let (proxy_addr, shared) = spawn_proxy(RuntimeConfig::default()).await;
    shared.users.preload("alice", "secret");

    let dummy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dummy_addr = dummy.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dummy.accept().await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(6);
    auth.extend_from_slice(b"secret");
    client.write_all(&auth).await.unwrap();
    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
    request.extend_from_slice(&dummy_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    let snapshot = shared
        .users
        .list_snapshots()
        .into_iter()
        .find(|s| s.username == "alice")
        .unwrap();
    assert_eq!(snapshot.total_connections, 1);
    assert_eq!(snapshot.current_connections, 1);
}

#[tokio::test]
async fn ipv6_connect_reports_the_requested_destination_port() {
    let dummy = TcpListener::bind("[::1]:0").await.unwrap();
    let dummy_addr = dummy.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dummy.accept().await;
    });

    let (proxy_addr, _shared) = spawn_proxy(RuntimeConfig::default()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    request.extend_from_slice(&dummy_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 22];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);
    assert_eq!(reply[3], 0x04);
}

#[tokio::test]
async fn domain_connect_fails_over_across_resolved_addresses() {
    let dummy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let dummy_addr = dummy.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dummy.accept().await;
    });

    let (proxy_addr, _shared) = spawn_proxy(RuntimeConfig::default()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();

    let domain = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain);
    request.extend_from_slice(&dummy_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "CONNECT via domain name should succeed");
}

#[tokio::test]
async fn pop3_credentials_are_captured_during_a_live_relay() {
    let mut config = RuntimeConfig::default();
    config.dissectors_enabled = true;

    let fake_pop3 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_pop3_addr = fake_pop3.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut server, _)) = fake_pop3.accept().await {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await;
        }
    });

    let (proxy_addr, _shared, pop3_log_path) = spawn_proxy_with_pop3_log(config).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
    request.extend_from_slice(&fake_pop3_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();

    client.write_all(b"USER bob\r\nPASS hunter2\r\n").await.unwrap();

    // give the relay a moment to pump the bytes and run the dissector.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    drop(client);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let contents = std::fs::read_to_string(&pop3_log_path).unwrap_or_default();
    assert!(contents.contains("USER: bob | PASS: hunter2"));
}
