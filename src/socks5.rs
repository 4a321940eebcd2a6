/// SOCKS5 protocol engine (component E): greeting, sub-auth negotiation,
/// request parsing, and destination resolution/connect. Implements RFC 1928
/// with RFC 1929 user/password sub-negotiation; only CONNECT is supported.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::sleep;

use crate::config::RETRY_DELAY_MS;
use crate::errors::{ConnectFailureKind, Error};
use crate::messages::{
    self, ConnectRequest, Destination, ReplyCode, METHOD_NONE_ACCEPTABLE, METHOD_NO_AUTH,
    METHOD_USERPASS,
};
use crate::state::SharedState;

/// Mirrors SPEC_FULL.md §4.5's state diagram. Tracked explicitly (rather
/// than left implicit in control flow) so invariants like "RELAYING is only
/// reached after CONNECTING succeeds" are checkable in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Greeting,
    Auth,
    Request,
    Connecting,
    Relaying,
    Done,
    Error,
}

/// Negotiates the authentication method. Returns the selected method byte.
///
/// If the user table is populated (persisted or in-memory), USERPASS is
/// required — a greeting that doesn't offer it is rejected outright, even if
/// NO_AUTH was offered. Otherwise NO_AUTH is selected if offered. If neither
/// is acceptable, the client is told so (`0xFF`), drained, and an error is
/// returned.
pub async fn handle_greeting(stream: &mut TcpStream, shared: &Arc<SharedState>) -> Result<u8, Error> {
    let greeting = messages::read_greeting(stream).await?;

    let method = if shared.users.is_populated() {
        if greeting.methods.contains(&METHOD_USERPASS) {
            METHOD_USERPASS
        } else {
            messages::write_method_selection(stream, METHOD_NONE_ACCEPTABLE).await?;
            messages::drain_best_effort(stream).await;
            return Err(Error::ProtocolViolation(
                "users are configured but client did not offer USERPASS".into(),
            ));
        }
    } else if greeting.methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        messages::write_method_selection(stream, METHOD_NONE_ACCEPTABLE).await?;
        messages::drain_best_effort(stream).await;
        return Err(Error::ProtocolViolation("no acceptable authentication method".into()));
    };

    messages::write_method_selection(stream, method).await?;
    Ok(method)
}

/// Runs RFC 1929 sub-negotiation. Returns the authenticated username.
pub async fn handle_auth(stream: &mut TcpStream, shared: &Arc<SharedState>) -> Result<String, Error> {
    let auth = match messages::read_userpass_auth(stream).await {
        Ok(auth) => auth,
        Err(_) => {
            messages::write_userpass_reply(stream, false).await?;
            return Err(Error::AuthFailure);
        }
    };

    match shared.users.validate(&auth.username, &auth.password) {
        Some(_) => {
            messages::write_userpass_reply(stream, true).await?;
            Ok(auth.username)
        }
        None => {
            messages::write_userpass_reply(stream, false).await?;
            Err(Error::AuthFailure)
        }
    }
}

/// Reads the CONNECT request. Destination port extraction happens here so
/// the caller can stamp it on the connection slot before attempting to
/// connect, per SPEC_FULL.md §4.5 REQUEST.
pub async fn handle_request(stream: &mut TcpStream) -> Result<ConnectRequest, Error> {
    messages::read_connect_request(stream).await
}

pub struct ConnectOutcome {
    pub remote: TcpStream,
    pub bound_addr: SocketAddr,
}

/// Resolves (if needed) and connects to the requested destination,
/// preferring IPv6 candidates before IPv4, retrying with `RETRY_DELAY_MS`
/// between attempts, bounded overall by `timeout_ms` per attempt.
pub async fn connect_to_destination(
    request: &ConnectRequest,
    timeout_ms: u64,
) -> Result<ConnectOutcome, Error> {
    let candidates = resolve(request).await?;

    let mut last_error = ConnectFailureKind::Socket;
    for addr in candidates {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let bound_addr = stream.local_addr()?;
                return Ok(ConnectOutcome { remote: stream, bound_addr });
            }
            Ok(Err(_)) => {
                last_error = ConnectFailureKind::Refused;
            }
            Err(_) => {
                last_error = ConnectFailureKind::Timeout;
            }
        }

        if RETRY_DELAY_MS > 0 {
            sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }

    Err(Error::ConnectFailure(last_error))
}

/// Orders resolved addresses IPv6-first per SPEC_FULL.md §4.5 CONNECTING.
async fn resolve(request: &ConnectRequest) -> Result<Vec<SocketAddr>, Error> {
    let mut addrs: Vec<SocketAddr> = match &request.destination {
        Destination::Ip(ip) => vec![SocketAddr::new(*ip, request.port)],
        Destination::Domain(name) => {
            let host_port = format!("{name}:{}", request.port);
            lookup_host(&host_port)
                .await
                .map_err(|_| Error::ResolveFailure(name.clone()))?
                .collect()
        }
    };

    if addrs.is_empty() {
        return Err(Error::ResolveFailure(match &request.destination {
            Destination::Domain(name) => name.clone(),
            Destination::Ip(ip) => ip.to_string(),
        }));
    }

    addrs.sort_by_key(|addr| matches!(addr, SocketAddr::V4(_)));
    Ok(addrs)
}

/// Translates an `Error` into the SOCKS5 reply code the client should see,
/// per SPEC_FULL.md §4.5 CONNECTING and §7.
pub fn reply_code_for(err: &Error) -> ReplyCode {
    match err {
        Error::ResolveFailure(_) => ReplyCode::HostUnreachable,
        Error::ConnectFailure(ConnectFailureKind::Timeout) => ReplyCode::HostUnreachable,
        Error::ConnectFailure(ConnectFailureKind::Refused) => ReplyCode::ConnectionRefused,
        Error::ConnectFailure(ConnectFailureKind::Socket) => ReplyCode::GeneralFailure,
        _ => ReplyCode::GeneralFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::net::Ipv4Addr;
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    fn fresh_state() -> Arc<SharedState> {
        let file = NamedTempFile::new().unwrap();
        SharedState::init(file.path().to_path_buf(), RuntimeConfig::default())
    }

    #[tokio::test]
    async fn greeting_selects_no_auth_when_no_users() {
        let shared = fresh_state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        use tokio::io::AsyncWriteExt;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let method = handle_greeting(&mut server, &shared).await.unwrap();
        assert_eq!(method, METHOD_NO_AUTH);
    }

    #[tokio::test]
    async fn greeting_selects_userpass_when_users_exist() {
        let shared = fresh_state();
        shared.users.preload("alice", "secret");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        use tokio::io::AsyncWriteExt;
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();

        let method = handle_greeting(&mut server, &shared).await.unwrap();
        assert_eq!(method, METHOD_USERPASS);
    }

    #[tokio::test]
    async fn greeting_rejects_no_auth_when_users_exist_and_client_cannot_do_userpass() {
        let shared = fresh_state();
        shared.users.preload("alice", "secret");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        assert!(handle_greeting(&mut server, &shared).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, METHOD_NONE_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn auth_succeeds_for_valid_credentials() {
        let shared = fresh_state();
        shared.users.preload("alice", "secret");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut frame = vec![0x01, 5];
        frame.extend_from_slice(b"alice");
        frame.push(6);
        frame.extend_from_slice(b"secret");
        client.write_all(&frame).await.unwrap();

        let username = handle_auth(&mut server, &shared).await.unwrap();
        assert_eq!(username, "alice");

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x00]);
    }

    #[tokio::test]
    async fn auth_fails_for_wrong_password() {
        let shared = fresh_state();
        shared.users.preload("alice", "secret");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut frame = vec![0x01, 5];
        frame.extend_from_slice(b"alice");
        frame.push(5);
        frame.extend_from_slice(b"wrong");
        client.write_all(&frame).await.unwrap();

        assert!(handle_auth(&mut server, &shared).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);
    }

    #[tokio::test]
    async fn connect_to_destination_succeeds_against_loopback_listener() {
        let dummy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dummy_addr = dummy.local_addr().unwrap();
        let _accept_task = tokio::spawn(async move {
            let _ = dummy.accept().await;
        });

        let request = ConnectRequest {
            destination: Destination::Ip(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: dummy_addr.port(),
        };

        let outcome = connect_to_destination(&request, 2000).await.unwrap();
        assert!(outcome.bound_addr.port() > 0);
    }

    #[tokio::test]
    async fn connect_failure_reports_refused_for_closed_port() {
        // bind and immediately drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = ConnectRequest {
            destination: Destination::Ip(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: addr.port(),
        };

        let err = connect_to_destination(&request, 500).await.unwrap_err();
        assert_eq!(reply_code_for(&err), ReplyCode::ConnectionRefused);
    }
}
