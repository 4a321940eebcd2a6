/// Management acceptor and per-connection dispatch (component G).
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::admin::protocol::{
    self, Command, ConfigResponse, Request, SimpleResponse, StatsResponse, UserRecord, UsersResponse,
};
use crate::errors::Error;
use crate::state::SharedState;

const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Accepts management connections forever; each is handed to a freshly
/// spawned short-lived task, per SPEC_FULL.md §4.7.
pub async fn accept_loop(listener: TcpListener, shared: Arc<SharedState>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("management accept failed: {err}");
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, shared).await {
                log::warn!("management connection from {peer_addr} terminated: {err}");
            }
        });
    }
}

/// Reads exactly one request frame, dispatches it, writes exactly one
/// response frame, and returns. Any short read/write is a fatal error for
/// this connection — no partial-command recovery (SPEC_FULL.md §4.3).
pub(crate) async fn handle_client(mut stream: TcpStream, shared: Arc<SharedState>) -> Result<(), Error> {
    let request = timeout(FRAME_WAIT, protocol::read_request(&mut stream))
        .await
        .map_err(|_| Error::ProtocolViolation("management request frame timed out".into()))??;

    log::info!("management command {:?} received", request.command);

    match request.command {
        Command::AddUser => dispatch_add_user(&mut stream, &shared, &request).await,
        Command::DelUser => dispatch_del_user(&mut stream, &shared, &request).await,
        Command::ListUsers => dispatch_list_users(&mut stream, &shared).await,
        Command::Stats => dispatch_stats(&mut stream, &shared).await,
        Command::SetTimeout => dispatch_set_timeout(&mut stream, &shared, &request).await,
        Command::SetBuffer => dispatch_set_buffer(&mut stream, &shared, &request).await,
        Command::SetMaxClients => dispatch_set_max_clients(&mut stream, &shared, &request).await,
        Command::EnableDissectors => {
            shared.config.set_dissectors_enabled(true);
            reply_simple(&mut stream, true, "dissectors enabled").await
        }
        Command::DisableDissectors => {
            shared.config.set_dissectors_enabled(false);
            reply_simple(&mut stream, true, "dissectors disabled").await
        }
        Command::ReloadConfig => {
            shared.users.reload();
            reply_simple(&mut stream, true, "user database reloaded").await
        }
        Command::GetConfig => dispatch_get_config(&mut stream, &shared).await,
    }
}

async fn reply_simple(stream: &mut TcpStream, success: bool, message: &str) -> Result<(), Error> {
    let resp = SimpleResponse { success, message: message.to_string() };
    timeout(FRAME_WAIT, protocol::write_simple_response(stream, &resp))
        .await
        .map_err(|_| Error::ProtocolViolation("management response frame timed out".into()))?
}

async fn dispatch_add_user(stream: &mut TcpStream, shared: &SharedState, request: &Request) -> Result<(), Error> {
    match shared.users.add(&request.username, &request.password) {
        Ok(()) => reply_simple(stream, true, &format!("user '{}' added", request.username)).await,
        Err(message) => reply_simple(stream, false, &message).await,
    }
}

async fn dispatch_del_user(stream: &mut TcpStream, shared: &SharedState, request: &Request) -> Result<(), Error> {
    match shared.users.delete(&request.username) {
        Ok(()) => reply_simple(stream, true, &format!("user '{}' removed", request.username)).await,
        Err(message) => reply_simple(stream, false, &message).await,
    }
}

async fn dispatch_list_users(stream: &mut TcpStream, shared: &SharedState) -> Result<(), Error> {
    let snapshots = shared.users.list_snapshots();
    let users: Vec<UserRecord> = snapshots
        .into_iter()
        .filter(|s| s.active)
        .map(|s| UserRecord {
            username: s.username,
            active: s.active,
            total_connections: s.total_connections,
            current_connections: s.current_connections,
            total_bytes_transferred: s.total_bytes_transferred,
        })
        .collect();

    let resp = UsersResponse {
        success: true,
        message: format!("{} active user(s)", users.len()),
        users,
    };
    timeout(FRAME_WAIT, protocol::write_users_response(stream, &resp))
        .await
        .map_err(|_| Error::ProtocolViolation("management response frame timed out".into()))?
}

async fn dispatch_stats(stream: &mut TcpStream, shared: &SharedState) -> Result<(), Error> {
    let snapshot = shared.global_stats.snapshot();
    let resp = StatsResponse {
        success: true,
        message: "ok".to_string(),
        user_count: shared.users.count() as u32,
        stats: snapshot,
    };
    timeout(FRAME_WAIT, protocol::write_stats_response(stream, &resp))
        .await
        .map_err(|_| Error::ProtocolViolation("management response frame timed out".into()))?
}

async fn dispatch_get_config(stream: &mut TcpStream, shared: &SharedState) -> Result<(), Error> {
    let config = shared.config.load();
    let resp = ConfigResponse {
        success: true,
        message: "ok".to_string(),
        timeout_ms: config.timeout_ms as u32,
        buffer_size: config.buffer_size,
        max_clients: config.max_clients,
        dissectors_enabled: config.dissectors_enabled,
    };
    timeout(FRAME_WAIT, protocol::write_config_response(stream, &resp))
        .await
        .map_err(|_| Error::ProtocolViolation("management response frame timed out".into()))?
}

async fn dispatch_set_timeout(
    stream: &mut TcpStream,
    shared: &SharedState,
    request: &Request,
) -> Result<(), Error> {
    match parse_arg(&request.username).and_then(|value| shared.config.set_timeout_ms(value)) {
        Ok(()) => reply_simple(stream, true, "timeout updated").await,
        Err(err) => reply_simple(stream, false, &err.to_string()).await,
    }
}

async fn dispatch_set_buffer(
    stream: &mut TcpStream,
    shared: &SharedState,
    request: &Request,
) -> Result<(), Error> {
    match parse_arg::<u32>(&request.username).and_then(|value| shared.config.set_buffer_size(value)) {
        Ok(()) => reply_simple(stream, true, "buffer size updated").await,
        Err(err) => reply_simple(stream, false, &err.to_string()).await,
    }
}

async fn dispatch_set_max_clients(
    stream: &mut TcpStream,
    shared: &SharedState,
    request: &Request,
) -> Result<(), Error> {
    match parse_arg::<u32>(&request.username).and_then(|value| shared.config.set_max_clients(value)) {
        Ok(()) => reply_simple(stream, true, "max clients updated").await,
        Err(err) => reply_simple(stream, false, &err.to_string()).await,
    }
}

/// `SET_*` commands carry their numeric argument as a decimal string in the
/// request's `username` field (SPEC_FULL.md §4.3).
fn parse_arg<T: std::str::FromStr<Err = std::num::ParseIntError>>(raw: &str) -> Result<T, Error> {
    raw.parse().map_err(Error::from)
}
