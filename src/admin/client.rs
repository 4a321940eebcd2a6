/// Library-side client helpers used by the `socks5ctl` binary to talk to
/// the management plane (mirrors `client.c`'s `mgmt_connect_to_server` /
/// `mgmt_send_command` pairing).
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::admin::protocol::{
    self, Command, ConfigResponse, Request, SimpleResponse, StatsResponse, UsersResponse,
};
use crate::errors::Error;

const FRAME_WAIT: Duration = Duration::from_secs(5);

pub async fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
    timeout(FRAME_WAIT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ProtocolViolation("connect to management endpoint timed out".into()))?
        .map_err(Error::from)
}

async fn send(stream: &mut TcpStream, request: Request) -> Result<(), Error> {
    timeout(FRAME_WAIT, protocol::write_request(stream, &request))
        .await
        .map_err(|_| Error::ProtocolViolation("management request send timed out".into()))?
}

pub async fn add_user(stream: &mut TcpStream, username: &str, password: &str) -> Result<SimpleResponse, Error> {
    send(stream, Request { command: Command::AddUser, username: username.to_string(), password: password.to_string() }).await?;
    read_simple(stream).await
}

pub async fn del_user(stream: &mut TcpStream, username: &str) -> Result<SimpleResponse, Error> {
    send(stream, Request { command: Command::DelUser, username: username.to_string(), password: String::new() })
        .await?;
    read_simple(stream).await
}

pub async fn list_users(stream: &mut TcpStream) -> Result<UsersResponse, Error> {
    send(stream, Request { command: Command::ListUsers, username: String::new(), password: String::new() })
        .await?;
    timeout(FRAME_WAIT, protocol::read_users_response(stream))
        .await
        .map_err(|_| Error::ProtocolViolation("management response receive timed out".into()))?
}

pub async fn stats(stream: &mut TcpStream) -> Result<StatsResponse, Error> {
    send(stream, Request { command: Command::Stats, username: String::new(), password: String::new() }).await?;
    timeout(FRAME_WAIT, protocol::read_stats_response(stream))
        .await
        .map_err(|_| Error::ProtocolViolation("management response receive timed out".into()))?
}

pub async fn set_timeout(stream: &mut TcpStream, timeout_ms: u64) -> Result<SimpleResponse, Error> {
    send(
        stream,
        Request { command: Command::SetTimeout, username: timeout_ms.to_string(), password: String::new() },
    )
    .await?;
    read_simple(stream).await
}

pub async fn set_buffer(stream: &mut TcpStream, buffer_size: u32) -> Result<SimpleResponse, Error> {
    send(
        stream,
        Request { command: Command::SetBuffer, username: buffer_size.to_string(), password: String::new() },
    )
    .await?;
    read_simple(stream).await
}

pub async fn set_max_clients(stream: &mut TcpStream, max_clients: u32) -> Result<SimpleResponse, Error> {
    send(
        stream,
        Request {
            command: Command::SetMaxClients,
            username: max_clients.to_string(),
            password: String::new(),
        },
    )
    .await?;
    read_simple(stream).await
}

pub async fn set_dissectors_enabled(stream: &mut TcpStream, enabled: bool) -> Result<SimpleResponse, Error> {
    let command = if enabled { Command::EnableDissectors } else { Command::DisableDissectors };
    send(stream, Request { command, username: String::new(), password: String::new() }).await?;
    read_simple(stream).await
}

pub async fn reload_config(stream: &mut TcpStream) -> Result<SimpleResponse, Error> {
    send(stream, Request { command: Command::ReloadConfig, username: String::new(), password: String::new() })
        .await?;
    read_simple(stream).await
}

pub async fn get_config(stream: &mut TcpStream) -> Result<ConfigResponse, Error> {
    send(stream, Request { command: Command::GetConfig, username: String::new(), password: String::new() })
        .await?;
    timeout(FRAME_WAIT, protocol::read_config_response(stream))
        .await
        .map_err(|_| Error::ProtocolViolation("management response receive timed out".into()))?
}

async fn read_simple(stream: &mut TcpStream) -> Result<SimpleResponse, Error> {
    timeout(FRAME_WAIT, protocol::read_simple_response(stream))
        .await
        .map_err(|_| Error::ProtocolViolation("management response receive timed out".into()))?
}
