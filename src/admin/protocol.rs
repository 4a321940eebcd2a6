/// Fixed-size wire codec for the management plane (component C). Frames are
/// plain fixed-width records in host byte order (SPEC_FULL.md §9: this
/// channel only ever runs between `socks5d` and `socks5ctl` on the same
/// host, so there's no interop reason to pay for byte-swapping).
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;
use crate::stats::GlobalStatsSnapshot;
use crate::users::{MAX_PASSWORD_LEN, MAX_USERNAME_LEN, MAX_USERS};

pub const MGMT_MESSAGE_LEN: usize = 1024;

/// 4 (command) + 64 (username) + 64 (password).
pub const REQUEST_FRAME_LEN: usize = 4 + MAX_USERNAME_LEN + MAX_PASSWORD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    AddUser = 0,
    DelUser = 1,
    ListUsers = 2,
    Stats = 3,
    SetTimeout = 4,
    SetBuffer = 5,
    SetMaxClients = 6,
    EnableDissectors = 7,
    DisableDissectors = 8,
    ReloadConfig = 9,
    GetConfig = 10,
}

impl Command {
    fn from_wire(value: u32) -> Result<Self, Error> {
        Ok(match value {
            0 => Command::AddUser,
            1 => Command::DelUser,
            2 => Command::ListUsers,
            3 => Command::Stats,
            4 => Command::SetTimeout,
            5 => Command::SetBuffer,
            6 => Command::SetMaxClients,
            7 => Command::EnableDissectors,
            8 => Command::DisableDissectors,
            9 => Command::ReloadConfig,
            10 => Command::GetConfig,
            other => return Err(Error::ProtocolViolation(format!("unknown management command {other}"))),
        })
    }
}

/// A parsed management request. `SET_*` commands encode their numeric
/// argument as a decimal string in `username`, matching the original
/// protocol's reuse of the username field for scalar arguments.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub username: String,
    pub password: String,
}

pub async fn read_request(stream: &mut TcpStream) -> Result<Request, Error> {
    let command = Command::from_wire(read_u32_ne(stream).await?)?;
    let username = read_fixed_string(stream, MAX_USERNAME_LEN).await?;
    let password = read_fixed_string(stream, MAX_PASSWORD_LEN).await?;
    Ok(Request { command, username, password })
}

pub async fn write_request(stream: &mut TcpStream, req: &Request) -> Result<(), Error> {
    write_u32_ne(stream, req.command as u32).await?;
    write_fixed_string(stream, &req.username, MAX_USERNAME_LEN).await?;
    write_fixed_string(stream, &req.password, MAX_PASSWORD_LEN).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SimpleResponse {
    pub success: bool,
    pub message: String,
}

pub async fn read_simple_response(stream: &mut TcpStream) -> Result<SimpleResponse, Error> {
    let success = read_u32_ne(stream).await? != 0;
    let message = read_fixed_string(stream, MGMT_MESSAGE_LEN).await?;
    Ok(SimpleResponse { success, message })
}

pub async fn write_simple_response(stream: &mut TcpStream, resp: &SimpleResponse) -> Result<(), Error> {
    write_u32_ne(stream, resp.success as u32).await?;
    write_fixed_string(stream, &resp.message, MGMT_MESSAGE_LEN).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StatsResponse {
    pub success: bool,
    pub message: String,
    pub stats: GlobalStatsSnapshot,
    pub user_count: u32,
}

pub async fn write_stats_response(stream: &mut TcpStream, resp: &StatsResponse) -> Result<(), Error> {
    write_u32_ne(stream, resp.success as u32).await?;
    write_fixed_string(stream, &resp.message, MGMT_MESSAGE_LEN).await?;
    write_u64_ne(stream, resp.stats.total_connections).await?;
    write_u64_ne(stream, resp.stats.current_connections).await?;
    write_u64_ne(stream, resp.stats.total_bytes_transferred).await?;
    write_u64_ne(stream, resp.stats.current_bytes_transferred).await?;
    write_u64_ne(stream, resp.stats.peak_concurrent_connections).await?;
    write_u64_ne(stream, resp.stats.server_start_time.timestamp() as u64).await?;
    write_u32_ne(stream, resp.user_count).await?;
    Ok(())
}

pub async fn read_stats_response(stream: &mut TcpStream) -> Result<StatsResponse, Error> {
    let success = read_u32_ne(stream).await? != 0;
    let message = read_fixed_string(stream, MGMT_MESSAGE_LEN).await?;
    let total_connections = read_u64_ne(stream).await?;
    let current_connections = read_u64_ne(stream).await?;
    let total_bytes_transferred = read_u64_ne(stream).await?;
    let current_bytes_transferred = read_u64_ne(stream).await?;
    let peak_concurrent_connections = read_u64_ne(stream).await?;
    let server_start_time_epoch = read_u64_ne(stream).await?;
    let user_count = read_u32_ne(stream).await?;

    let server_start_time = chrono::DateTime::from_timestamp(server_start_time_epoch as i64, 0)
        .unwrap_or_else(chrono::Utc::now);

    Ok(StatsResponse {
        success,
        message,
        stats: GlobalStatsSnapshot {
            total_connections,
            current_connections,
            total_bytes_transferred,
            current_bytes_transferred,
            peak_concurrent_connections,
            server_start_time,
        },
        user_count,
    })
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub active: bool,
    pub total_connections: u64,
    pub current_connections: u64,
    pub total_bytes_transferred: u64,
}

#[derive(Debug, Clone)]
pub struct UsersResponse {
    pub success: bool,
    pub message: String,
    pub users: Vec<UserRecord>,
}

pub async fn write_users_response(stream: &mut TcpStream, resp: &UsersResponse) -> Result<(), Error> {
    write_u32_ne(stream, resp.success as u32).await?;
    write_fixed_string(stream, &resp.message, MGMT_MESSAGE_LEN).await?;
    write_u32_ne(stream, resp.users.len() as u32).await?;
    for user in &resp.users {
        write_fixed_string(stream, &user.username, MAX_USERNAME_LEN).await?;
        write_u32_ne(stream, user.active as u32).await?;
        write_u64_ne(stream, user.total_connections).await?;
        write_u64_ne(stream, user.current_connections).await?;
        write_u64_ne(stream, user.total_bytes_transferred).await?;
    }
    Ok(())
}

pub async fn read_users_response(stream: &mut TcpStream) -> Result<UsersResponse, Error> {
    let success = read_u32_ne(stream).await? != 0;
    let message = read_fixed_string(stream, MGMT_MESSAGE_LEN).await?;
    let count = read_u32_ne(stream).await?.min(MAX_USERS as u32);

    let mut users = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let username = read_fixed_string(stream, MAX_USERNAME_LEN).await?;
        let active = read_u32_ne(stream).await? != 0;
        let total_connections = read_u64_ne(stream).await?;
        let current_connections = read_u64_ne(stream).await?;
        let total_bytes_transferred = read_u64_ne(stream).await?;
        users.push(UserRecord { username, active, total_connections, current_connections, total_bytes_transferred });
    }

    Ok(UsersResponse { success, message, users })
}

#[derive(Debug, Clone)]
pub struct ConfigResponse {
    pub success: bool,
    pub message: String,
    pub timeout_ms: u32,
    pub buffer_size: u32,
    pub max_clients: u32,
    pub dissectors_enabled: bool,
}

pub async fn write_config_response(stream: &mut TcpStream, resp: &ConfigResponse) -> Result<(), Error> {
    write_u32_ne(stream, resp.success as u32).await?;
    write_fixed_string(stream, &resp.message, MGMT_MESSAGE_LEN).await?;
    write_u32_ne(stream, resp.timeout_ms).await?;
    write_u32_ne(stream, resp.buffer_size).await?;
    write_u32_ne(stream, resp.max_clients).await?;
    write_u32_ne(stream, resp.dissectors_enabled as u32).await?;
    Ok(())
}

pub async fn read_config_response(stream: &mut TcpStream) -> Result<ConfigResponse, Error> {
    let success = read_u32_ne(stream).await? != 0;
    let message = read_fixed_string(stream, MGMT_MESSAGE_LEN).await?;
    let timeout_ms = read_u32_ne(stream).await?;
    let buffer_size = read_u32_ne(stream).await?;
    let max_clients = read_u32_ne(stream).await?;
    let dissectors_enabled = read_u32_ne(stream).await? != 0;
    Ok(ConfigResponse { success, message, timeout_ms, buffer_size, max_clients, dissectors_enabled })
}

async fn read_u32_ne(stream: &mut TcpStream) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_ne_bytes(buf))
}

async fn write_u32_ne(stream: &mut TcpStream, value: u32) -> Result<(), Error> {
    stream.write_all(&value.to_ne_bytes()).await?;
    Ok(())
}

async fn read_u64_ne(stream: &mut TcpStream) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    Ok(u64::from_ne_bytes(buf))
}

async fn write_u64_ne(stream: &mut TcpStream, value: u64) -> Result<(), Error> {
    stream.write_all(&value.to_ne_bytes()).await?;
    Ok(())
}

/// Reads a nul-padded fixed-width field and trims at the first nul byte.
async fn read_fixed_string(stream: &mut TcpStream, width: usize) -> Result<String, Error> {
    let mut buf = vec![0u8; width];
    stream.read_exact(&mut buf).await?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Writes `value` into a `width`-byte nul-padded field, truncating if
/// necessary (mirrors the original struct's fixed `char[]` fields).
async fn write_fixed_string(stream: &mut TcpStream, value: &str, width: usize) -> Result<(), Error> {
    let mut buf = vec![0u8; width];
    let bytes = value.as_bytes();
    let copy_len = bytes.len().min(width.saturating_sub(1));
    buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
    stream.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn request_round_trips_through_the_wire() {
        let (mut client, mut server) = pair().await;
        let req = Request {
            command: Command::AddUser,
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        write_request(&mut client, &req).await.unwrap();

        let decoded = read_request(&mut server).await.unwrap();
        assert_eq!(decoded.command, Command::AddUser);
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.password, "secret");
    }

    #[tokio::test]
    async fn simple_response_round_trips() {
        let (mut client, mut server) = pair().await;
        let resp = SimpleResponse { success: true, message: "user added".to_string() };
        write_simple_response(&mut client, &resp).await.unwrap();

        let decoded = read_simple_response(&mut server).await.unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.message, "user added");
    }

    #[tokio::test]
    async fn config_response_round_trips() {
        let (mut client, mut server) = pair().await;
        let resp = ConfigResponse {
            success: true,
            message: "ok".to_string(),
            timeout_ms: 10_000,
            buffer_size: 4096,
            max_clients: 1024,
            dissectors_enabled: true,
        };
        write_config_response(&mut client, &resp).await.unwrap();

        let decoded = read_config_response(&mut server).await.unwrap();
        assert_eq!(decoded.timeout_ms, 10_000);
        assert_eq!(decoded.buffer_size, 4096);
        assert!(decoded.dissectors_enabled);
    }

    #[tokio::test]
    async fn users_response_round_trips_multiple_users() {
        let (mut client, mut server) = pair().await;
        let resp = UsersResponse {
            success: true,
            message: "ok".to_string(),
            users: vec![
                UserRecord {
                    username: "alice".to_string(),
                    active: true,
                    total_connections: 3,
                    current_connections: 1,
                    total_bytes_transferred: 2048,
                },
                UserRecord {
                    username: "bob".to_string(),
                    active: false,
                    total_connections: 0,
                    current_connections: 0,
                    total_bytes_transferred: 0,
                },
            ],
        };
        write_users_response(&mut client, &resp).await.unwrap();

        let decoded = read_users_response(&mut server).await.unwrap();
        assert_eq!(decoded.users.len(), 2);
        assert_eq!(decoded.users[0].username, "alice");
        assert!(!decoded.users[1].active);
    }
}
