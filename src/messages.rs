/// Helper functions to read/write one-off SOCKS5 protocol messages on a
/// `TcpStream` (greeting, sub-auth negotiation, CONNECT request/reply).
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    #[allow(dead_code)]
    ConnectionNotAllowed = 0x02,
    #[allow(dead_code)]
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    #[allow(dead_code)]
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// The client's greeting: offered authentication methods.
#[derive(Debug)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

pub async fn read_greeting(stream: &mut TcpStream) -> Result<Greeting, Error> {
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(Error::ProtocolViolation(format!("unsupported SOCKS version {version:#x}")));
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    Ok(Greeting { methods })
}

pub async fn write_method_selection(stream: &mut TcpStream, method: u8) -> Result<(), Error> {
    stream.write_all(&[SOCKS_VERSION, method]).await?;
    Ok(())
}

/// Drains whatever the client sends next, best-effort, when no acceptable
/// method was offered (SPEC_FULL.md §4.5 GREETING: "drains further input,
/// and errors").
pub async fn drain_best_effort(stream: &mut TcpStream) {
    let mut scratch = [0u8; 256];
    let _ = stream.try_read(&mut scratch);
}

#[derive(Debug)]
pub struct UserPassAuth {
    pub username: String,
    pub password: String,
}

/// A username or password longer than this, during sub-negotiation, is
/// rejected without consulting the user table (SPEC_FULL.md §4.5, §8).
pub const MAX_CREDENTIAL_LEN: usize = 255;

pub async fn read_userpass_auth(stream: &mut TcpStream) -> Result<UserPassAuth, Error> {
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(Error::ProtocolViolation(format!("unsupported sub-auth version {version:#x}")));
    }

    let ulen = stream.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    stream.read_exact(&mut uname).await?;

    let plen = stream.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    stream.read_exact(&mut passwd).await?;

    if ulen > MAX_CREDENTIAL_LEN || plen > MAX_CREDENTIAL_LEN {
        return Err(Error::AuthFailure);
    }

    let username = String::from_utf8(uname)
        .map_err(|_| Error::ProtocolViolation("username is not valid UTF-8".into()))?;
    let password = String::from_utf8(passwd)
        .map_err(|_| Error::ProtocolViolation("password is not valid UTF-8".into()))?;

    Ok(UserPassAuth { username, password })
}

pub async fn write_userpass_reply(stream: &mut TcpStream, success: bool) -> Result<(), Error> {
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[AUTH_VERSION, status]).await?;
    Ok(())
}

/// A resolved-or-not-yet-resolved CONNECT destination.
#[derive(Debug, Clone)]
pub enum Destination {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug)]
pub struct ConnectRequest {
    pub destination: Destination,
    pub port: u16,
}

pub async fn read_connect_request(stream: &mut TcpStream) -> Result<ConnectRequest, Error> {
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(Error::ProtocolViolation(format!("unsupported SOCKS version {version:#x}")));
    }

    let cmd = stream.read_u8().await?;
    let _rsv = stream.read_u8().await?;
    let atyp = stream.read_u8().await?;

    if cmd != CMD_CONNECT {
        return Err(ReplyableError::new(ReplyCode::CommandNotSupported).into());
    }

    let destination = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Destination::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::ProtocolViolation("domain name is not valid UTF-8".into()))?;
            Destination::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Destination::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => return Err(ReplyableError::new(ReplyCode::AddressTypeNotSupported).into()),
    };

    let port = stream.read_u16().await?;

    Ok(ConnectRequest { destination, port })
}

pub async fn write_connect_reply(
    stream: &mut TcpStream,
    code: ReplyCode,
    bound: Option<SocketAddr>,
) -> Result<(), Error> {
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let mut frame = vec![SOCKS_VERSION, code as u8, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&addr.ip().octets());
        }
    }
    frame.extend_from_slice(&bound.port().to_be_bytes());

    stream.write_all(&frame).await?;
    Ok(())
}

/// Carries a specific SOCKS5 reply code through `?` so `read_connect_request`
/// can report `0x07`/`0x08` for malformed-but-structurally-readable requests
/// without the caller needing to re-derive the code from a generic variant.
#[derive(Debug)]
pub struct ReplyableError {
    pub code: ReplyCode,
}

impl ReplyableError {
    fn new(code: ReplyCode) -> Self {
        Self { code }
    }
}

impl From<ReplyableError> for Error {
    fn from(err: ReplyableError) -> Self {
        Error::ProtocolViolation(format!("{:?}", err.code))
    }
}
