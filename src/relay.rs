/// Connection lifecycle and bidirectional byte pump (component F): drives
/// a single accepted client through GREETING → AUTH → REQUEST → CONNECTING →
/// RELAYING → DONE/ERROR (SPEC_FULL.md §4.5), then pumps bytes until either
/// side closes or an idle timeout fires.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::logging::AccessLog;
use crate::messages::{self, ReplyCode};
use crate::pop3;
use crate::socks5;
use crate::state::SharedState;

const POP3_PORT: u16 = 110;

/// Runs one accepted connection end to end. Any protocol or connect error
/// is logged and the socket is dropped; the caller (the accept loop) never
/// needs to inspect the outcome.
pub async fn serve_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<SharedState>,
    pop3_log_path: PathBuf,
    access_log: Arc<AccessLog>,
) {
    let connection_id = shared.next_connection_id();
    shared.update_global_stats(0, 1);

    let outcome =
        drive_connection(stream, peer_addr, &shared, &pop3_log_path, &access_log, connection_id).await;

    let username = match &outcome {
        Ok(username) => username.clone(),
        Err((username, _)) => username.clone(),
    };

    match &outcome {
        Ok(_) => log::info!("connection {connection_id} from {peer_addr} closed"),
        Err((_, err)) => log::warn!("connection {connection_id} from {peer_addr} failed: {err}"),
    }

    if let Some(user) = username {
        shared.update_user_stats(&user, 0, -1);
    } else {
        shared.update_global_stats(0, -1);
    }
}

/// Returns the authenticated username (if any) on success, or it alongside
/// the error on failure, so the caller can always charge the right stats
/// bucket on teardown.
async fn drive_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    shared: &Arc<SharedState>,
    pop3_log_path: &PathBuf,
    access_log: &AccessLog,
    connection_id: u64,
) -> Result<Option<String>, (Option<String>, crate::errors::Error)> {
    let method = socks5::handle_greeting(&mut stream, shared).await.map_err(|e| (None, e))?;

    let username = if method == messages::METHOD_USERPASS {
        match socks5::handle_auth(&mut stream, shared).await {
            Ok(name) => Some(name),
            Err(e) => {
                access_log.record(None, "FAIL_AUTH", &peer_addr.to_string());
                return Err((None, e));
            }
        }
    } else {
        None
    };

    let request = socks5::handle_request(&mut stream).await.map_err(|e| (username.clone(), e))?;
    let dest_port = request.port;

    let config = shared.config.load();
    let outcome = match socks5::connect_to_destination(&request, config.timeout_ms).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let code = socks5::reply_code_for(&err);
            let _ = messages::write_connect_reply(&mut stream, code, None).await;
            access_log.record(username.as_deref(), "FAIL_CONNECT", &format!("port {dest_port}"));
            return Err((username, err));
        }
    };

    if let Err(e) =
        messages::write_connect_reply(&mut stream, ReplyCode::Succeeded, Some(outcome.bound_addr)).await
    {
        return Err((username, e));
    }

    if let Some(user) = &username {
        shared.note_user_connection_open(user);
    }

    access_log.record(username.as_deref(), "OK", &format!("port {dest_port}"));
    log::info!(
        "connection {connection_id} from {peer_addr} relaying to {dest_port} (user={:?})",
        username
    );

    let ctx = ConnectionContext {
        peer_addr,
        dest_port,
        username: username.clone(),
        dissectors_enabled: config.dissectors_enabled,
        pop3_log_path: pop3_log_path.clone(),
        idle_timeout_secs: config.idle_timeout_secs,
    };

    relay(stream, outcome.remote, shared, &ctx)
        .await
        .map_err(crate::errors::Error::from)
        .map_err(|e| (username.clone(), e))?;

    Ok(username)
}

pub struct ConnectionContext {
    pub peer_addr: SocketAddr,
    pub dest_port: u16,
    pub username: Option<String>,
    pub dissectors_enabled: bool,
    pub pop3_log_path: PathBuf,
    pub idle_timeout_secs: u64,
}

/// Holds bytes read from one side but not yet written to the other,
/// honoring the `offset <= len <= capacity` pending-write invariant from
/// the source's single-threaded event loop (SPEC_FULL.md §4.6). Under
/// Tokio, `write_all` already blocks until the kernel accepts every byte,
/// so in practice the buffer never holds data across iterations; the
/// capacity check below is what would throttle reads if a future caller
/// switched to non-blocking partial writes.
struct PendingWrite {
    buffer: BytesMut,
    capacity: usize,
}

impl PendingWrite {
    fn new(capacity: usize) -> Self {
        Self { buffer: BytesMut::with_capacity(capacity), capacity }
    }

    fn has_capacity(&self) -> bool {
        self.buffer.len() < self.capacity
    }
}

/// Runs the RELAYING phase until either side closes or the idle timeout
/// (if any) fires. Returns once both directions have stopped.
pub async fn relay(
    client: TcpStream,
    remote: TcpStream,
    shared: &Arc<SharedState>,
    ctx: &ConnectionContext,
) -> io::Result<()> {
    pop3::reset();

    let (client_r, client_w) = client.into_split();
    let (remote_r, remote_w) = remote.into_split();

    let activity = Arc::new(Notify::new());
    let total_bytes = Arc::new(AtomicU64::new(0));
    let dissect = ctx.dissectors_enabled && ctx.dest_port == POP3_PORT;

    let client_to_remote = pump(
        client_r,
        remote_w,
        shared.clone(),
        ctx.username.clone(),
        total_bytes.clone(),
        activity.clone(),
        if dissect {
            Some((ctx.peer_addr.ip().to_string(), ctx.pop3_log_path.clone()))
        } else {
            None
        },
    );
    let remote_to_client = pump(
        remote_r,
        client_w,
        shared.clone(),
        ctx.username.clone(),
        total_bytes.clone(),
        activity.clone(),
        None,
    );

    tokio::pin!(client_to_remote);
    tokio::pin!(remote_to_client);

    let idle_secs = ctx.idle_timeout_secs;
    let watchdog = async move {
        if idle_secs == 0 {
            std::future::pending::<()>().await;
        }
        loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(idle_secs)) => return,
                _ = activity.notified() => continue,
            }
        }
    };
    tokio::pin!(watchdog);

    tokio::select! {
        _ = &mut client_to_remote => {}
        _ = &mut remote_to_client => {}
        _ = &mut watchdog => {
            log::info!("connection idle for {idle_secs}s, tearing down");
        }
    }

    let _ = total_bytes.load(Ordering::Relaxed);
    Ok(())
}

async fn pump(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    shared: Arc<SharedState>,
    username: Option<String>,
    total_bytes: Arc<AtomicU64>,
    activity: Arc<Notify>,
    dissect: Option<(String, PathBuf)>,
) -> io::Result<()> {
    let buffer_size = shared.config.buffer_size_hint().max(1) as usize;
    let mut pending = PendingWrite::new(buffer_size);
    let mut read_buf = vec![0u8; buffer_size];

    loop {
        if !pending.has_capacity() {
            flush(&mut writer, &mut pending, &shared, &username, &total_bytes, &activity).await?;
            continue;
        }

        let capacity_left = pending.capacity - pending.buffer.len();
        let n = reader.read(&mut read_buf[..capacity_left]).await?;
        if n == 0 {
            flush(&mut writer, &mut pending, &shared, &username, &total_bytes, &activity).await?;
            return Ok(());
        }

        if let Some((source_ip, log_path)) = &dissect {
            pop3::process(&read_buf[..n], source_ip, log_path);
        }

        pending.buffer.extend_from_slice(&read_buf[..n]);
        flush(&mut writer, &mut pending, &shared, &username, &total_bytes, &activity).await?;
    }
}

async fn flush(
    writer: &mut OwnedWriteHalf,
    pending: &mut PendingWrite,
    shared: &Arc<SharedState>,
    username: &Option<String>,
    total_bytes: &Arc<AtomicU64>,
    activity: &Notify,
) -> io::Result<()> {
    if pending.buffer.is_empty() {
        return Ok(());
    }

    let written = pending.buffer.len();
    writer.write_all(&pending.buffer).await?;
    pending.buffer.clear();

    total_bytes.fetch_add(written as u64, Ordering::Relaxed);
    match username {
        Some(user) => shared.update_user_stats(user, written as u64, 0),
        None => shared.update_global_stats(written as u64, 0),
    }
    activity.notify_one();
    Ok(())
}
