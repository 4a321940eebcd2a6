/// `socks5d`: the proxy binary. Wires together CLI flags, the optional
/// startup TOML file, shared state, and the two listeners (SOCKS5 and
/// management).
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use socks5d::admin::server as admin_server;
use socks5d::config::{RuntimeConfig, StartupFile};
use socks5d::logging::{self, AccessLog};
use socks5d::relay;
use socks5d::state::SharedState;

const DEFAULT_SOCKS_PORT: u16 = 1080;
const DEFAULT_MGMT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "socks5d", about = "SOCKS5 proxy with a management plane")]
struct Cli {
    /// SOCKS5 listener port (IPv6 ::).
    #[arg(long)]
    socks_port: Option<u16>,

    /// Management listener port (IPv4 127.0.0.1).
    #[arg(long)]
    mng_port: Option<u16>,

    /// Optional startup TOML seed file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Preload a user as `user:pass`; may be repeated.
    #[arg(long = "user", value_name = "USER:PASS")]
    user: Vec<String>,

    #[arg(long)]
    enable_dissectors: bool,

    #[arg(long, default_value = "auth.db")]
    db: PathBuf,

    #[arg(long, default_value = "pop3_credentials.log")]
    pop3_log: PathBuf,

    #[arg(long, default_value = "metrics.log")]
    access_log: PathBuf,

    /// Raises the log level to debug.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut runtime_config = RuntimeConfig::default();
    let mut socks_port = DEFAULT_SOCKS_PORT;
    let mut mgmt_port = DEFAULT_MGMT_PORT;
    let mut startup_users: Vec<(String, String)> = Vec::new();

    if let Some(path) = &cli.config {
        match StartupFile::load(path) {
            Ok(file) => {
                if let Some(v) = file.socks_port {
                    socks_port = v;
                }
                if let Some(v) = file.mgmt_port {
                    mgmt_port = v;
                }
                if let Some(v) = file.buffer_size {
                    runtime_config.buffer_size = v;
                }
                if let Some(v) = file.max_clients {
                    runtime_config.max_clients = v;
                }
                if let Some(v) = file.timeout_ms {
                    runtime_config.timeout_ms = v;
                }
                if let Some(v) = file.dissectors_enabled {
                    runtime_config.dissectors_enabled = v;
                }
                if let Some(v) = file.idle_timeout_secs {
                    runtime_config.idle_timeout_secs = v;
                }
                for user in file.users {
                    startup_users.push((user.username, user.password));
                }
            }
            Err(err) => log::warn!("could not load config file {}: {err}", path.display()),
        }
    } else {
        log::info!("no --config given; using built-in defaults");
    }

    // CLI flags win over the file, per SPEC_FULL.md §10.
    if let Some(port) = cli.socks_port {
        socks_port = port;
    }
    if let Some(port) = cli.mng_port {
        mgmt_port = port;
    }
    if cli.enable_dissectors {
        runtime_config.dissectors_enabled = true;
    }

    for raw in &cli.user {
        match raw.split_once(':') {
            Some((user, pass)) => startup_users.push((user.to_string(), pass.to_string())),
            None => log::warn!("ignoring malformed --user value (expected user:pass): {raw}"),
        }
    }

    let shared = SharedState::init(cli.db.clone(), runtime_config);
    for (user, pass) in &startup_users {
        shared.users.preload(user, pass);
    }

    let access_log = Arc::new(AccessLog::new(cli.access_log.clone()));

    let socks_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), socks_port);
    let socks_listener = match TcpListener::bind(socks_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("could not bind SOCKS5 listener on {socks_addr}: {err}");
            std::process::exit(1);
        }
    };
    log::info!("SOCKS5 listener bound on {socks_addr}");

    let mgmt_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), mgmt_port);
    let mgmt_listener = match TcpListener::bind(mgmt_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("could not bind management listener on {mgmt_addr}: {err}");
            std::process::exit(1);
        }
    };
    log::info!("management listener bound on {mgmt_addr}");

    let pop3_log_path = cli.pop3_log.clone();
    let socks_shared = shared.clone();
    let socks_task = tokio::spawn(run_socks_accept_loop(socks_listener, socks_shared, pop3_log_path, access_log));

    let mgmt_shared = shared.clone();
    let mgmt_task = tokio::spawn(admin_server::accept_loop(mgmt_listener, mgmt_shared));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, tearing down");
    shared.teardown();
    socks_task.abort();
    mgmt_task.abort();
}

async fn run_socks_accept_loop(
    listener: TcpListener,
    shared: Arc<SharedState>,
    pop3_log_path: PathBuf,
    access_log: Arc<AccessLog>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("socks5 accept failed: {err}");
                continue;
            }
        };

        let max_clients = shared.config.load().max_clients as u64;
        let current = shared.global_stats.current_connections.load(std::sync::atomic::Ordering::Relaxed);
        if current >= max_clients {
            log::warn!("max_clients ({max_clients}) reached, rejecting connection from {peer_addr}");
            drop(stream);
            continue;
        }

        let shared = shared.clone();
        let pop3_log_path = pop3_log_path.clone();
        let access_log = access_log.clone();
        tokio::spawn(relay::serve_client(stream, peer_addr, shared, pop3_log_path, access_log));
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            log::warn!("could not install SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
