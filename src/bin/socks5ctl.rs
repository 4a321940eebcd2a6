/// `socks5ctl`: the admin CLI, one flag per management command
/// (SPEC_FULL.md §6).
use std::net::{IpAddr, SocketAddr};

use clap::Parser;

use socks5d::admin::client;
use socks5d::admin::protocol::{ConfigResponse, SimpleResponse, StatsResponse, UsersResponse};
use socks5d::logging;

#[derive(Parser, Debug)]
#[command(name = "socks5ctl", about = "Admin client for the socks5d management plane")]
struct Cli {
    #[arg(short = 'u', long, value_name = "USER:PASS")]
    add_user: Option<String>,

    #[arg(short = 'd', long, value_name = "USER")]
    del_user: Option<String>,

    #[arg(short = 'l', long)]
    list_users: bool,

    #[arg(short = 's', long)]
    stats: bool,

    #[arg(short = 't', long, value_name = "MS")]
    set_timeout: Option<u64>,

    #[arg(short = 'b', long, value_name = "BYTES")]
    set_buffer: Option<u32>,

    #[arg(short = 'm', long, value_name = "N")]
    set_max_clients: Option<u32>,

    #[arg(short = 'e', long)]
    enable_dissectors: bool,

    #[arg(short = 'x', long)]
    disable_dissectors: bool,

    #[arg(short = 'r', long)]
    reload_config: bool,

    #[arg(short = 'c', long = "config")]
    get_config: bool,

    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(false);

    let addr = SocketAddr::new(cli.host, cli.port);
    let mut stream = match client::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => fail(&format!("could not connect to {addr}: {err}")),
    };

    let outcome = run_command(&cli, &mut stream).await;
    match outcome {
        Ok(Some(message)) => succeed(&message),
        Ok(None) => fail("no command given"),
        Err(message) => fail(&message),
    }
}

async fn run_command(cli: &Cli, stream: &mut tokio::net::TcpStream) -> Result<Option<String>, String> {
    if let Some(raw) = &cli.add_user {
        let (user, pass) = raw.split_once(':').ok_or_else(|| "expected user:pass".to_string())?;
        return simple(client::add_user(stream, user, pass).await);
    }
    if let Some(user) = &cli.del_user {
        return simple(client::del_user(stream, user).await);
    }
    if cli.list_users {
        return users(client::list_users(stream).await);
    }
    if cli.stats {
        return stats(client::stats(stream).await);
    }
    if let Some(ms) = cli.set_timeout {
        return simple(client::set_timeout(stream, ms).await);
    }
    if let Some(bytes) = cli.set_buffer {
        return simple(client::set_buffer(stream, bytes).await);
    }
    if let Some(n) = cli.set_max_clients {
        return simple(client::set_max_clients(stream, n).await);
    }
    if cli.enable_dissectors {
        return simple(client::set_dissectors_enabled(stream, true).await);
    }
    if cli.disable_dissectors {
        return simple(client::set_dissectors_enabled(stream, false).await);
    }
    if cli.reload_config {
        return simple(client::reload_config(stream).await);
    }
    if cli.get_config {
        return config(client::get_config(stream).await);
    }

    Ok(None)
}

fn simple(result: Result<SimpleResponse, socks5d::errors::Error>) -> Result<Option<String>, String> {
    match result {
        Ok(resp) if resp.success => Ok(Some(resp.message)),
        Ok(resp) => Err(resp.message),
        Err(err) => Err(err.to_string()),
    }
}

fn users(result: Result<UsersResponse, socks5d::errors::Error>) -> Result<Option<String>, String> {
    match result {
        Ok(resp) if resp.success => {
            let mut message = resp.message;
            for user in resp.users {
                message.push_str(&format!(
                    "\n  {} (connections: {}, bytes: {})",
                    user.username, user.total_connections, user.total_bytes_transferred
                ));
            }
            Ok(Some(message))
        }
        Ok(resp) => Err(resp.message),
        Err(err) => Err(err.to_string()),
    }
}

fn stats(result: Result<StatsResponse, socks5d::errors::Error>) -> Result<Option<String>, String> {
    match result {
        Ok(resp) if resp.success => Ok(Some(format!(
            "connections: {} total / {} current (peak {}), bytes: {} total, users: {}",
            resp.stats.total_connections,
            resp.stats.current_connections,
            resp.stats.peak_concurrent_connections,
            resp.stats.total_bytes_transferred,
            resp.user_count,
        ))),
        Ok(resp) => Err(resp.message),
        Err(err) => Err(err.to_string()),
    }
}

fn config(result: Result<ConfigResponse, socks5d::errors::Error>) -> Result<Option<String>, String> {
    match result {
        Ok(resp) if resp.success => Ok(Some(format!(
            "timeout_ms={} buffer_size={} max_clients={} dissectors_enabled={}",
            resp.timeout_ms, resp.buffer_size, resp.max_clients, resp.dissectors_enabled
        ))),
        Ok(resp) => Err(resp.message),
        Err(err) => Err(err.to_string()),
    }
}

fn succeed(message: &str) -> ! {
    println!("\u{2713} {message}");
    std::process::exit(0);
}

fn fail(message: &str) -> ! {
    println!("\u{2717} {message}");
    std::process::exit(1);
}
