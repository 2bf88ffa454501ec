//! tinyredis server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tinyredis::config::{DEFAULT_HZ, DEFAULT_PORT};
use tinyredis::server::install_signal_handlers;
use tinyredis::{Server, ServerConfig, VERSION};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

/// Single-threaded in-memory key-value server speaking the Redis protocol
#[derive(Parser, Debug)]
#[command(name = "tinyredis-server")]
#[command(version)]
struct Args {
    /// Address to bind the TCP listener to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// TCP port, 0 picks an ephemeral port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Also listen on this Unix domain socket
    #[arg(long)]
    unixsocket: Option<PathBuf>,

    /// Listen backlog
    #[arg(long, default_value_t = 511)]
    tcp_backlog: i32,

    /// TCP keepalive interval in seconds, 0 disables it
    #[arg(long, default_value_t = 0)]
    tcp_keepalive: u64,

    /// Maximum number of connected clients
    #[arg(long, default_value_t = 10_000)]
    maxclients: usize,

    /// Number of databases
    #[arg(long, default_value_t = 16)]
    databases: usize,

    /// Server cron frequency
    #[arg(long, default_value_t = DEFAULT_HZ)]
    hz: u32,

    /// Close clients idle for this many seconds, 0 never does
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Disable incremental rehashing from the cron
    #[arg(long)]
    no_activerehashing: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    loglevel: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            unixsocket: self.unixsocket,
            tcp_backlog: self.tcp_backlog,
            tcp_keepalive: self.tcp_keepalive,
            maxclients: self.maxclients,
            databases: self.databases,
            hz: self.hz,
            maxidletime: self.timeout,
            active_rehashing: !self.no_activerehashing,
            ..ServerConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.loglevel));
    fmt().with_env_filter(filter).with_target(false).init();

    info!(version = VERSION, pid = std::process::id(), "tinyredis starting");
    install_signal_handlers().context("installing signal handlers")?;

    let mut server = Server::new(args.into_config()).context("creating server")?;
    server.listen().context("starting listeners")?;
    server.serve().context("event loop failed")?;
    Ok(())
}
