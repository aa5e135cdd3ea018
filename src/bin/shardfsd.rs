//! ShardFS metadata server daemon
//!
//! Loads a TOML configuration, starts one metadata server and serves it over
//! TCP until SIGINT or SIGTERM.

use clap::Parser;
use shardfs::config::ServerConfig;
use shardfs::rpc::server_list::{
    append_to_server_list, find_server, read_server_list_with_retry,
};
use shardfs::rpc::tcp::{TcpServer, TcpTransport};
use shardfs::server::{setup_signal_handlers, NodeOptions, ServerNode};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "shardfsd")]
#[command(about = "ShardFS metadata server")]
struct Args {
    /// Configuration file
    #[arg(default_value = "shardfs.toml")]
    config: PathBuf,

    /// Override node.server_id
    #[arg(long)]
    server_id: Option<u32>,

    /// Override network.bind_addr
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override node.log_level
    #[arg(long)]
    log_level: Option<String>,

    /// Append this server to cluster.server_list before starting
    #[arg(long)]
    register: bool,

    /// With --register: wait until this many servers are listed
    #[arg(long, default_value_t = 1)]
    expected_servers: usize,
}

fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        eprintln!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
        ServerConfig::default()
    };

    if let Some(id) = args.server_id {
        config.node.server_id = id;
    }
    if let Some(bind) = args.bind {
        config.network.bind_addr = bind.to_string();
    }
    if let Some(level) = &args.log_level {
        config.node.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

/// クラスタのアドレス一覧 (index = server id)
fn cluster_addrs(
    args: &Args,
    config: &ServerConfig,
    bind: SocketAddr,
) -> Result<Vec<SocketAddr>, Box<dyn std::error::Error>> {
    if args.register {
        let Some(path) = &config.cluster.server_list else {
            return Err("--register needs cluster.server_list".into());
        };
        append_to_server_list(path, config.node.server_id, bind)?;

        loop {
            let servers = read_server_list_with_retry(path, 100, Duration::from_millis(100))?;
            if servers.len() >= args.expected_servers {
                find_server(&servers, config.node.server_id)?;
                break;
            }
            tracing::info!(
                "Waiting for servers: {}/{} registered",
                servers.len(),
                args.expected_servers
            );
            std::thread::sleep(Duration::from_millis(200));
        }
    }
    Ok(config.server_addrs()?)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    shardfs::logging::init_for_server(&config.node.log_level, config.node.server_id);

    let bind: SocketAddr = config.network.bind_addr.parse()?;
    let addrs = cluster_addrs(&args, &config, bind)?;
    let server_count = addrs.len() as u32;

    tracing::info!("Starting ShardFS server {}", config.node.server_id);
    tracing::info!("Cluster: {} servers", server_count);
    tracing::info!("Bind address: {}", bind);
    if let Some(dir) = &config.node.data_dir {
        tracing::info!("Data directory: {}", dir.display());
    }

    let running = Arc::new(AtomicBool::new(true));
    setup_signal_handlers(running.clone());

    let transport = Arc::new(TcpTransport::new(addrs));
    let mut node = ServerNode::start(NodeOptions::from_config(&config, server_count), transport)?;
    let mut server = TcpServer::bind(bind, node.handler())?;

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("Shutting down");
    server.shutdown();
    node.shutdown()?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("shardfsd: {}", e);
        std::process::exit(1);
    }
}
