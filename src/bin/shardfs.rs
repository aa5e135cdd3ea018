//! ShardFS command-line client

use clap::{Parser, Subcommand};
use shardfs::api::{ApiError, ShardFs};
use shardfs::config::ServerConfig;
use shardfs::metadata::{EntryAttr, InodeType};
use shardfs::rpc::client::RetryPolicy;
use shardfs::rpc::tcp::TcpTransport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shardfs")]
#[command(about = "ShardFS command-line client")]
struct Args {
    /// Cluster configuration file (same format as the server's)
    #[arg(long, default_value = "shardfs.toml")]
    config: PathBuf,

    /// Server addresses in server id order; overrides the config file
    #[arg(long, value_delimiter = ',')]
    servers: Vec<SocketAddr>,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Create an empty file
    Touch {
        path: String,
        #[arg(long, default_value = "644", value_parser = parse_mode)]
        mode: u32,
    },
    /// Show attributes
    Stat { path: String },
    /// List a directory
    Ls { path: String },
    /// Write a string into a file
    Write {
        path: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Print a file's contents
    Cat { path: String },
    /// Remove a file
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Change permission bits
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        path: String,
    },
    /// Show a directory's partition map
    Map { path: String },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| e.to_string())
}

fn print_attr(path: &str, attr: &EntryAttr) {
    let kind = match attr.inode_type {
        InodeType::Directory => "directory",
        InodeType::File => "file",
    };
    println!(
        "{}: {} inode={} mode={:o} size={}",
        path, kind, attr.inode, attr.permissions.mode, attr.size
    );
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    shardfs::logging::init_with_hostname(&args.log_level);

    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };
    let addrs = if args.servers.is_empty() {
        config.server_addrs()?
    } else {
        args.servers.clone()
    };

    let transport = Arc::new(TcpTransport::new(addrs));
    let fs = ShardFs::new(transport, RetryPolicy::from_network(&config.network));

    match args.command {
        Command::Mkdir { path, mode } => print_attr(&path, &fs.mkdir(&path, mode)?),
        Command::Touch { path, mode } => print_attr(&path, &fs.create(&path, mode)?),
        Command::Stat { path } => print_attr(&path, &fs.stat(&path)?),
        Command::Ls { path } => {
            for entry in fs.readdir(&path)? {
                let suffix = if entry.inode_type == InodeType::Directory { "/" } else { "" };
                println!("{}{}", entry.name, suffix);
            }
        }
        Command::Write { path, data, offset } => {
            let n = fs.write(&path, offset, data.as_bytes())?;
            println!("wrote {} bytes", n);
        }
        Command::Cat { path } => {
            let attr = fs.stat(&path)?;
            let data = fs.read(&path, 0, attr.size)?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Rm { path } => fs.unlink(&path)?,
        Command::Rmdir { path } => fs.rmdir(&path)?,
        Command::Chmod { mode, path } => print_attr(&path, &fs.chmod(&path, mode)?),
        Command::Map { path } => {
            let dir = fs.open_dir(&path)?;
            let map = fs
                .client()
                .get_partition_map(dir)
                .map_err(|e| ApiError::from_rpc(&path, e))?;
            println!("{:?}", map);
            for partition in map.partitions() {
                println!("  partition {} -> server {}", partition, map.server_for_index(partition));
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("shardfs: {}", e);
        std::process::exit(1);
    }
}
