//! wharfctl - CLI client for wharfd.
//!
//! Usage:
//!   wharfctl export add <name> --backing memory:1073741824
//!   wharfctl export add <name> --backing file:/var/lib/wharf/a.img --read-only
//!   wharfctl export remove <name>
//!   wharfctl export list
//!   wharfctl status

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use wharf::config::{Backing, ExportConfig};
use wharf::control::{Request, Response};

const DEFAULT_SOCKET_PATH: &str = "/run/wharf/wharfd.sock";

#[derive(Parser)]
#[command(name = "wharfctl")]
#[command(about = "Control a running wharfd")]
struct Cli {
    /// Control socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export management
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Create an export and bind its name
    Add {
        /// Export name
        name: String,
        /// Backing volume: file:<path> or memory:<bytes>
        #[arg(long)]
        backing: String,
        /// Refuse writes from clients
        #[arg(long)]
        read_only: bool,
        /// Byte offset of the export within the backing volume
        #[arg(long, default_value_t = 0)]
        dev_offset: u64,
        /// Effective size; defaults to everything behind the offset
        #[arg(long)]
        size_bytes: Option<u64>,
    },
    /// Unbind an export, disconnecting its clients
    Remove {
        /// Export name
        name: String,
    },
    /// List exports
    List,
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

async fn send_request(socket: &PathBuf, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to wharfd at {}", socket.display()))?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let req_json = serde_json::to_string(&request)? + "\n";
    writer.write_all(req_json.as_bytes()).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: Response = serde_json::from_str(&line)?;

    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Export { command } => match command {
            ExportCommands::Add {
                name,
                backing,
                read_only,
                dev_offset,
                size_bytes,
            } => Request::ExportAdd(ExportConfig {
                name,
                backing: Backing::parse(&backing)?,
                read_only,
                dev_offset,
                size_bytes,
            }),
            ExportCommands::Remove { name } => Request::ExportRemove { name },
            ExportCommands::List => Request::ExportList,
        },
        Commands::Status => Request::Status,
    };

    let response = send_request(&cli.socket, request).await?;

    match response {
        Response::Ok => {
            println!("OK");
        }
        Response::Error(msg) => {
            eprintln!("Error: {msg}");
            std::process::exit(1);
        }
        Response::Exports(exports) => {
            if exports.is_empty() {
                println!("No exports");
            } else {
                println!("{:<30} {:>12} {:>6}", "NAME", "SIZE", "MODE");
                for export in exports {
                    println!(
                        "{:<30} {:>12} {:>6}",
                        export.name,
                        format_size(export.size_bytes),
                        if export.read_only { "ro" } else { "rw" }
                    );
                }
            }
        }
        Response::Status(status) => {
            println!("wharfd status:");
            println!("  NBD:         {}", status.nbd_address);
            println!("  Exports:     {}", status.export_count);
            println!("  Connections: {}", status.active_connections);
        }
    }

    Ok(())
}
