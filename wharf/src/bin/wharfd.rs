//! wharfd - NBD block-export daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wharf::control::{Request, Response};
use wharf::{Config, Daemon};

#[derive(Parser)]
#[command(name = "wharfd", about = "NBD block-export daemon")]
struct Cli {
    /// Path to config file. If omitted, starts with no exports; add some
    /// with `wharfctl export add`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NBD listen address. Overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Control socket path. Overrides the config file.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(listen) = cli.listen {
        config.nbd.address = listen;
    }
    if let Some(socket) = cli.socket {
        config.socket = socket;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Control socket setup
    if let Some(parent) = config.socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if config.socket.exists() {
        std::fs::remove_file(&config.socket)?;
    }
    let socket_path = config.socket.clone();

    let daemon = Arc::new(
        Daemon::from_config(config)
            .await
            .context("failed to start daemon")?,
    );

    let control_listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket: {}", socket_path.display()))?;

    info!(
        socket = %socket_path.display(),
        nbd = %daemon.nbd_address(),
        exports = daemon.export_list().len(),
        "wharfd started"
    );

    // NBD accept loop
    let nbd_addr = daemon.nbd_address().to_string();
    let nbd_handle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&nbd_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, address = %nbd_addr, "failed to bind NBD listener");
                    return;
                }
            };
            info!(address = %nbd_addr, "NBD server listening");
            if let Err(e) = daemon.listen(listener).await {
                error!(error = %e, "NBD server error");
            }
        })
    };

    // Control socket handler
    let control_handle = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move {
            loop {
                match control_listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(e) = handle_control(stream, daemon).await {
                                error!(error = %e, "control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "control accept error");
                        break;
                    }
                }
            }
        }
    });

    // Wait for shutdown signal
    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("failed to wait for Ctrl+C");
            info!("received SIGINT");
        }
    };
    shutdown.await;

    daemon.shutdown();
    nbd_handle.abort();
    control_handle.abort();
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}

async fn handle_control(stream: tokio::net::UnixStream, daemon: Arc<Daemon>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let resp = serde_json::to_string(&Response::Error(e.to_string()))? + "\n";
                writer.write_all(resp.as_bytes()).await?;
                continue;
            }
        };

        let response = process_request(&daemon, request).await;
        let resp = serde_json::to_string(&response)? + "\n";
        writer.write_all(resp.as_bytes()).await?;
    }
}

async fn process_request(daemon: &Daemon, request: Request) -> Response {
    match request {
        Request::ExportAdd(spec) => match daemon.export_add(&spec).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ExportRemove { name } => match daemon.export_remove(&name) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ExportList => Response::Exports(daemon.export_list()),
        Request::Status => Response::Status(daemon.status()),
    }
}
