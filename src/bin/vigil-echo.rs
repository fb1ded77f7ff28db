// Line echo service run as a vigil cluster

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vigil::worker::{ExceptionReporter, ServiceContext, ShutdownSignal};
use vigil::{Cluster, ClusterConfig, VigilError};

/// vigil-echo - a TCP line echo served by a pool of supervised workers
#[derive(Parser)]
#[command(name = "vigil-echo")]
#[command(version, about, long_about = None)]
struct Args {
    /// Cluster configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address every worker listens on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    listen: SocketAddr,

    /// Override the configured number of workers (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => ClusterConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.thresholds.pool_size = workers;
    }

    let listen = args.listen;
    Cluster::new(config)
        .run(move |ctx| serve(ctx, listen))
        .await?;

    Ok(())
}

/// Accept until told to stop, then wait for open connections to finish
async fn serve(mut ctx: ServiceContext, listen: SocketAddr) -> vigil::Result<()> {
    let listener = bind(listen)?;
    info!("Worker {} listening on {}", ctx.pid(), listen);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = ctx.shutdown() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Worker {} accepted {}", ctx.pid(), peer);
                    connections.spawn(echo(stream, ctx.shutdown_signal(), ctx.exceptions()));
                }
                Err(e) => warn!("Worker {} failed to accept: {}", ctx.pid(), e),
            },
            Some(result) = connections.join_next() => {
                if let Err(e) = result {
                    ctx.report_exception(format!("connection task failed: {}", e));
                }
            }
        }
    }

    // Stop accepting: the socket closes, peers go to the other workers
    drop(listener);
    info!(
        "Worker {} draining {} open connection(s)",
        ctx.pid(),
        connections.len()
    );

    while let Some(result) = connections.join_next().await {
        if let Err(e) = result {
            warn!("Connection task failed during drain: {}", e);
        }
    }

    Ok(())
}

fn bind(addr: SocketAddr) -> vigil::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Every worker binds the same port
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket
        .bind(addr)
        .map_err(|e| VigilError::ServiceError(format!("Failed to bind {}: {}", addr, e)))?;
    Ok(socket.listen(1024)?)
}

/// Echo lines back; a connection finishes its current line once draining starts
async fn echo(stream: TcpStream, mut shutdown: ShutdownSignal, exceptions: ExceptionReporter) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.recv() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim() == "fail" => {
                exceptions.report("client requested a failure");
                break;
            }
            Ok(Some(line)) => {
                let reply = format!("{}\n", line);
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Connection read failed: {}", e);
                break;
            }
        }
    }
}
