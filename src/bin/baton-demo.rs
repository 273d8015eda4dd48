//! Zero-downtime restart demo.
//!
//! Run with `--restarts N` and send SIGINT (ctrl+c): while restarts remain,
//! the process spawns a replacement of itself, hands it the listening socket
//! and drains; once they are used up, SIGINT shuts down gracefully. The
//! served address never refuses a connection across restarts.

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baton::{ConnHandle, ConnState, HandoffRequest, RequestEngine, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "baton-demo", about = "Graceful server with zero-downtime restarts")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Number of zero-downtime restarts before a plain shutdown.
    #[arg(long, default_value_t = 0)]
    restarts: u32,

    /// Optional TOML config file; flags still win for the bind address.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// A minimal engine: answer any request with one plain-text response and
/// close. Stands in for a real HTTP engine behind the same trait.
struct DemoEngine {
    restarts_left: u32,
}

#[async_trait]
impl RequestEngine for DemoEngine {
    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        _peer: SocketAddr,
        mut conn: ConnHandle,
    ) -> std::io::Result<()> {
        conn.report(ConnState::New);

        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request).await;

        let mut body = Vec::new();
        let _ = writeln!(
            body,
            "Hello from pid {}. {} zero-downtime restarts to go.",
            std::process::id(),
            self.restarts_left
        );
        let mut response = Vec::new();
        let _ = write!(
            response,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        response.extend_from_slice(&body);

        stream.write_all(&response).await?;
        stream.shutdown().await?;
        conn.report(ConnState::Closed);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "baton=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    config.bind_address = args.addr.clone();

    let server = Arc::new(Server::new(config, DemoEngine { restarts_left: args.restarts }));

    // Signal glue: ctrl+c either retires this instance behind a replacement
    // or shuts it down, depending on how many restarts remain.
    {
        let server = Arc::clone(&server);
        let addr = args.addr.clone();
        let restarts = args.restarts;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if restarts == 0 {
                tracing::info!("caught interrupt, shutting down gracefully");
                server.stop();
            } else {
                tracing::info!("caught interrupt, restarting with zero downtime");
                let program = match std::env::current_exe() {
                    Ok(program) => program,
                    Err(error) => {
                        tracing::error!(%error, "cannot locate own executable, stopping instead");
                        server.stop();
                        return;
                    }
                };
                let request = HandoffRequest::new(program)
                    .arg("--addr")
                    .arg(&addr)
                    .arg("--restarts")
                    .arg((restarts - 1).to_string());
                match server.handoff(&request) {
                    Ok(child) => {
                        tracing::info!(child_pid = child.id(), "replacement process running")
                    }
                    Err(error) => tracing::error!(%error, "handoff failed, still serving"),
                }
            }
        });
    }

    if baton::can_resume() {
        tracing::info!(pid = std::process::id(), "resuming on inherited listener");
        server.resume_and_serve().await?;
    } else {
        tracing::info!(pid = std::process::id(), address = %args.addr, "serving");
        server.listen_and_serve().await?;
    }

    tracing::info!(pid = std::process::id(), "instance retired");
    Ok(())
}
