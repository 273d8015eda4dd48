//! Shared engines and client helpers for integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use baton::{ConnHandle, ConnState, ListenerHandle, RequestEngine, ServeError, Server, ServerConfig};

/// Concurrency counters shared between a test and its engine.
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct Stats {
    /// Connections currently inside the engine.
    pub current: AtomicUsize,
    /// Highest concurrency ever observed.
    pub peak: AtomicUsize,
    /// Connections fully served.
    pub served: AtomicUsize,
}

/// Engine that greets each admitted connection with one `+` byte, then holds
/// it until the client closes its end. Tests use the greeting to observe
/// admission and the client-side close to control connection lifetime.
pub struct GreetingEngine {
    pub stats: Arc<Stats>,
}

#[async_trait]
impl RequestEngine for GreetingEngine {
    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        _peer: SocketAddr,
        mut conn: ConnHandle,
    ) -> std::io::Result<()> {
        conn.report(ConnState::New);
        let current = self.stats.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(current, Ordering::SeqCst);

        let held = async {
            use tokio::io::AsyncWriteExt;
            stream.write_all(b"+").await?;
            let mut buf = [0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            Ok(())
        }
        .await;

        self.stats.current.fetch_sub(1, Ordering::SeqCst);
        self.stats.served.fetch_add(1, Ordering::SeqCst);
        conn.report(ConnState::Closed);
        held
    }
}

/// Bind an ephemeral listener and start serving on a spawned task.
#[allow(dead_code)]
pub async fn start_server(
    throttle_max: usize,
) -> (Arc<Server>, SocketAddr, Arc<Stats>, JoinHandle<Result<(), ServeError>>) {
    let stats = Arc::new(Stats::default());
    let config = ServerConfig { throttle_max, ..Default::default() };
    let server = Arc::new(Server::new(config, GreetingEngine { stats: Arc::clone(&stats) }));

    let listener = ListenerHandle::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serve_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };
    // Let the accept loop reach its first accept.
    tokio::time::sleep(Duration::from_millis(30)).await;

    (server, addr, stats, serve_task)
}

/// Connect and wait for the engine's greeting, i.e. for actual admission.
#[allow(dead_code)]
pub async fn connect_admitted(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut greeting = [0u8; 1];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"+");
    stream
}

/// Poll `condition` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
