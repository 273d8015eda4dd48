//! Listener handoff from a live server.

use std::time::Duration;

use baton::{HandoffError, HandoffRequest, Lifecycle};

mod common;

#[tokio::test]
async fn failed_handoff_leaves_the_server_serving() {
    let (server, addr, _stats, serve_task) = common::start_server(4).await;

    let request = HandoffRequest::new("/nonexistent/replacement-binary");
    match server.handoff(&request) {
        Err(HandoffError::Spawn(_)) => {}
        other => panic!("expected Spawn error, got {other:?}"),
    }

    // No shutdown was triggered and admissions still work.
    assert_eq!(server.state(), Lifecycle::Running);
    let stream = common::connect_admitted(addr).await;

    drop(stream);
    server.stop_and_wait().await;
    serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn replacement_serves_on_the_same_address() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (server, addr, _stats, serve_task) = common::start_server(4).await;

    // Hand the socket to a real resuming instance of the demo binary.
    let request = HandoffRequest::new(env!("CARGO_BIN_EXE_baton-demo"))
        .arg("--addr")
        .arg(addr.to_string())
        .arg("--restarts")
        .arg("0");
    let mut child = server.handoff(&request).expect("handoff failed");

    // The old instance drains and exits on its own.
    tokio::time::timeout(Duration::from_secs(2), server.wait_stopped())
        .await
        .expect("instance did not stop after the handoff");
    serve_task.await.unwrap().unwrap();

    // The same address keeps answering: the replacement adopted the socket,
    // so this connection waits in its queue rather than being refused.
    let exchange = async {
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        std::io::Result::Ok(response)
    };
    let response = tokio::time::timeout(Duration::from_secs(10), exchange)
        .await
        .expect("no response from the replacement")
        .unwrap();
    assert!(
        response.starts_with(b"HTTP/1.1 200"),
        "unexpected response: {:?}",
        String::from_utf8_lossy(&response)
    );

    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn successful_handoff_retires_this_instance() {
    let (server, _addr, _stats, serve_task) = common::start_server(4).await;

    // Any program that accepts an inherited descriptor and exits will do.
    let request = HandoffRequest::new("/bin/true");
    let mut child = server.handoff(&request).expect("handoff failed");

    // The local instance drains on its own once the replacement is running.
    tokio::time::timeout(Duration::from_secs(2), server.wait_stopped())
        .await
        .expect("instance did not stop after a successful handoff");
    assert_eq!(server.state(), Lifecycle::Stopped);
    serve_task.await.unwrap().unwrap();

    let status = child.wait().unwrap();
    assert!(status.success());
}
