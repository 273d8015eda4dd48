//! Admission-control behavior observed from the outside.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use baton::ThrottleError;

mod common;

#[tokio::test]
async fn ceiling_bounds_concurrency_and_everyone_is_served() {
    let (server, addr, stats, serve_task) = common::start_server(10).await;

    let mut clients = Vec::new();
    for _ in 0..60 {
        clients.push(tokio::spawn(async move {
            let stream = common::connect_admitted(addr).await;
            // Hold the slot briefly so concurrency is actually contended.
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(stream);
        }));
    }
    for client in clients {
        tokio::time::timeout(Duration::from_secs(10), client).await.unwrap().unwrap();
    }

    assert!(
        common::wait_until(Duration::from_secs(5), || stats.served.load(Ordering::SeqCst) == 60)
            .await,
        "only {} of 60 connections served",
        stats.served.load(Ordering::SeqCst)
    );
    let peak = stats.peak.load(Ordering::SeqCst);
    assert!(peak <= 10, "peak concurrency {peak} exceeded ceiling 10");
    assert!(peak > 1, "test never exercised concurrency");

    server.stop_and_wait().await;
    serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_ceiling_blocks_new_admissions_but_not_in_flight_work() {
    let (server, addr, stats, serve_task) = common::start_server(1).await;

    // One connection mid-flight.
    let in_flight = common::connect_admitted(addr).await;
    server.set_ceiling(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A newcomer connects (the OS completes the handshake) but is never
    // admitted to the engine.
    let mut newcomer = TcpStream::connect(addr).await.unwrap();
    let mut greeting = [0u8; 1];
    let admitted =
        tokio::time::timeout(Duration::from_millis(200), newcomer.read_exact(&mut greeting)).await;
    assert!(admitted.is_err(), "connection admitted despite a ceiling of zero");

    // The in-flight connection still completes normally.
    drop(in_flight);
    assert!(
        common::wait_until(Duration::from_secs(2), || stats.served.load(Ordering::SeqCst) == 1)
            .await
    );

    // Raising the ceiling again lets the parked newcomer in.
    server.set_ceiling(1).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), newcomer.read_exact(&mut greeting))
        .await
        .expect("newcomer was not admitted after the ceiling was raised")
        .unwrap();
    assert_eq!(&greeting, b"+");

    drop(newcomer);
    server.stop_and_wait().await;
    serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn out_of_range_ceiling_is_rejected_and_changes_nothing() {
    let (server, _addr, _stats, serve_task) = common::start_server(10).await;
    // The accept loop keeps one token in hand while parked in accept, so
    // nine of the ten slots are observably free.
    assert!(
        common::wait_until(Duration::from_secs(1), || server.available_capacity() == 9).await
    );

    match server.set_ceiling(11).await {
        Err(ThrottleError::OutOfRange { requested: 11, max: 10 }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.available_capacity(), 9);

    server.stop_and_wait().await;
    serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn lowered_ceiling_converges_while_serving() {
    let (server, addr, stats, serve_task) = common::start_server(8).await;

    // Park four connections, then halve the ceiling underneath them.
    let held: Vec<_> = [(); 4].map(|_| addr).into_iter().collect();
    let mut streams = Vec::new();
    for addr in held {
        streams.push(common::connect_admitted(addr).await);
    }
    server.set_ceiling(4).await.unwrap();

    // All four stay alive; free capacity drains to zero.
    assert!(common::wait_until(Duration::from_secs(2), || server.available_capacity() == 0).await);
    assert_eq!(stats.current.load(Ordering::SeqCst), 4);

    // Finished connections are not replaced beyond the new ceiling. Of the
    // four issued tokens, two stay with connections, one is in the accept
    // loop's hand and one returns to the supply.
    streams.truncate(2);
    assert!(
        common::wait_until(Duration::from_secs(2), || {
            stats.current.load(Ordering::SeqCst) == 2 && server.available_capacity() == 1
        })
        .await,
        "capacity did not settle at the new ceiling"
    );

    drop(streams);
    server.stop_and_wait().await;
    serve_task.await.unwrap().unwrap();
}
