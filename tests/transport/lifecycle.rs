//! Listener and connection lifecycle: close fan-out, idempotence, and
//! registry cleanup.

use std::sync::Arc;
use std::time::Duration;

use memnet::{ErrorKind, Latch, Provider};
use tokio::time::timeout;

#[tokio::test]
async fn closing_a_listener_unblocks_accept() {
    let provider = Provider::new();
    let listener = Arc::new(provider.listen("memu", "closer").expect("listen"));

    let closer = listener.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    let started = std::time::Instant::now();
    let err = timeout(Duration::from_millis(500), listener.accept())
        .await
        .expect("accept must unblock")
        .expect_err("accept should fail after close");
    assert_eq!(err.kind, ErrorKind::ListenerClosed);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(40) && elapsed < Duration::from_millis(200),
        "accept unblocked at {elapsed:?}"
    );
}

#[tokio::test]
async fn close_is_idempotent_everywhere() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "idem").expect("listen");
    let accept = tokio::spawn(async move {
        let conn = listener.accept().await.expect("accept");
        listener.close();
        listener.close();
        (listener, conn)
    });

    let conn = provider.dial("memu", "idem").await.expect("dial");
    let (listener, accepted) = accept.await.expect("task");
    listener.close();

    conn.close();
    conn.close();
    accepted.close();
    accepted.close();

    let err = provider.dial("memu", "idem").await.expect_err("unregistered");
    assert_eq!(err.kind, ErrorKind::AddressNotFound);
}

#[tokio::test]
async fn close_unregisters_promptly() {
    let provider = Provider::new();
    let listener = provider.listen("memb", "fleeting").expect("listen");
    listener.close();
    let err = provider
        .dial("memb", "fleeting")
        .await
        .expect_err("registry entry should be gone");
    assert_eq!(err.kind, ErrorKind::AddressNotFound);
}

#[tokio::test]
async fn listener_close_terminates_dialed_conns() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "teardown").expect("listen");

    // The dial parks its remote side in the accept queue; nobody accepts.
    let mut conn = provider.dial("memu", "teardown").await.expect("dial");
    listener.close();

    // The close watcher terminates the queued remote side, so the dialer
    // observes end-of-stream in bounded time.
    let mut buf = [0u8; 4];
    let n = timeout(Duration::from_millis(500), conn.read(&mut buf))
        .await
        .expect("read must unblock after listener close")
        .expect("orphaned dialer sees EOF");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn accept_after_close_reports_closed_even_with_a_queued_conn() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "drained").expect("listen");
    let _conn = provider.dial("memu", "drained").await.expect("dial");

    listener.close();
    let err = listener.accept().await.expect_err("closed listener");
    assert_eq!(err.kind, ErrorKind::ListenerClosed);
}

#[tokio::test]
async fn cancelling_a_dial_aborts_the_handshake() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "congested").expect("listen");

    // Fill the accept queue so the next dial has to wait.
    let _parked = provider.dial("memu", "congested").await.expect("dial");

    let cancel = Arc::new(Latch::new());
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trip.trip();
    });

    let err = timeout(
        Duration::from_millis(500),
        provider.dial_cancel("memu", "congested", &cancel),
    )
    .await
    .expect("dial must unblock on cancellation")
    .expect_err("cancelled dial fails");
    assert_eq!(err.kind, ErrorKind::Cancelled);

    // The listener is still healthy: the parked conn is acceptable.
    timeout(Duration::from_millis(500), listener.accept())
        .await
        .expect("accept should find the parked conn")
        .expect("accept");
}

#[tokio::test]
async fn dial_racing_a_close_loses_cleanly() {
    let provider = Provider::new();
    let listener = Arc::new(provider.listen("memu", "race-close").expect("listen"));

    // Occupy the queue so the racing dial blocks in the rendezvous.
    let _parked = provider.dial("memu", "race-close").await.expect("dial");

    let closer = listener.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        closer.close();
    });

    let err = timeout(
        Duration::from_millis(500),
        provider.dial("memu", "race-close"),
    )
    .await
    .expect("dial must unblock when the listener closes")
    .expect_err("dial loses the race");
    assert_eq!(err.kind, ErrorKind::ListenerClosed);
}

#[tokio::test]
async fn peer_close_gives_eof_then_write_failure() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "half").expect("listen");
    let accept = tokio::spawn(async move { listener.accept().await });

    let mut conn = provider.dial("memu", "half").await.expect("dial");
    let accepted = accept.await.expect("task").expect("accept");
    accepted.close();

    let mut buf = [0u8; 4];
    let n = conn.read(&mut buf).await.expect("EOF is not an error");
    assert_eq!(n, 0);
    let err = conn.write(b"x").await.expect_err("peer is gone");
    assert_eq!(err.kind, ErrorKind::ClosedPipe);
}
