//! Round-trip echo flows over both networks.

use memnet::{Addr, Listener, Provider};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Spawns a task that echoes every accepted connection until EOF.
fn spawn_echo_server(listener: Listener) {
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(conn);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
}

#[tokio::test]
async fn unbuffered_round_trip_echo() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "echo").expect("listen");
    spawn_echo_server(listener);

    let mut conn = provider.dial("memu", "echo").await.expect("dial");
    conn.write_all(b"Hello, world.").await.expect("write");

    let mut buf = [0u8; 13];
    conn.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"Hello, world.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn buffered_round_trip_echo_large_payload() {
    let provider = Provider::new();
    let listener = provider.listen("memb", "bulk").expect("listen");

    // Echo server with the same buffer settings on its side.
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            conn.set_write_buffer(64 * 1024);
            conn.set_write_buffer_limit(10 * 1024 * 1024);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(conn);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let mut conn = provider.dial("memb", "bulk").await.expect("dial");
    conn.set_write_buffer(64 * 1024);
    conn.set_write_buffer_limit(10 * 1024 * 1024);

    let mut rng = rand::rng();
    let len = 4 * 1024 * 1024 + (rng.next_u64() as usize % (4 * 1024 * 1024));
    let mut payload = vec![0u8; len];
    rng.fill_bytes(&mut payload);

    let (mut reader, mut writer) = tokio::io::split(conn);
    let expected = payload.clone();
    let write_side = tokio::spawn(async move {
        writer.write_all(&payload).await.expect("bulk write");
        writer
    });

    let mut echoed = vec![0u8; len];
    reader.read_exact(&mut echoed).await.expect("bulk read");
    assert_eq!(echoed, expected, "echoed payload of {len} bytes differs");
    write_side.await.expect("writer task");
}

#[tokio::test]
async fn default_provider_round_trip() {
    // The crate-level functions share one process-wide registry, so this
    // test keeps to a name nothing else uses.
    let listener = memnet::listen("memu", "default-provider-echo").expect("listen");
    spawn_echo_server(listener);

    let mut conn = memnet::dial("memu", "default-provider-echo")
        .await
        .expect("dial");
    conn.write_all(b"ping").await.expect("write");
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn explicit_local_address_is_visible_to_the_acceptor() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "whoami").expect("listen");
    let accept = tokio::spawn(async move { listener.accept().await });

    let conn = provider
        .dial_addr(
            "memu",
            Some(Addr::unbuffered("custom-client")),
            Some(Addr::unbuffered("whoami")),
        )
        .await
        .expect("dial");
    assert_eq!(conn.local_addr(), Addr::unbuffered("custom-client"));

    let accepted = accept.await.expect("task").expect("accept");
    assert_eq!(accepted.remote_addr(), Addr::unbuffered("custom-client"));
    assert_eq!(accepted.local_addr(), Addr::unbuffered("whoami"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_share_one_listener() {
    let provider = Provider::new();
    let listener = provider.listen("memu", "shared-echo").expect("listen");
    spawn_echo_server(listener);

    let mut clients = tokio::task::JoinSet::new();
    for i in 0..16u32 {
        let provider = provider.clone();
        clients.spawn(async move {
            let mut conn = provider.dial("memu", "shared-echo").await.expect("dial");
            let message = format!("client-{i}");
            conn.write_all(message.as_bytes()).await.expect("write");
            let mut buf = vec![0u8; message.len()];
            conn.read_exact(&mut buf).await.expect("read");
            assert_eq!(buf, message.as_bytes());
        });
    }
    while let Some(result) = clients.join_next().await {
        result.expect("client task");
    }
}
