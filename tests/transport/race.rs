//! Registry races: concurrent listen/dial storms and address contention.

use memnet::{ErrorKind, Provider};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_listen_dial_storm() {
    let provider = Provider::new();
    let mut pairs = tokio::task::JoinSet::new();

    for i in 0..1000u32 {
        let provider = provider.clone();
        pairs.spawn(async move {
            let name = format!("pair-{i}");

            // Race the listen against the dial for the same name.
            let announcer = {
                let provider = provider.clone();
                let name = name.clone();
                tokio::spawn(async move { provider.listen("memu", &name) })
            };
            let dialed = provider.dial("memu", &name).await;
            let listener = announcer
                .await
                .expect("listen task")
                .expect("unique names always announce");

            match dialed {
                Ok(conn) => {
                    // The rendezvous must complete: the remote side is
                    // either queued already or arrives with this accept.
                    let accepted = listener.accept().await.expect("accept");
                    assert_eq!(accepted.remote_addr(), conn.local_addr());
                }
                Err(err) => {
                    // The dial beat the listen; the only acceptable
                    // failure is a clean not-found.
                    assert_eq!(err.kind, ErrorKind::AddressNotFound, "{err}");
                }
            }
            listener.close();
        });
    }

    while let Some(result) = pairs.join_next().await {
        result.expect("no pair may hang, crash, or leak");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_listens_have_exactly_one_winner() {
    let provider = Provider::new();
    for round in 0..100u32 {
        let name = format!("contended-{round}");
        let a = {
            let provider = provider.clone();
            let name = name.clone();
            tokio::spawn(async move { provider.listen("memu", &name) })
        };
        let b = {
            let provider = provider.clone();
            let name = name.clone();
            tokio::spawn(async move { provider.listen("memu", &name) })
        };

        let results = [a.await.expect("task"), b.await.expect("task")];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {round}: exactly one listen wins");
        for result in results {
            match result {
                Ok(listener) => listener.close(),
                Err(err) => assert_eq!(err.kind, ErrorKind::AddressInUse, "{err}"),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn dial_accept_pairing_is_exclusive() {
    // Every successful dial pairs with exactly one accept; closing the
    // listener mid-storm only ever produces clean listener-closed or
    // not-found failures on the dial side.
    let provider = Provider::new();
    let listener = std::sync::Arc::new(provider.listen("memu", "storm").expect("listen"));

    let acceptor = {
        let listener = listener.clone();
        tokio::spawn(async move {
            let mut accepted = 0u32;
            while listener.accept().await.is_ok() {
                accepted += 1;
            }
            accepted
        })
    };

    let mut dials = tokio::task::JoinSet::new();
    for _ in 0..200u32 {
        let provider = provider.clone();
        dials.spawn(async move {
            match provider.dial("memu", "storm").await {
                Ok(_conn) => true,
                Err(err) => {
                    assert!(
                        matches!(
                            err.kind,
                            ErrorKind::ListenerClosed | ErrorKind::AddressNotFound
                        ),
                        "{err}"
                    );
                    false
                }
            }
        });
    }

    let mut dialed_ok = 0u32;
    let mut finished = 0u32;
    while let Some(result) = dials.join_next().await {
        if result.expect("dial task") {
            dialed_ok += 1;
        }
        finished += 1;
        if finished == 150 {
            // Shut the listener down while dials are still in flight.
            listener.close();
        }
    }

    let accepted = acceptor.await.expect("acceptor task");
    assert!(
        accepted >= dialed_ok.saturating_sub(1),
        "accepted {accepted} of {dialed_ok} successful dials"
    );
}
