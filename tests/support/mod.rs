//! Shared helpers for integration tests: local task set, dead proxies and a
//! canned-response TCP server standing in for a working proxy.

#![allow(dead_code)]

use std::future::Future;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use muxfetch::{Engine, Session, SessionConfig};
use tokio::task::LocalSet;

/// Runs `future` inside a fresh `LocalSet`, as the engine requires.
pub async fn local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}

/// An address nothing listens on; connecting to it is refused.
pub fn dead_proxy() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

/// Session over a fresh engine with the given proxies and no cycle wait.
pub fn session_with_proxies(proxies: Vec<String>) -> Session {
    let config = SessionConfig {
        proxies,
        proxy_cycle_wait: std::time::Duration::ZERO,
        ..SessionConfig::default()
    };
    Session::new(Engine::new().expect("engine"), config)
}

/// TCP server answering every request with `response`, then closing.
///
/// Works as a plain HTTP proxy for `http://` URLs since the proxy only has
/// to answer the absolute-form request. Returns the server URL and a
/// counter of requests served.
pub fn canned_server(response: &'static [u8]) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut request = Vec::new();
            let mut chunk = [0_u8; 1024];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&chunk[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = stream.write_all(response);
            let _ = stream.flush();
        }
    });

    (format!("http://{addr}"), served)
}
