#![allow(dead_code)]

use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use hive_config::ClientConfig;
use hive_ipc::{IpcError, IpcServer};

/// Route test diagnostics to stderr; `RUST_LOG=debug` shows connection traffic
pub fn init_logging() {
    let _ = hive_logging::init_simple_tracing("warn");
}

/// Client settings suited to tests: no reconnect, no heartbeat, short waits
pub fn client_config(process_name: &str) -> ClientConfig {
    ClientConfig {
        reconnect_attempts: 0,
        heartbeat_interval: None,
        request_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(2),
        process_name: Some(process_name.to_string()),
        ..Default::default()
    }
}

/// Counts invocations of the `echo` handler
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// `echo`, `greet`, `slow` and `fail` handlers
pub fn register_test_handlers(server: &IpcServer) -> CallCounter {
    let calls = CallCounter::default();

    let counter = calls.clone();
    server.register_fn("echo", move |payload: Value, _ctx| {
        counter.0.fetch_add(1, Ordering::SeqCst);
        async move { Ok(payload) }
    });

    server.register_fn("greet", |payload: Value, _ctx| async move {
        let name = payload["name"].as_str().unwrap_or("stranger").to_string();
        Ok(json!({ "message": format!("Hello, {}!", name) }))
    });

    server.register_fn("slow", |payload: Value, _ctx| async move {
        let delay = payload["delay_ms"].as_u64().unwrap_or(1_000);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(json!({ "slept_ms": delay }))
    });

    server.register_fn("fail", |_payload: Value, _ctx| async move {
        Err::<Value, _>(IpcError::TransportError("backend unavailable".to_string()))
    });

    calls
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Receive events until one satisfies `pick`
pub async fn next_event<E, T>(
    events: &mut mpsc::Receiver<E>,
    limit: Duration,
    mut pick: impl FnMut(E) -> Option<T>,
) -> Option<T> {
    tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return Some(found);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    match tokio::time::timeout(limit, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not finish within {:?}", limit),
    }
}
