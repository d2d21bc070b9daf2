//! End-to-end server/client behaviour over the HTTP fallback transport

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use common::{client_config, next_event, register_test_handlers, wait_until};
use hive_config::{ClientConfig, SecurityConfig, ServerConfig, TransportKind};
use hive_ipc::{
    ClientEvent, ClientOptions, ClientStatus, ConnectionSettings, EndpointRole, Envelope,
    ErrorCode, HttpTransport, IpcClient, IpcFactory, IpcServer, ServerOptions,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(security: SecurityConfig) -> (IpcServer, String) {
    common::init_logging();
    let transport = Arc::new(HttpTransport::new("127.0.0.1:0", ConnectionSettings::default()));
    let server = IpcServer::new(transport.clone(), security, ServerConfig::default());
    register_test_handlers(&server);
    server.start().await.unwrap();
    let address = transport.local_addr().unwrap().to_string();
    (server, address)
}

fn client_for(address: &str, config: ClientConfig) -> IpcClient {
    let transport = Arc::new(HttpTransport::new(address, ConnectionSettings::default()));
    IpcClient::new(transport, config, None)
}

#[tokio::test]
async fn test_http_echo_and_greet() {
    let (server, address) = start_server(SecurityConfig::default()).await;
    let client = client_for(&address, client_config("agent"));
    client.connect().await.unwrap();

    let request = Envelope::request("echo", json!({ "items": [1, 2, 3] }));
    let request_id = request.id.clone();
    let response = client.request_envelope(request, None).await.unwrap();
    assert_eq!(response.in_reply_to(), Some(request_id.as_str()));
    assert_eq!(response.payload(), json!({ "items": [1, 2, 3] }));

    let greeting = client.request("greet", json!({ "name": "World" })).await.unwrap();
    assert_eq!(greeting, json!({ "message": "Hello, World!" }));

    let info = client.request("server-info", Value::Null).await.unwrap();
    assert_eq!(info["transport"], json!("http"));

    client.disconnect().await;
    assert!(wait_until(WAIT, || server.connection_count() == 0).await);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_concurrent_requests_resolve_independently() {
    let (server, address) = start_server(SecurityConfig::default()).await;
    let client = client_for(&address, client_config("agent"));
    client.connect().await.unwrap();

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", json!({ "delay_ms": 200 })).await })
    };
    // Served while the slow handler is still running
    let fast = client.request("greet", json!({ "name": "fast" })).await.unwrap();
    assert_eq!(fast, json!({ "message": "Hello, fast!" }));
    assert!(!slow.is_finished());

    let slept = slow.await.unwrap().unwrap();
    assert_eq!(slept, json!({ "slept_ms": 200 }));

    client.disconnect().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_broadcast_reaches_client() {
    let (server, address) = start_server(SecurityConfig::default()).await;
    let client = client_for(&address, client_config("agent"));
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(WAIT, || server.connection_count() == 1).await);

    let notice = Envelope::event(Some("shutdown-soon".to_string()), json!({ "in_ms": 1000 }));
    assert_eq!(server.broadcast(&notice, None), 1);

    let received = next_event(&mut events, WAIT, |event| match event {
        ClientEvent::Message(envelope) => Some(envelope),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(received.id, notice.id);
    assert_eq!(received.payload(), json!({ "in_ms": 1000 }));

    client.disconnect().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_server_stop_disconnects_client() {
    let (server, address) = start_server(SecurityConfig::default()).await;
    let client = client_for(&address, client_config("agent"));
    let mut events = client.take_events().unwrap();
    client.connect().await.unwrap();

    server.stop().await.unwrap();
    let disconnected = next_event(&mut events, WAIT, |event| {
        matches!(event, ClientEvent::Disconnected).then_some(())
    })
    .await;
    assert!(disconnected.is_some());
    assert_eq!(client.status(), ClientStatus::Disconnected);
    assert_eq!(
        client.request("ping", Value::Null).await.unwrap_err().code(),
        ErrorCode::ConnectionLost
    );
}

#[tokio::test]
async fn test_http_connect_without_server_fails() {
    // Bind and release a port so nothing listens on it
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let client = client_for(&address, client_config("agent"));
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    assert_eq!(client.status(), ClientStatus::Disconnected);
}

#[tokio::test]
async fn test_factory_builds_http_pair() {
    let factory = IpcFactory::new();
    let role = EndpointRole::Swarm("s-1".to_string());
    let server = factory
        .create_server(
            &role,
            ServerOptions {
                transport: Some(TransportKind::Http),
                http_address: Some("127.0.0.1:0".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    server.start().await.unwrap();
    let endpoint = server.server_info().endpoint;
    let address = endpoint.trim_start_matches("http://").to_string();

    let client = factory
        .create_client(
            &role,
            ClientOptions {
                transport: Some(TransportKind::Http),
                http_address: Some(address),
                client: Some(client_config("swarm-member")),
                ..Default::default()
            },
        )
        .unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.request("ping", Value::Null).await.unwrap()["pong"], json!(true));

    client.disconnect().await;
    server.stop().await.unwrap();
}
