//! Client lifecycle integration tests
//!
//! Connect, disconnect, handshake headers and state reporting.

mod common;

use common::{drain_states, mock_notification, next_state, MockWsServer};
use serde_json::json;
use std::time::Duration;
use tether_client::{
    ClientBuilder, ClientEvent, ConnectionConfig, ConnectionState, MemoryStore, TokenError,
    TokenFn,
};
use tether_core::Error;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_and_disconnect() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();
    let mut events = client.subscribe().await;

    client.connect(ConnectionConfig::new(server.url())).await.unwrap();
    assert!(client.is_connected().await);
    assert_eq!(
        drain_states(&mut events),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    client.disconnect().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert_eq!(drain_states(&mut events), vec![ConnectionState::Disconnected]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_headers() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    let config = ConnectionConfig::new(server.url())
        .with_bearer_token("secret-token")
        .with_header("X-Bridge-Version", "3");
    client.connect(config).await.unwrap();

    let headers = server.handshake_headers(0);
    assert_eq!(
        headers.get("authorization").map(String::as_str),
        Some("Bearer secret-token")
    );
    assert_eq!(headers.get("x-bridge-version").map(String::as_str), Some("3"));
    assert_eq!(
        headers.get("x-client-id").map(String::as_str),
        Some(client.client_id())
    );

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_token_is_fetched_on_every_connect() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let tokens = counter.clone();
    let config = ConnectionConfig::new(server.url()).with_token_provider(TokenFn::new(move || {
        let n = tokens.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Ok::<_, TokenError>(format!("token-{}", n)) }
    }));

    client.connect(config.clone()).await.unwrap();
    client.connect(config).await.unwrap();

    assert_eq!(server.connection_count(), 2);
    assert_eq!(
        server.handshake_headers(0).get("authorization").map(String::as_str),
        Some("Bearer token-0")
    );
    assert_eq!(
        server.handshake_headers(1).get("authorization").map(String::as_str),
        Some("Bearer token-1")
    );

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_failing_token_provider_still_connects() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    let config = ConnectionConfig::new(server.url())
        .with_header("X-Bridge-Version", "3")
        .with_token_provider(TokenFn::new(|| async {
            Err::<String, TokenError>("keychain locked".into())
        }));
    client.connect(config).await.unwrap();

    let headers = server.handshake_headers(0);
    assert!(!headers.contains_key("authorization"));
    assert_eq!(headers.get("x-bridge-version").map(String::as_str), Some("3"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_id_is_stable_across_clients_sharing_a_store() {
    let server = MockWsServer::new().await;
    let store = MemoryStore::new();

    let first = ClientBuilder::new().with_store(store.clone()).build().await.unwrap();
    let second = ClientBuilder::new().with_store(store).build().await.unwrap();

    first.connect(ConnectionConfig::new(server.url())).await.unwrap();
    second.connect(ConnectionConfig::new(server.url())).await.unwrap();

    assert_eq!(
        server.handshake_headers(0).get("x-client-id"),
        server.handshake_headers(1).get("x-client-id")
    );

    first.disconnect().await;
    second.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_last_connected_is_recorded() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();
    assert_eq!(client.last_connected_at().await.unwrap(), None);

    let before = chrono::Utc::now();
    client.connect(ConnectionConfig::new(server.url())).await.unwrap();

    let at = client.last_connected_at().await.unwrap().unwrap();
    assert!(at >= before - chrono::Duration::seconds(1));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_refused() {
    let client = ClientBuilder::new().without_reconnect().build().await.unwrap();

    let result = client.connect(ConnectionConfig::new("ws://127.0.0.1:1")).await;
    assert!(matches!(result, Err(Error::WebSocket(_))));
    assert!(matches!(client.state().await, ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_invalid_endpoint() {
    let client = ClientBuilder::new().without_reconnect().build().await.unwrap();

    let result = client.connect(ConnectionConfig::new("not a url")).await;
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_connect_and_wait_times_out() {
    // Accepts TCP but never answers the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let _hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let client = ClientBuilder::new().without_reconnect().build().await.unwrap();
    let mut events = client.subscribe().await;

    let result = client
        .connect_and_wait(ConnectionConfig::new(url), Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));

    assert!(next_state(&mut events, ConnectionState::Failed(Error::Timeout)).await.is_some());
    assert!(matches!(client.state().await, ConnectionState::Failed(Error::Timeout)));
}

#[tokio::test]
async fn test_connect_and_wait_succeeds() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    client
        .connect_and_wait(ConnectionConfig::new(server.url()), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(client.is_connected().await);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_then_connect_yields_one_connected() {
    let first = MockWsServer::new().await;
    let mut second = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    client.connect(ConnectionConfig::new(first.url())).await.unwrap();
    let mut events = client.subscribe().await;

    client.disconnect().await;
    client
        .connect(ConnectionConfig::new(second.url()).with_header("X-Bridge-Version", "4"))
        .await
        .unwrap();

    // Nothing from the old server may surface, late frames included.
    first.push(mock_notification("turn/started", json!({"from": "first"})));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::StateChanged(state) => states.push(state),
            ClientEvent::Message(message) => panic!("Unexpected message {:?}", message),
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(client.is_connected().await);
    assert_eq!(first.connection_count(), 1);
    assert_eq!(second.connection_count(), 1);
    assert_eq!(
        second.handshake_headers(0).get("x-bridge-version").map(String::as_str),
        Some("4")
    );

    // Traffic now goes to the second server only.
    client.notify("initialized", None).await.unwrap();
    let text = second.wait_for_message().await.unwrap();
    assert!(text.contains("initialized"));

    client.disconnect().await;
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replaces_connection() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    client.connect(ConnectionConfig::new(server.url())).await.unwrap();
    client.reconnect().await.unwrap();

    assert!(client.is_connected().await);
    assert_eq!(server.connection_count(), 2);

    // The old socket is gone; requests go over the new one.
    let result = client.send_request("thread/list", None).await.unwrap();
    assert_eq!(result["method"], "thread/list");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_newline_and_header_options_on_the_wire() {
    let mut server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();

    let config = ConnectionConfig::new(server.url())
        .with_newline(true)
        .with_encode_options(tether_core::EncodeOptions::default().without_jsonrpc_header());
    client.connect(config).await.unwrap();

    client
        .notify("initialized", Some(json!({"path": "/tmp/x"})))
        .await
        .unwrap();

    let text = server.wait_for_message().await.unwrap();
    assert!(text.ends_with('\n'));
    assert!(!text.contains("jsonrpc"));
    assert!(text.contains(r#""path":"/tmp/x""#));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_keeps_connection_alive() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();
    let mut events = client.subscribe().await;

    let config = ConnectionConfig::new(server.url()).with_ping_interval(Duration::from_millis(50));
    client.connect(config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_connected().await);
    assert!(!drain_states(&mut events)
        .iter()
        .any(|s| matches!(s, ConnectionState::Failed(_))));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribers_all_see_events() {
    let server = MockWsServer::new().await;
    let client = ClientBuilder::new().build().await.unwrap();
    let mut first = client.subscribe().await;
    let mut second = client.subscribe().await;
    drop(client.subscribe().await);

    client.connect(ConnectionConfig::new(server.url())).await.unwrap();

    for events in [&mut first, &mut second] {
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::StateChanged(ConnectionState::Connecting))
        ));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::StateChanged(ConnectionState::Connected))
        ));
    }

    client.disconnect().await;
    assert!(!client.is_connected().await);
    server.shutdown().await;
}
