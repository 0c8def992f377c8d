// End-to-end session tests against an in-process relay.
//
// The relay side is a bare tokio-tungstenite server driven by each test, so
// the real WebSocket transport, the driver and the router are all exercised.
// /ping and /notifyDisconnect are served by mockito.

use futures::{SinkExt, StreamExt};
use relay_session::{
    ConnectionStatus, DisconnectReason, RelayConfig, SessionClient, SessionEvent, SessionEvents,
    SqliteConfigStore, SrState, Stage, WebSocketTransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    listener: TcpListener,
    _http: mockito::ServerGuard,
    config: RelayConfig,
}

async fn relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut http = mockito::Server::new_async().await;
    http.mock("GET", "/ping").with_status(200).create_async().await;
    http.mock(
        "GET",
        mockito::Matcher::Regex(r"^/notifyDisconnect/.+$".to_string()),
    )
    .with_status(200)
    .create_async()
    .await;

    let mut config = RelayConfig::default();
    config.server.http_url = http.url();
    config.server.ws_url = format!("ws://{}/ws", listener.local_addr().unwrap());
    config.reconnect.probe_interval_ms = 20;
    config.reconnect.notify_period_ms = 20;
    config.reconnect.notifier_poll_ms = 10;

    Relay {
        listener,
        _http: http,
        config,
    }
}

/// Accepts the next client connection, returning it with its request path
async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client never connected")
        .unwrap();

    let mut path = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().to_string();
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .unwrap();
    (ws, path)
}

/// Next client frame with the given action, skipping heartbeats
async fn next_action(ws: &mut WebSocketStream<TcpStream>, action: &str) -> String {
    let needle = format!(r#""action":"{}""#, action);
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) if text.contains(&needle) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("frame never arrived")
}

async fn wait_for_state(events: &mut SessionEvents, pred: impl Fn(&SrState) -> bool) -> SrState {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(SessionEvent::StateChanged(state)) if pred(&state) => return state,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}

fn client(config: RelayConfig) -> SessionClient {
    let transports = Arc::new(WebSocketTransportFactory::new(config.timeouts.send()));
    let store = Arc::new(SqliteConfigStore::in_memory().unwrap());
    SessionClient::new(config, store, transports)
}

const HANDSHAKE: &str = r#"[{"type":"CONNECTION","memberId":"m1"},{"type":"SESSION_CONNECT","memberNum":1,"sessionId":"S1","memberPresence":[true,true]}]"#;

#[tokio::test]
async fn test_full_session_over_websocket() {
    let relay = relay().await;
    let client = client(relay.config.clone());
    let (handle, mut events) = client.join_random("p1", "duel", 2).unwrap();

    let (mut ws, path) = accept(&relay.listener).await;
    assert_eq!(path, "/ws?sessionType=duel&targetNumMembers=2");

    ws.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
    let state = wait_for_state(&mut events, |s| s.ready).await;
    assert_eq!(state.member_index, Some(1));
    assert!(!state.is_host);

    handle.send("hello", false).unwrap();
    assert_eq!(
        next_action(&mut ws, "SEND_MESSAGE").await,
        r#"{"action":"SEND_MESSAGE","payload":"hello"}"#
    );

    ws.send(Message::Text(
        r#"[{"type":"MESSAGE","memberNum":0,"payload":"welcome","pinned":true,"time":42}]"#
            .to_string(),
    ))
    .await
    .unwrap();
    let message = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(SessionEvent::Message(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("message never delivered");
    assert_eq!(message.payload, "welcome");
    assert!(message.pinned);

    ws.send(Message::Text(r#"[{"type":"SESSION_END"}]"#.to_string()))
        .await
        .unwrap();
    let state = wait_for_state(&mut events, |s| s.status == ConnectionStatus::Disconnected).await;
    assert_eq!(state.disconnect_reason, Some(DisconnectReason::SessionEnded));
    assert_eq!(state.stage, Stage::ConnectionClosed);

    tokio::time::timeout(WAIT, async {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller never shut down");
}

#[tokio::test]
async fn test_resumes_identity_after_connection_drop() {
    let relay = relay().await;
    let client = client(relay.config.clone());
    let (_handle, mut events) = client.join_random("p1", "duel", 2).unwrap();

    let (mut ws, _) = accept(&relay.listener).await;
    ws.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
    wait_for_state(&mut events, |s| s.ready).await;

    ws.close(None).await.unwrap();
    drop(ws);

    let state = wait_for_state(&mut events, |s| s.status == ConnectionStatus::Reconnecting).await;
    assert_eq!(state.member_presence, vec![true, false]);

    let (_ws, path) = accept(&relay.listener).await;
    assert_eq!(path, "/ws?memberId=m1&sessionId=S1");
    wait_for_state(&mut events, |s| s.status == ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_end_session_request_reaches_server() {
    let relay = relay().await;
    let client = client(relay.config.clone());
    let (handle, mut events) = client.join_random("p1", "duel", 2).unwrap();

    let (mut ws, _) = accept(&relay.listener).await;
    ws.send(Message::Text(HANDSHAKE.to_string())).await.unwrap();
    wait_for_state(&mut events, |s| s.ready).await;

    handle.disconnect(true).unwrap();
    assert_eq!(
        next_action(&mut ws, "END_SESSION").await,
        r#"{"action":"END_SESSION"}"#
    );

    ws.send(Message::Text(r#"[{"type":"SESSION_END"}]"#.to_string()))
        .await
        .unwrap();
    let state = wait_for_state(&mut events, |s| s.status == ConnectionStatus::Disconnected).await;
    assert_eq!(state.disconnect_reason, Some(DisconnectReason::SessionEnded));
}
