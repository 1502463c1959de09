//! End-to-end: real WebSocket transport against a local live query server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use livequery::{ClientEvent, EventKind, LiveQueryClient, Query};

/// Minimal server: acknowledges connect, confirms subscriptions and pushes
/// one `create` per subscription. Every received frame is forwarded to the
/// returned channel.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(&text).unwrap();
            let _ = seen_tx.send(frame.clone());

            let replies = match frame["op"].as_str() {
                Some("connect") => vec![json!({"op": "connected", "clientId": "c1"})],
                Some("subscribe") => {
                    let request_id = frame["requestId"].clone();
                    vec![
                        json!({"op": "subscribed", "clientId": "c1", "requestId": request_id}),
                        json!({
                            "op": "create",
                            "clientId": "c1",
                            "requestId": request_id,
                            "object": {
                                "className": "Game",
                                "objectId": "g1",
                                "createdAt": "2024-05-01T10:00:00.000Z",
                                "score": 42
                            }
                        }),
                    ]
                }
                Some("unsubscribe") => vec![
                    json!({"op": "unsubscribed", "clientId": "c1", "requestId": frame["requestId"]}),
                ],
                _ => vec![json!({"op": "error", "code": 1, "error": "unknown op", "reconnect": false})],
            };
            for reply in replies {
                if ws.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
        }
    });

    (format!("ws://{addr}"), seen_rx)
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_subscribe_and_receive_over_websocket() {
    let (url, mut seen) = spawn_server().await;
    let client = LiveQueryClient::builder()
        .endpoint(url)
        .application_id("e2e-app")
        .build()
        .unwrap();
    let mut client_events = client.events();

    let query: Query = Query::new("Game").constraint("score", "$gt", 10);
    let subscription = client.subscribe(query.clone()).unwrap();
    let mut subscribed = subscription.subscribed();
    let mut events = subscription.events();

    let connect = within(seen.recv()).await.unwrap();
    assert_eq!(connect, json!({"op": "connect", "applicationId": "e2e-app"}));

    let subscribe = within(seen.recv()).await.unwrap();
    assert_eq!(
        subscribe,
        json!({
            "op": "subscribe",
            "requestId": 1,
            "query": {"className": "Game", "where": {"score": {"$gt": 10}}}
        })
    );

    assert_eq!(within(subscribed.recv()).await.unwrap(), 1);
    let event = within(events.recv()).await.unwrap();
    assert_eq!(event.kind, EventKind::Create);
    assert_eq!(event.object.object_id.as_deref(), Some("g1"));
    assert_eq!(
        event.object.created_at.as_deref(),
        Some("2024-05-01T10:00:00.000Z")
    );
    assert_eq!(event.object.get("score"), Some(&json!(42)));
    assert!(event.original.is_none());
    assert!(client.is_connected());

    assert_eq!(
        within(client_events.recv()).await.unwrap(),
        ClientEvent::Connected
    );

    assert_eq!(client.unsubscribe(&query), 1);
    let unsubscribe = within(seen.recv()).await.unwrap();
    assert_eq!(unsubscribe, json!({"op": "unsubscribe", "requestId": 1}));

    client.disconnect();
    assert!(!client.is_connected());
}
