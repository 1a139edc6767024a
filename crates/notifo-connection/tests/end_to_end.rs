use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use notifo_connection::socket::{decode, encode, HubMessage};
use notifo_connection::{
    build_connection, Connection, ConnectionError, ConnectionMode, ConnectionOptions,
    ConnectionState, Deduplicated, Deletion, Notification,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use test_timeout::tokio_timeout_test;
use url::Url;

const API_KEY: &str = "user-token-1";

async fn serve(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn notification_json(id: &str, updated: &str) -> Value {
    json!({
        "id": id,
        "subject": format!("subject {id}"),
        "created": "2024-03-01T10:00:00Z",
        "updated": updated,
        "someFutureField": true
    })
}

type Batches = Arc<Mutex<Vec<(Vec<String>, bool)>>>;

fn record_batches(connection: &dyn Connection) -> Batches {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    connection.on_notifications(Arc::new(move |batch: &[Notification], is_update: bool| {
        sink.lock()
            .push((batch.iter().map(|n| n.id.clone()).collect(), is_update));
    }));
    batches
}

#[derive(Clone, Default)]
struct PollServer {
    pages: Arc<Mutex<Vec<Value>>>,
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    fail: Arc<Mutex<bool>>,
}

async fn poll(
    State(server): State<PollServer>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let api_key = headers
        .get("x-apikey")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    server.requests.lock().push((api_key, body));
    if *server.fail.lock() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    let next = {
        let mut pages = server.pages.lock();
        if pages.is_empty() {
            None
        } else {
            Some(pages.remove(0))
        }
    };
    Json(next.unwrap_or_else(|| json!({ "continuationToken": "idle", "notifications": [] })))
        .into_response()
}

async fn poll_server(pages: Vec<Value>) -> (PollServer, Url) {
    let server = PollServer {
        pages: Arc::new(Mutex::new(pages)),
        ..PollServer::default()
    };
    let app = Router::new()
        .route("/api/me/web/poll", post(poll))
        .with_state(server.clone());
    let url = serve(app).await;
    (server, url)
}

#[tokio_timeout_test(10)]
async fn polling_delivers_and_acknowledges_over_http() {
    let (server, url) = poll_server(vec![
        json!({ "continuationToken": "t1", "notifications": [notification_json("a", "1")] }),
        json!({ "continuationToken": "t2", "notifications": [notification_json("b", "1")], "deletions": ["a"] }),
    ])
    .await;
    let options = ConnectionOptions::new(url, API_KEY)
        .with_mode(ConnectionMode::Polling)
        .with_polling_interval(Duration::from_millis(50));
    let connection = build_connection(&options).unwrap();
    let batches = record_batches(connection.as_ref());
    let deletions: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let deletions = deletions.clone();
        connection.on_delete(Arc::new(move |d: &Deletion| deletions.lock().push(d.id.clone())));
    }

    connection.start().await.unwrap();
    connection
        .confirm_many(&["a".to_string()], Some("a"))
        .await
        .unwrap();
    wait_until(|| server.requests.lock().len() >= 3).await;
    connection.stop();

    assert_eq!(
        batches.lock().as_slice(),
        [(vec!["a".to_string()], false), (vec!["b".to_string()], true)]
    );
    assert_eq!(deletions.lock().as_slice(), ["a"]);

    let requests = server.requests.lock().clone();
    assert!(requests.iter().all(|(key, _)| key.as_deref() == Some(API_KEY)));
    assert_eq!(requests[0].1, json!({ "token": null }));
    assert_eq!(
        requests[1].1,
        json!({ "token": "t1", "confirmed": ["a"], "seen": ["a"] })
    );
    assert_eq!(requests[2].1, json!({ "token": "t2" }));
}

#[tokio_timeout_test(10)]
async fn polling_reports_server_errors_and_recovers() {
    let (server, url) = poll_server(vec![]).await;
    *server.fail.lock() = true;
    let options = ConnectionOptions::new(url, API_KEY)
        .with_mode(ConnectionMode::Polling)
        .with_polling_interval(Duration::from_millis(20));
    let connection = build_connection(&options).unwrap();
    let reconnected = Arc::new(Mutex::new(0usize));
    {
        let reconnected = reconnected.clone();
        connection.on_reconnected(Arc::new(move || *reconnected.lock() += 1));
    }

    match connection.start().await {
        Err(ConnectionError::UnexpectedStatus { status, body }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    *server.fail.lock() = false;
    wait_until(|| connection.state() == ConnectionState::Connected).await;
    assert_eq!(*reconnected.lock(), 1);
    connection.stop();
}

#[derive(Clone, Default)]
struct HubServer {
    upgrades: Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>,
    negotiations: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    pushes: Arc<Mutex<Vec<HubMessage>>>,
    handshake_error: Option<String>,
}

async fn negotiate(State(hub): State<HubServer>, headers: HeaderMap) -> Json<Value> {
    assert_eq!(
        headers.get("x-apikey").and_then(|v| v.to_str().ok()),
        Some(API_KEY)
    );
    *hub.negotiations.lock() += 1;
    Json(json!({
        "connectionId": "conn-1",
        "connectionToken": "token-1",
        "negotiateVersion": 1,
        "availableTransports": [
            { "transport": "WebSockets", "transferFormats": ["Text", "Binary"] },
            { "transport": "LongPolling", "transferFormats": ["Text"] }
        ]
    }))
}

async fn hub_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(hub): State<HubServer>,
) -> Response {
    let api_key = headers
        .get("x-apikey")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    hub.upgrades.lock().push((query, api_key));
    ws.on_upgrade(move |socket| run_hub(socket, hub))
}

async fn run_hub(mut socket: WebSocket, hub: HubServer) {
    let Some(Ok(Message::Text(handshake))) = socket.recv().await else {
        return;
    };
    assert!(handshake.starts_with(r#"{"protocol":"json","version":1}"#));

    if let Some(error) = &hub.handshake_error {
        let reply = format!("{}\u{1e}", json!({ "error": error }));
        let _ = socket.send(Message::Text(reply)).await;
        return;
    }

    // The first pushes share a frame with the handshake reply.
    let pushes: Vec<HubMessage> = std::mem::take(&mut *hub.pushes.lock());
    let mut frame = String::from("{}\u{1e}");
    for message in &pushes {
        frame.push_str(&encode(message).unwrap());
    }
    if socket.send(Message::Text(frame)).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        for message in decode(&text).unwrap() {
            if let HubMessage::Invocation {
                invocation_id: Some(invocation_id),
                target,
                arguments,
            } = message
            {
                let error = (target == "delete" && arguments == vec![json!("forbidden")])
                    .then(|| "not allowed".to_string());
                hub.calls.lock().push((target, arguments));
                let completion = HubMessage::Completion {
                    invocation_id,
                    result: None,
                    error,
                };
                if socket
                    .send(Message::Text(encode(&completion).unwrap()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn hub_server(hub: HubServer) -> Url {
    let app = Router::new()
        .route("/hub", get(hub_socket))
        .route("/hub/negotiate", post(negotiate))
        .with_state(hub);
    serve(app).await
}

fn push(target: &str, argument: Value) -> HubMessage {
    HubMessage::Invocation {
        invocation_id: None,
        target: target.to_string(),
        arguments: vec![argument],
    }
}

async fn on_connection<F, Fut>(mode: ConnectionMode, hub: HubServer, test: F)
where
    F: FnOnce(Arc<dyn Connection>, HubServer) -> Fut,
    Fut: Future<Output = ()>,
{
    let url = hub_server(hub.clone()).await;
    let options = ConnectionOptions::new(url, API_KEY).with_mode(mode);
    let connection = build_connection(&options).unwrap();
    test(connection, hub).await;
}

#[tokio_timeout_test(10)]
async fn sockets_mode_connects_directly_and_invokes_methods() {
    let hub = HubServer::default();
    hub.pushes.lock().extend([
        push("notifications", json!([notification_json("a", "1")])),
        push("notificationDeleted", json!({ "id": "a" })),
    ]);

    on_connection(ConnectionMode::SignalRSockets, hub, |connection, hub| async move {
        let batches = record_batches(connection.as_ref());
        connection.start().await.unwrap();
        wait_until(|| !batches.lock().is_empty()).await;
        assert_eq!(batches.lock().as_slice(), [(vec!["a".to_string()], true)]);

        connection.delete("b").await.unwrap();
        connection
            .confirm_many(&["c".to_string()], None)
            .await
            .unwrap();
        match connection.delete("forbidden").await {
            Err(ConnectionError::Remote { method, message }) => {
                assert_eq!(method, "delete");
                assert_eq!(message, "not allowed");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(*hub.negotiations.lock(), 0);
        let upgrades = hub.upgrades.lock().clone();
        assert_eq!(upgrades.len(), 1);
        let (query, api_key) = &upgrades[0];
        assert_eq!(query.get("access_token").map(String::as_str), Some(API_KEY));
        assert!(!query.contains_key("id"));
        assert_eq!(api_key.as_deref(), Some(API_KEY));
        assert_eq!(
            hub.calls.lock().as_slice(),
            [
                ("delete".to_string(), vec![json!("b")]),
                ("confirmMany".to_string(), vec![json!({ "seen": ["c"] })]),
                ("delete".to_string(), vec![json!("forbidden")]),
            ]
        );
        connection.stop();
    })
    .await;
}

#[tokio_timeout_test(10)]
async fn signalr_mode_negotiates_before_connecting() {
    on_connection(ConnectionMode::SignalR, HubServer::default(), |connection, hub| async move {
        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(*hub.negotiations.lock(), 1);
        let upgrades = hub.upgrades.lock().clone();
        assert_eq!(upgrades[0].0.get("id").map(String::as_str), Some("token-1"));
        connection.stop();
        assert_eq!(connection.state(), ConnectionState::Stopped);
    })
    .await;
}

#[tokio_timeout_test(10)]
async fn handshake_errors_fail_start() {
    let hub = HubServer {
        handshake_error: Some("protocol not supported".into()),
        ..HubServer::default()
    };
    on_connection(ConnectionMode::SignalRSockets, hub, |connection, _| async move {
        match connection.start().await {
            Err(ConnectionError::Handshake(message)) => {
                assert_eq!(message, "protocol not supported")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connection.state(), ConnectionState::Pending);
    })
    .await;
}

#[tokio_timeout_test(10)]
async fn dedup_filters_stale_socket_pushes() {
    let hub = HubServer::default();
    hub.pushes.lock().extend([
        push("notification", notification_json("a", "2")),
        push("notification", notification_json("a", "1")),
        push("notificationDeleted", json!({ "id": "b" })),
        push("notification", notification_json("b", "3")),
        push("notification", notification_json("c", "1")),
    ]);

    on_connection(ConnectionMode::SignalRSockets, hub, |connection, _| async move {
        let dedup = Deduplicated::new(connection);
        let batches = record_batches(&dedup);
        dedup.start().await.unwrap();
        wait_until(|| batches.lock().len() >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            batches.lock().as_slice(),
            [(vec!["a".to_string()], true), (vec!["c".to_string()], true)]
        );
        assert!(dedup.is_deleted("b"));
        dedup.stop();
    })
    .await;
}
