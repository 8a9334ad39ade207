use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

use sealpost::event::{
    self, kind, now_secs, Event, Filter, Keys, PublicKey, SecretKey, KIND_GIFT_WRAP,
};
use sealpost::relay_transport::WebSocketTransport;
use sealpost::transport::{Transport, TransportError};

/// A minimal relay: stores accepted events, answers REQ with stored matches
/// and EOSE, and keeps REQs open for new events.
#[derive(Clone)]
struct FakeRelay {
    events: Arc<Mutex<Vec<Event>>>,
    feed: broadcast::Sender<Event>,
}

impl FakeRelay {
    fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            feed,
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<FakeRelay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, relay))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string())).await.is_ok()
}

async fn serve_socket(mut socket: WebSocket, relay: FakeRelay) {
    let mut feed = relay.feed.subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(Message::Text(text))) = msg else { break };
                let Ok(frame) = serde_json::from_str::<Vec<Value>>(&text) else { continue };
                match frame.first().and_then(Value::as_str) {
                    Some("REQ") => {
                        let sub = frame[1].as_str().unwrap_or_default().to_string();
                        let filters: Vec<Filter> = frame[2..]
                            .iter()
                            .filter_map(|f| serde_json::from_value(f.clone()).ok())
                            .collect();
                        let stored = relay.events.lock().unwrap().clone();
                        for event in stored.iter().filter(|e| filters.iter().any(|f| f.match_event(e))) {
                            send_json(&mut socket, json!(["EVENT", sub, event])).await;
                        }
                        send_json(&mut socket, json!(["EOSE", sub])).await;
                        subs.insert(sub, filters);
                    }
                    Some("CLOSE") => {
                        if let Some(sub) = frame.get(1).and_then(Value::as_str) {
                            subs.remove(sub);
                        }
                    }
                    Some("EVENT") => {
                        let Ok(event) = serde_json::from_value::<Event>(frame[1].clone()) else { continue };
                        let accepted = event.content != "reject me";
                        if accepted {
                            relay.events.lock().unwrap().push(event.clone());
                            let _ = relay.feed.send(event.clone());
                        }
                        let reason = if accepted { "" } else { "blocked: not today" };
                        send_json(&mut socket, json!(["OK", event.id, accepted, reason])).await;
                    }
                    _ => {}
                }
            }
            Ok(event) = feed.recv() => {
                for (sub, filters) in &subs {
                    if filters.iter().any(|f| f.match_event(&event)) {
                        send_json(&mut socket, json!(["EVENT", sub, event])).await;
                    }
                }
            }
        }
    }
}

async fn start_relay(relay: FakeRelay) -> (String, oneshot::Sender<()>) {
    let app = Router::new().route("/", get(ws_handler)).with_state(relay);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}", addr), shutdown_tx)
}

fn fixed_key(byte: u8) -> PublicKey {
    Keys::new(SecretKey::from_slice(&[byte; 32]).unwrap()).public_key()
}

fn bob() -> PublicKey {
    fixed_key(0x0b)
}

fn carol() -> PublicKey {
    fixed_key(0x0c)
}

fn gift_wrap(recipient: &PublicKey, content: &str) -> Event {
    let keys = Keys::generate();
    let p = event::tag(&["p", &recipient.to_hex()]).unwrap();
    let unsigned = event::unsigned(keys.public_key(), now_secs(), KIND_GIFT_WRAP, vec![p], content);
    event::sign(&keys, unsigned).unwrap()
}

fn for_bob() -> Filter {
    Filter::new().kind(kind(KIND_GIFT_WRAP)).pubkey(bob())
}

#[tokio::test]
async fn publish_then_fetch_round_trip() {
    let relay = FakeRelay::new();
    let (url, _shutdown) = start_relay(relay.clone()).await;
    let transport = WebSocketTransport::new();
    let relays = vec![url];

    let event = gift_wrap(&bob(), "sealed");
    transport.publish(&relays, &event).await.unwrap();
    transport
        .publish(&relays, &gift_wrap(&carol(), "not for bob"))
        .await
        .unwrap();

    let fetched = transport
        .fetch(&relays, &[for_bob()], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(fetched, vec![event]);
}

#[tokio::test]
async fn rejected_publish_is_an_error() {
    let (url, _shutdown) = start_relay(FakeRelay::new()).await;
    let transport = WebSocketTransport::new();
    let result = transport
        .publish(&[url], &gift_wrap(&bob(), "reject me"))
        .await;
    assert!(matches!(result, Err(TransportError::Rejected(_))));
}

#[tokio::test]
async fn publish_succeeds_if_any_relay_accepts() {
    let (url, _shutdown) = start_relay(FakeRelay::new()).await;
    let transport = WebSocketTransport::with_publish_timeout(Duration::from_secs(2));
    let relays = vec!["ws://127.0.0.1:1".to_string(), url];
    transport
        .publish(&relays, &gift_wrap(&bob(), "hello"))
        .await
        .unwrap();
}

#[tokio::test]
async fn fetch_merges_relays_and_tolerates_dead_ones() {
    let first = FakeRelay::new();
    let second = FakeRelay::new();
    let shared = gift_wrap(&bob(), "on both");
    let only_second = gift_wrap(&bob(), "on one");
    first.events.lock().unwrap().push(shared.clone());
    second.events.lock().unwrap().push(shared.clone());
    second.events.lock().unwrap().push(only_second.clone());

    let (a, _sa) = start_relay(first).await;
    let (b, _sb) = start_relay(second).await;
    let transport = WebSocketTransport::new();
    let relays = vec![a, b, "ws://127.0.0.1:1".to_string()];

    let mut ids: Vec<String> = transport
        .fetch(&relays, &[for_bob()], Duration::from_secs(2))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id.to_hex())
        .collect();
    ids.sort();
    let mut expected = vec![shared.id.to_hex(), only_second.id.to_hex()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn fetch_fails_when_no_relay_answers() {
    let transport = WebSocketTransport::new();
    let result = transport
        .fetch(
            &["ws://127.0.0.1:1".to_string()],
            &[for_bob()],
            Duration::from_secs(1),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn forged_events_are_dropped() {
    let relay = FakeRelay::new();
    let mut forged = gift_wrap(&bob(), "original");
    forged.content = "tampered".into();
    relay.events.lock().unwrap().push(forged);
    let (url, _shutdown) = start_relay(relay).await;

    let fetched = WebSocketTransport::new()
        .fetch(&[url], &[for_bob()], Duration::from_secs(2))
        .await
        .unwrap();
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn live_subscription_forwards_new_events() {
    let relay = FakeRelay::new();
    let (url, _shutdown) = start_relay(relay).await;
    let transport = WebSocketTransport::new();
    let relays = vec![url];
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .subscribe_live(&relays, &[for_bob()], "dm-bbbbbbbb", tx)
        .await
        .unwrap();

    let event = gift_wrap(&bob(), "live");
    transport.publish(&relays, &event).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("live event")
        .expect("sink open");
    assert_eq!(received.id, event.id);

    transport.unsubscribe_live("dm-bbbbbbbb").await.unwrap();
    // Reader tasks are gone, so the sink's sender side is dropped.
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
