//! [`Transport`] over relay WebSockets.
//!
//! Wire messages, client to relay:
//!
//! ```text
//! ["REQ", <sub>, <filter>...]   ["CLOSE", <sub>]   ["EVENT", <event>]
//! ```
//!
//! and relay to client:
//!
//! ```text
//! ["EVENT", <sub>, <event>]  ["EOSE", <sub>]  ["OK", <id>, <accepted>, <msg>]
//! ["NOTICE", <msg>]          ["CLOSED", <sub>, <msg>]
//! ```
//!
//! Fetches and publishes open a short-lived connection per relay and run the
//! relays concurrently. Live subscriptions keep one reader task per relay that
//! reconnects with backoff until the subscription is closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::event::{Event, Filter};
use crate::logging;
use crate::transport::{EventSink, Transport, TransportError};
use crate::{tlog, tlog_debug};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF_SECS: u64 = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A parsed relay-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Event },
    Eose(String),
    Ok { id: String, accepted: bool, message: String },
    Notice(String),
    Closed { subscription: String, message: String },
}

pub fn parse_relay_message(text: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let items = value.as_array()?;
    let str_at = |i: usize| items.get(i).and_then(Value::as_str).map(str::to_string);
    match items.first()?.as_str()? {
        "EVENT" => Some(RelayMessage::Event {
            subscription: str_at(1)?,
            event: serde_json::from_value(items.get(2)?.clone()).ok()?,
        }),
        "EOSE" => Some(RelayMessage::Eose(str_at(1)?)),
        "OK" => Some(RelayMessage::Ok {
            id: str_at(1)?,
            accepted: items.get(2)?.as_bool()?,
            message: str_at(3).unwrap_or_default(),
        }),
        "NOTICE" => Some(RelayMessage::Notice(str_at(1).unwrap_or_default())),
        "CLOSED" => Some(RelayMessage::Closed {
            subscription: str_at(1)?,
            message: str_at(2).unwrap_or_default(),
        }),
        _ => None,
    }
}

fn req_message(subscription: &str, filters: &[Filter]) -> Result<String, TransportError> {
    let mut frame = vec![json!("REQ"), json!(subscription)];
    for filter in filters {
        frame.push(
            serde_json::to_value(filter).map_err(|e| TransportError::Protocol(e.to_string()))?,
        );
    }
    Ok(Value::Array(frame).to_string())
}

async fn connect(relay: &str) -> Result<WsStream, TransportError> {
    let (stream, _response) = tokio_tungstenite::connect_async(relay)
        .await
        .map_err(|e| TransportError::Connection(format!("{relay}: {e}")))?;
    Ok(stream)
}

/// Forward a verified event, dropping anything with a bad id or signature.
fn accept_event(relay: &str, event: Event) -> Option<Event> {
    match event.verify() {
        Ok(()) => Some(event),
        Err(e) => {
            tlog_debug!("relay {relay}: dropped {}: {e}", logging::event_id(&event.id.to_hex()));
            None
        }
    }
}

pub struct WebSocketTransport {
    publish_timeout: Duration,
    next_sub: AtomicU64,
    live: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::with_publish_timeout(DEFAULT_PUBLISH_TIMEOUT)
    }

    pub fn with_publish_timeout(publish_timeout: Duration) -> Self {
        Self {
            publish_timeout,
            next_sub: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn abort_live(&self, subscription_id: &str) -> bool {
        let handles = match self.live.lock() {
            Ok(mut live) => live.remove(subscription_id),
            Err(_) => None,
        };
        match handles {
            Some(handles) => {
                for handle in handles {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Collect stored events from one relay until EOSE or the deadline.
    async fn fetch_one(
        relay: String,
        req: String,
        subscription: String,
        deadline: Instant,
    ) -> Result<Vec<Event>, TransportError> {
        let mut ws = tokio::time::timeout_at(deadline, connect(&relay))
            .await
            .map_err(|_| TransportError::Timeout)??;
        ws.send(WsMessage::Text(req))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut events = Vec::new();
        loop {
            let msg = match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    tlog!("relay {relay}: read error during fetch: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tlog_debug!("relay {relay}: fetch deadline reached with {} event(s)", events.len());
                    break;
                }
            };
            let text = match msg {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            match parse_relay_message(&text) {
                Some(RelayMessage::Event {
                    subscription: sub,
                    event,
                }) if sub == subscription => {
                    if let Some(event) = accept_event(&relay, event) {
                        events.push(event);
                    }
                }
                Some(RelayMessage::Eose(sub)) if sub == subscription => break,
                Some(RelayMessage::Closed {
                    subscription: sub,
                    message,
                }) if sub == subscription => {
                    tlog!("relay {relay}: closed fetch: {message}");
                    break;
                }
                Some(RelayMessage::Notice(notice)) => tlog!("relay {relay}: notice: {notice}"),
                _ => {}
            }
        }

        let close = json!(["CLOSE", subscription]).to_string();
        let _ = ws.send(WsMessage::Text(close)).await;
        let _ = ws.close(None).await;
        Ok(events)
    }

    async fn publish_one(
        relay: String,
        frame: String,
        event_id: String,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        tokio::time::timeout(timeout, publish_attempt(&relay, frame, &event_id))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

async fn publish_attempt(relay: &str, frame: String, event_id: &str) -> Result<(), TransportError> {
    let mut ws = connect(relay).await?;
    ws.send(WsMessage::Text(frame))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| TransportError::Connection(e.to_string()))?;
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if let Some(RelayMessage::Ok {
            id,
            accepted,
            message,
        }) = parse_relay_message(&text)
        {
            if id != event_id {
                continue;
            }
            let _ = ws.close(None).await;
            if accepted {
                return Ok(());
            }
            return Err(TransportError::Rejected(format!("{relay}: {message}")));
        }
    }
    Err(TransportError::Connection(format!(
        "{relay}: closed before acknowledging"
    )))
}

/// Keep a subscription open against one relay, reconnecting with backoff.
async fn live_loop(relay: String, req: String, sink: EventSink) {
    let mut backoff_secs = 2u64;
    loop {
        match connect(&relay).await {
            Ok(mut ws) => {
                backoff_secs = 2;
                tlog!("relay {relay}: live subscription connected");
                if let Err(e) = ws.send(WsMessage::Text(req.clone())).await {
                    tlog!("relay {relay}: subscribe failed: {e}");
                } else {
                    while let Some(msg) = ws.next().await {
                        match msg {
                            Ok(WsMessage::Text(text)) => match parse_relay_message(&text) {
                                Some(RelayMessage::Event { event, .. }) => {
                                    if let Some(event) = accept_event(&relay, event) {
                                        if sink.send(event).is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(RelayMessage::Closed { message, .. }) => {
                                    tlog!("relay {relay}: subscription closed: {message}");
                                    break;
                                }
                                Some(RelayMessage::Notice(notice)) => {
                                    tlog!("relay {relay}: notice: {notice}");
                                }
                                _ => {}
                            },
                            Ok(WsMessage::Close(_)) => break,
                            Err(e) => {
                                tlog!("relay {relay}: live read error: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                tlog!("relay {relay}: live subscription dropped, reconnecting in {backoff_secs}s");
            }
            Err(e) => {
                tlog!("relay {relay}: live connect failed (retry in {backoff_secs}s): {e}");
            }
        }
        if sink.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn fetch(
        &self,
        relays: &[String],
        filters: &[Filter],
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let subscription = format!("fetch-{}", self.next_sub.fetch_add(1, Ordering::Relaxed));
        let req = req_message(&subscription, filters)?;
        let deadline = Instant::now() + timeout;

        let results = join_all(relays.iter().map(|relay| {
            Self::fetch_one(relay.clone(), req.clone(), subscription.clone(), deadline)
        }))
        .await;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut last_error = None;
        let mut any_ok = false;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(batch) => {
                    any_ok = true;
                    for event in batch {
                        if seen.insert(event.id) {
                            events.push(event);
                        }
                    }
                }
                Err(e) => {
                    tlog!("relay {relay}: fetch failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(events),
        }
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<(), TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let frame = json!(["EVENT", event]).to_string();
        let event_id = event.id.to_hex();
        let results = join_all(relays.iter().map(|relay| {
            Self::publish_one(
                relay.clone(),
                frame.clone(),
                event_id.clone(),
                self.publish_timeout,
            )
        }))
        .await;

        let mut last_error = TransportError::NoRelays;
        let mut accepted = 0usize;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tlog!("relay {relay}: publish of {} failed: {e}", logging::event_id(&event_id));
                    last_error = e;
                }
            }
        }
        if accepted == 0 {
            return Err(last_error);
        }
        tlog_debug!(
            "publish: {} accepted by {accepted}/{} relay(s)",
            logging::event_id(&event_id),
            relays.len()
        );
        Ok(())
    }

    async fn subscribe_live(
        &self,
        relays: &[String],
        filters: &[Filter],
        subscription_id: &str,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let req = req_message(subscription_id, filters)?;
        self.abort_live(subscription_id);

        let handles = relays
            .iter()
            .map(|relay| tokio::spawn(live_loop(relay.clone(), req.clone(), sink.clone())))
            .collect();
        self.live
            .lock()
            .map_err(|_| TransportError::Protocol("subscription table poisoned".into()))?
            .insert(subscription_id.to_string(), handles);
        Ok(())
    }

    async fn unsubscribe_live(&self, subscription_id: &str) -> Result<(), TransportError> {
        if self.abort_live(subscription_id) {
            tlog!("relay: closed live subscription {subscription_id}");
        }
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.lock() {
            for (_, handles) in live.drain() {
                for handle in handles {
                    handle.abort();
                }
            }
        }
    }
}
