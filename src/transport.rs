//! The relay network boundary.
//!
//! [`Transport`] is what the messaging core needs from the network: bounded
//! queries, publishing, and named live subscriptions that push events into a
//! channel. [`crate::relay_transport::WebSocketTransport`] talks to real
//! relays; [`MemoryTransport`] keeps relays in process for tests and demos.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use crate::event::{Event, Filter};

/// Receives events from a live subscription.
pub type EventSink = mpsc::UnboundedSender<Event>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NoRelays,
    Timeout,
    Connection(String),
    Rejected(String),
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NoRelays => write!(f, "no relays given"),
            TransportError::Timeout => write!(f, "relay request timed out"),
            TransportError::Connection(e) => write!(f, "relay connection failed: {e}"),
            TransportError::Rejected(e) => write!(f, "relay rejected event: {e}"),
            TransportError::Protocol(e) => write!(f, "relay protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Query `relays` and return the union of matching stored events.
    async fn fetch(
        &self,
        relays: &[String],
        filters: &[Filter],
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError>;

    /// Publish to `relays`. Succeeds when at least one relay accepts.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<(), TransportError>;

    /// Open a named subscription that forwards new matching events to `sink`.
    async fn subscribe_live(
        &self,
        relays: &[String],
        filters: &[Filter],
        subscription_id: &str,
        sink: EventSink,
    ) -> Result<(), TransportError>;

    async fn unsubscribe_live(&self, subscription_id: &str) -> Result<(), TransportError>;
}

/// What a [`MemoryTransport`] was asked to publish.
#[derive(Debug, Clone)]
pub struct Published {
    pub relays: Vec<String>,
    pub event: Event,
}

struct LiveSub {
    relays: Vec<String>,
    filters: Vec<Filter>,
    sink: EventSink,
}

#[derive(Default)]
struct MemoryInner {
    relays: HashMap<String, Vec<Event>>,
    subs: HashMap<String, LiveSub>,
    unreachable: HashSet<String>,
    published: Vec<Published>,
    fetch_delay: Option<Duration>,
    fetch_calls: usize,
}

/// In-process relays.
///
/// Events are stored per relay URL. Relays can be marked unreachable, fetches
/// can be delayed past their timeout, and publishes can be held until
/// released, which lets tests observe what happens while a publish is still in
/// flight.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
    publish_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an event on a relay without notifying subscribers.
    pub fn seed(&self, relay: &str, event: Event) {
        self.lock()
            .relays
            .entry(relay.to_string())
            .or_default()
            .push(event);
    }

    /// Store an event and push it to live subscribers of that relay.
    pub fn inject(&self, relay: &str, event: Event) {
        let mut inner = self.lock();
        inner
            .relays
            .entry(relay.to_string())
            .or_default()
            .push(event.clone());
        for sub in inner.subs.values() {
            if sub.relays.iter().any(|r| r == relay) && sub.filters.iter().any(|f| f.match_event(&event))
            {
                let _ = sub.sink.send(event.clone());
            }
        }
    }

    pub fn set_unreachable(&self, relay: &str, unreachable: bool) {
        let mut inner = self.lock();
        if unreachable {
            inner.unreachable.insert(relay.to_string());
        } else {
            inner.unreachable.remove(relay);
        }
    }

    /// Delay every fetch by `delay`; a delay beyond the fetch timeout times out.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    /// Hold all publishes until [`release_publishes`](Self::release_publishes).
    pub fn hold_publishes(&self) {
        if let Ok(mut gate) = self.publish_gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn release_publishes(&self) {
        if let Ok(mut gate) = self.publish_gate.lock() {
            if let Some(sem) = gate.take() {
                sem.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn events_on(&self, relay: &str) -> Vec<Event> {
        self.lock().relays.get(relay).cloned().unwrap_or_default()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.lock().subs.keys().cloned().collect()
    }

    pub fn subscription_filters(&self, subscription_id: &str) -> Option<Vec<Filter>> {
        self.lock().subs.get(subscription_id).map(|s| s.filters.clone())
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(
        &self,
        relays: &[String],
        filters: &[Filter],
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let delay = {
            let mut inner = self.lock();
            inner.fetch_calls += 1;
            inner.fetch_delay
        };
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }

        let inner = self.lock();
        let reachable: Vec<&String> = relays
            .iter()
            .filter(|r| !inner.unreachable.contains(*r))
            .collect();
        if reachable.is_empty() {
            return Err(TransportError::Connection("all relays unreachable".into()));
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for relay in reachable {
            let Some(events) = inner.relays.get(relay) else {
                continue;
            };
            for filter in filters {
                let mut matched: Vec<&Event> = events.iter().filter(|e| filter.match_event(e)).collect();
                if let Some(limit) = filter.limit {
                    matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    matched.truncate(limit);
                }
                for event in matched {
                    // Relays return their own copy; duplicates across relays
                    // are the caller's problem, as on the real network.
                    if seen.insert((relay.clone(), event.id)) {
                        out.push(event.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<(), TransportError> {
        if relays.is_empty() {
            return Err(TransportError::NoRelays);
        }
        let gate = self.publish_gate.lock().ok().and_then(|g| g.clone());
        if let Some(sem) = gate {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }

        let mut inner = self.lock();
        inner.published.push(Published {
            relays: relays.to_vec(),
            event: event.clone(),
        });
        let accepted: Vec<String> = relays
            .iter()
            .filter(|r| !inner.unreachable.contains(*r))
            .cloned()
            .collect();
        if accepted.is_empty() {
            return Err(TransportError::Connection("all relays unreachable".into()));
        }
        for relay in &accepted {
            let stored = inner.relays.entry(relay.clone()).or_default();
            if !stored.iter().any(|e| e.id == event.id) {
                stored.push(event.clone());
            }
        }
        for sub in inner.subs.values() {
            if sub.relays.iter().any(|r| accepted.contains(r))
                && sub.filters.iter().any(|f| f.match_event(event))
            {
                let _ = sub.sink.send(event.clone());
            }
        }
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
        self.lock().subs.insert(
            subscription_id.to_string(),
            LiveSub {
                relays: relays.to_vec(),
                filters: filters.to_vec(),
                sink,
            },
        );
        Ok(())
    }

    async fn unsubscribe_live(&self, subscription_id: &str) -> Result<(), TransportError> {
        self.lock().subs.remove(subscription_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, kind, Keys, PublicKey, Timestamp, KIND_GIFT_WRAP};

    fn wrap_for(recipient: &PublicKey, created_at: u64) -> Event {
        let keys = Keys::generate();
        let p = event::tag(&["p", &recipient.to_hex()]).unwrap();
        event::sign(
            &keys,
            event::unsigned(keys.public_key(), created_at, KIND_GIFT_WRAP, vec![p], "x"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_honours_filters_and_limits() {
        let transport = MemoryTransport::new();
        let bob = Keys::generate().public_key();
        let carol = Keys::generate().public_key();
        for t in 1..=5 {
            transport.seed("wss://a", wrap_for(&bob, t));
        }
        transport.seed("wss://a", wrap_for(&carol, 9));

        let filter = Filter::new().kind(kind(KIND_GIFT_WRAP)).pubkey(bob).limit(3);
        let events = transport
            .fetch(&["wss://a".to_string()], &[filter], Duration::from_secs(1))
            .await
            .unwrap();
        let mut times: Vec<u64> = events.iter().map(|e| e.created_at.as_u64()).collect();
        times.sort();
        assert_eq!(times, vec![3, 4, 5]);

        let recent = Filter::new().pubkey(bob).since(Timestamp::from(4_u64));
        let events = transport
            .fetch(&["wss://a".to_string()], &[recent], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn delayed_fetch_times_out() {
        let transport = MemoryTransport::new();
        transport.set_fetch_delay(Some(Duration::from_secs(5)));
        let result = transport
            .fetch(&["wss://a".to_string()], &[Filter::new()], Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn publish_reaches_live_subscribers() {
        let transport = MemoryTransport::new();
        let bob = Keys::generate().public_key();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relays = vec!["wss://a".to_string()];
        transport
            .subscribe_live(&relays, &[Filter::new().pubkey(bob)], "s1", tx)
            .await
            .unwrap();

        let event = wrap_for(&bob, 1);
        transport.publish(&relays, &event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, event.id);

        transport.unsubscribe_live("s1").await.unwrap();
        assert!(transport.subscription_ids().is_empty());
    }

    #[tokio::test]
    async fn publish_fails_when_every_relay_is_down() {
        let transport = MemoryTransport::new();
        transport.set_unreachable("wss://a", true);
        let bob = Keys::generate().public_key();
        let result = transport
            .publish(&["wss://a".to_string()], &wrap_for(&bob, 1))
            .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
