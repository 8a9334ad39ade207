//! Which relays to use for whom.
//!
//! Inbox relays are where an identity receives gift wraps. They are declared
//! in a kind-10050 event with one `["relay", url]` tag per relay. When that
//! event cannot be found in time the configured fallback relays are used, so
//! a missing declaration never blocks delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SealpostConfig;
use crate::event::{kind, tag_values, Filter, PublicKey, KIND_INBOX_RELAYS};
use crate::logging;
use crate::tlog;
use crate::transport::Transport;

pub struct RelayResolver {
    transport: Arc<dyn Transport>,
    inbox_override: Vec<String>,
    read_relays: Vec<String>,
    discovery_relays: Vec<String>,
    fallback_relays: Vec<String>,
    lookup_timeout: Duration,
    cache: Mutex<HashMap<PublicKey, Vec<String>>>,
}

fn is_relay_url(url: &str) -> bool {
    url.starts_with("wss://") || url.starts_with("ws://")
}

fn dedup(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        let url = url.trim().trim_end_matches('/').to_string();
        if is_relay_url(&url) && !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

impl RelayResolver {
    pub fn new(transport: Arc<dyn Transport>, config: &SealpostConfig) -> Self {
        let fallback_relays = dedup(config.fallback_relays.clone());
        let discovery_relays = if config.discovery_relays.is_empty() {
            fallback_relays.clone()
        } else {
            dedup(config.discovery_relays.clone())
        };
        Self {
            transport,
            inbox_override: dedup(config.inbox_relays.clone()),
            read_relays: dedup(config.read_relays.clone()),
            discovery_relays,
            fallback_relays,
            lookup_timeout: Duration::from_millis(config.relay_list_timeout_ms),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fallback_relays(&self) -> &[String] {
        &self.fallback_relays
    }

    /// Relays used for legacy messages and general reads.
    pub fn read_relays(&self) -> Vec<String> {
        if self.read_relays.is_empty() {
            self.fallback_relays.clone()
        } else {
            self.read_relays.clone()
        }
    }

    /// Inbox relays of the local identity; a configured override wins.
    pub async fn own_inbox_relays(&self, me: &PublicKey) -> Vec<String> {
        if !self.inbox_override.is_empty() {
            return self.inbox_override.clone();
        }
        self.inbox_relays(me).await
    }

    /// Inbox relays declared by `pubkey`, or the fallback relays.
    pub async fn inbox_relays(&self, pubkey: &PublicKey) -> Vec<String> {
        if let Some(cached) = self.cached(pubkey) {
            return cached;
        }
        match self.lookup(pubkey).await {
            Some(relays) => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(*pubkey, relays.clone());
                }
                relays
            }
            None => self.fallback_relays.clone(),
        }
    }

    fn cached(&self, pubkey: &PublicKey) -> Option<Vec<String>> {
        self.cache.lock().ok()?.get(pubkey).cloned()
    }

    async fn lookup(&self, pubkey: &PublicKey) -> Option<Vec<String>> {
        let who = logging::pubkey(&pubkey.to_hex());
        let filters = [Filter::new().kind(kind(KIND_INBOX_RELAYS)).author(*pubkey)];
        let fetch = self
            .transport
            .fetch(&self.discovery_relays, &filters, self.lookup_timeout);
        let events = match tokio::time::timeout(self.lookup_timeout, fetch).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                tlog!("relays: inbox lookup for {who} failed: {e}");
                return None;
            }
            Err(_) => {
                tlog!(
                    "relays: inbox lookup for {who} timed out after {}ms",
                    self.lookup_timeout.as_millis()
                );
                return None;
            }
        };

        let latest = events
            .into_iter()
            .filter(|e| e.kind.as_u16() == KIND_INBOX_RELAYS && e.pubkey == *pubkey)
            .filter(|e| e.verify().is_ok())
            .max_by_key(|e| e.created_at)?;
        let relays = dedup(tag_values(latest.tags.iter(), "relay").map(str::to_string));
        if relays.is_empty() {
            tlog!("relays: {who} declares no inbox relays, using fallback");
            return None;
        }
        Some(relays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, Event, Keys};
    use crate::transport::MemoryTransport;

    fn config() -> SealpostConfig {
        SealpostConfig {
            discovery_relays: vec!["wss://directory.example".into()],
            fallback_relays: vec!["wss://fallback-a.example".into(), "wss://fallback-b.example".into()],
            relay_list_timeout_ms: 50,
            ..SealpostConfig::default()
        }
    }

    fn relay_list(keys: &Keys, created_at: u64, relays: &[&str]) -> Event {
        let tags = relays
            .iter()
            .map(|r| event::tag(&["relay", *r]).unwrap())
            .collect();
        event::sign(
            keys,
            event::unsigned(keys.public_key(), created_at, KIND_INBOX_RELAYS, tags, ""),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uses_latest_declared_relay_list() {
        let transport = MemoryTransport::new();
        let alice = Keys::generate();
        transport.seed("wss://directory.example", relay_list(&alice, 10, &["wss://old.example"]));
        transport.seed(
            "wss://directory.example",
            relay_list(&alice, 20, &["wss://new.example/", "wss://new.example", "https://x"]),
        );

        let resolver = RelayResolver::new(Arc::new(transport.clone()), &config());
        let relays = resolver.inbox_relays(&alice.public_key()).await;
        assert_eq!(relays, vec!["wss://new.example"]);

        // Second lookup is served from the cache.
        let calls = transport.fetch_calls();
        resolver.inbox_relays(&alice.public_key()).await;
        assert_eq!(transport.fetch_calls(), calls);
    }

    #[tokio::test]
    async fn falls_back_when_lookup_times_out() {
        let transport = MemoryTransport::new();
        transport.set_fetch_delay(Some(Duration::from_secs(5)));
        let resolver = RelayResolver::new(Arc::new(transport), &config());
        assert_eq!(
            resolver.inbox_relays(&Keys::generate().public_key()).await,
            vec!["wss://fallback-a.example", "wss://fallback-b.example"]
        );
    }

    #[tokio::test]
    async fn falls_back_when_nothing_is_declared() {
        let transport = MemoryTransport::new();
        let alice = Keys::generate();
        transport.seed("wss://directory.example", relay_list(&alice, 10, &[]));
        let resolver = RelayResolver::new(Arc::new(transport), &config());
        assert_eq!(
            resolver.inbox_relays(&alice.public_key()).await,
            resolver.fallback_relays().to_vec()
        );
    }

    #[tokio::test]
    async fn own_override_skips_lookup() {
        let transport = MemoryTransport::new();
        let mut config = config();
        config.inbox_relays = vec!["wss://mine.example".into()];
        config.read_relays = vec!["wss://read.example".into()];
        let resolver = RelayResolver::new(Arc::new(transport.clone()), &config);

        assert_eq!(
            resolver.own_inbox_relays(&Keys::generate().public_key()).await,
            vec!["wss://mine.example"]
        );
        assert_eq!(resolver.read_relays(), vec!["wss://read.example"]);
        assert_eq!(transport.fetch_calls(), 0);
    }
}
