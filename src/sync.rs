//! Keeps the local store in step with the relay network.
//!
//! Lifecycle: `Stopped -> Starting -> Live -> Stopped`. Starting runs one
//! bounded backfill (gift wraps from the inbox relays, legacy messages in both
//! directions from the read relays), then opens a single live subscription for
//! the identity. Every event, fetched or live, goes through the same route:
//! skip known wrap ids, decode, save.
//!
//! `start`, `stop` and `clear` take the lifecycle lock for the whole
//! transition, so a second `start` for the same identity waits and then sees
//! there is nothing to do, and no session can come up in the middle of a wipe.
//!
//! Gift wraps are backdated by up to [`MAX_TIMESTAMP_SKEW_SECS`], so the live
//! gift-wrap filter starts that much before the subscription time. Wraps the
//! backfill already stored are skipped by wrap id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::{CodecError, MessageCodec, MAX_TIMESTAMP_SKEW_SECS};
use crate::config::SealpostConfig;
use crate::event::{
    first_tag_value, kind, now_secs, parse_pubkey, Event, EventError, Filter, PublicKey, Tag,
    Timestamp, KIND_GIFT_WRAP, KIND_LEGACY_DM,
};
use crate::logging;
use crate::relays::RelayResolver;
use crate::signer::Signer;
use crate::storage::{ConversationStore, Message, MessageFormat, StorageError};
use crate::transport::{Transport, TransportError};
use crate::{tlog, tlog_debug};

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;
const SUBSCRIPTION_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Starting,
    Live,
}

/// Broadcast to observers of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new message arrived on the live subscription.
    MessageReceived(Message),
    BackfillComplete { stored: usize },
}

/// Outcome of a side effect whose failure does not fail the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Completed,
    Failed(String),
}

impl BestEffort {
    pub fn is_completed(&self) -> bool {
        matches!(self, BestEffort::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// The locally stored copy of the sent message.
    pub message: Message,
    /// Publishing the self-addressed copy.
    pub self_copy: BestEffort,
}

#[derive(Debug)]
pub enum SyncError {
    NotStarted,
    Codec(CodecError),
    Storage(StorageError),
    Transport(TransportError),
    Task(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotStarted => write!(f, "messaging is not started"),
            SyncError::Codec(e) => write!(f, "codec error: {e}"),
            SyncError::Storage(e) => write!(f, "storage error: {e}"),
            SyncError::Transport(e) => write!(f, "transport error: {e}"),
            SyncError::Task(e) => write!(f, "task error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<CodecError> for SyncError {
    fn from(e: CodecError) -> Self {
        SyncError::Codec(e)
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}

/// The `e` tag marked `reply`, or the first `e` tag.
fn reply_target<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Option<String> {
    let e_tags: Vec<&[String]> = tags
        .into_iter()
        .map(Tag::as_slice)
        .filter(|t| t.len() > 1 && t[0] == "e")
        .collect();
    e_tags
        .iter()
        .find(|t| t.get(3).map(String::as_str) == Some("reply"))
        .or_else(|| e_tags.first())
        .map(|t| t[1].clone())
}

/// Seconds of `ts`, or `None` when they do not fit the store's signed column.
fn storable_secs(ts: Timestamp, event_id: &str) -> Option<u64> {
    let secs = ts.as_u64();
    if i64::try_from(secs).is_err() {
        tlog_debug!(
            "sync: dropped {}: created_at {secs} is out of range",
            logging::event_id(event_id)
        );
        return None;
    }
    Some(secs)
}

fn subscription_id(pubkey: &str) -> String {
    let end = pubkey.len().min(SUBSCRIPTION_PREFIX_LEN);
    format!("dm-{}", &pubkey[..end])
}

/// Decodes events for one identity and saves what is new.
#[derive(Clone)]
struct Router {
    me: PublicKey,
    codec: Arc<MessageCodec>,
    store: Arc<ConversationStore>,
}

impl Router {
    /// Returns the message when it was newly stored.
    async fn route(&self, event: &Event) -> Result<Option<Message>, StorageError> {
        let event_kind = event.kind.as_u16();
        if event_kind != KIND_GIFT_WRAP && event_kind != KIND_LEGACY_DM {
            return Ok(None);
        }
        let wrap_id = event.id.to_hex();
        if self.store.has_message(&wrap_id)? {
            return Ok(None);
        }
        let message = match event_kind {
            KIND_GIFT_WRAP => self.decode_wrap(event).await,
            _ => self.decode_legacy(event).await,
        };
        let Some(message) = message else {
            return Ok(None);
        };
        if self.store.save_message(&message)? {
            tlog_debug!(
                "sync: stored {} with {} from {}",
                logging::event_id(&message.id),
                logging::pubkey(&message.conversation_with),
                logging::event_id(&wrap_id)
            );
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    async fn decode_wrap(&self, wrap: &Event) -> Option<Message> {
        let wrap_id = wrap.id.to_hex();
        let rumor = self.codec.unwrap(wrap).await?;
        let created_at = storable_secs(rumor.created_at, &wrap_id)?;
        let is_mine = rumor.pubkey == self.me;
        let conversation_with = if is_mine {
            first_tag_value(rumor.tags.iter(), "p")?.to_string()
        } else {
            rumor.pubkey.to_hex()
        };
        Some(Message {
            reply_to: reply_target(rumor.tags.iter()),
            subject: first_tag_value(rumor.tags.iter(), "subject").map(str::to_string),
            id: rumor.id?.to_hex(),
            pubkey: rumor.pubkey.to_hex(),
            content: rumor.content,
            created_at,
            conversation_with,
            is_mine,
            wrap_id,
            format: MessageFormat::Layered,
        })
    }

    async fn decode_legacy(&self, event: &Event) -> Option<Message> {
        let id = event.id.to_hex();
        let created_at = storable_secs(event.created_at, &id)?;
        let legacy = self.codec.unwrap_legacy(event).await?;
        Some(Message {
            pubkey: event.pubkey.to_hex(),
            content: legacy.content,
            created_at,
            conversation_with: legacy.counterparty.to_hex(),
            reply_to: reply_target(event.tags.iter()),
            subject: None,
            is_mine: legacy.is_mine,
            wrap_id: id.clone(),
            id,
            format: MessageFormat::Legacy,
        })
    }
}

struct Session {
    router: Router,
    subscription_id: String,
    pump: JoinHandle<()>,
}

pub struct SyncCoordinator {
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    relays: Arc<RelayResolver>,
    fetch_timeout: Duration,
    backfill_limit: u32,
    lifecycle: AsyncMutex<Option<Session>>,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
        relays: Arc<RelayResolver>,
        config: &SealpostConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            relays,
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            backfill_limit: config.backfill_limit,
            lifecycle: AsyncMutex::new(None),
            state: Mutex::new(SyncState::Stopped),
            events,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SyncState::Stopped)
    }

    fn set_state(&self, next: SyncState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                tlog!("sync: {:?} -> {:?}", *state, next);
                *state = next;
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Public key of the running identity.
    pub async fn identity(&self) -> Option<PublicKey> {
        self.lifecycle.lock().await.as_ref().map(|s| s.router.me)
    }

    /// Backfill and go live for `signer`'s identity.
    ///
    /// A no-op when already live for the same identity. A different identity
    /// replaces the running session.
    pub async fn start(&self, signer: Arc<dyn Signer>) -> Result<(), SyncError> {
        let mut session = self.lifecycle.lock().await;
        let me = signer.public_key();
        let who = logging::pubkey(&me.to_hex());
        if let Some(current) = session.as_ref() {
            if current.router.me == me {
                tlog_debug!("sync: already live for {who}");
                return Ok(());
            }
        }
        if let Some(old) = session.take() {
            tlog!(
                "sync: switching identity from {} to {who}",
                logging::pubkey(&old.router.me.to_hex())
            );
            self.teardown(old).await;
        }

        self.set_state(SyncState::Starting);
        let router = Router {
            me,
            codec: Arc::new(MessageCodec::new(signer)),
            store: self.store.clone(),
        };
        let since = now_secs();

        match self.open(&router, since).await {
            Ok(next) => {
                *session = Some(next);
                self.set_state(SyncState::Live);
                Ok(())
            }
            Err(e) => {
                tlog!("sync: start for {who} failed: {e}");
                self.set_state(SyncState::Stopped);
                Err(e)
            }
        }
    }

    async fn open(&self, router: &Router, since: u64) -> Result<Session, SyncError> {
        let stored = self.backfill(router).await?;
        let _ = self.events.send(SyncEvent::BackfillComplete { stored });

        let me = router.me;
        let mut relays = self.relays.own_inbox_relays(&me).await;
        for relay in self.relays.read_relays() {
            if !relays.contains(&relay) {
                relays.push(relay);
            }
        }
        let wraps_since = Timestamp::from(since.saturating_sub(MAX_TIMESTAMP_SKEW_SECS));
        let legacy_since = Timestamp::from(since);
        let filters = [
            Filter::new().kind(kind(KIND_GIFT_WRAP)).pubkey(me).since(wraps_since),
            Filter::new().kind(kind(KIND_LEGACY_DM)).pubkey(me).since(legacy_since),
            Filter::new().kind(kind(KIND_LEGACY_DM)).author(me).since(legacy_since),
        ];
        let me_hex = me.to_hex();
        let subscription_id = subscription_id(&me_hex);
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport
            .subscribe_live(&relays, &filters, &subscription_id, tx)
            .await?;
        tlog!(
            "sync: live as {} on {} relay(s), subscription {subscription_id}",
            logging::pubkey(&me_hex),
            relays.len()
        );

        let pump = tokio::spawn(pump(rx, router.clone(), self.events.clone()));
        Ok(Session {
            router: router.clone(),
            subscription_id,
            pump,
        })
    }

    /// Fetch and store history. Fetch failures are logged and skipped.
    async fn backfill(&self, router: &Router) -> Result<usize, SyncError> {
        let me = router.me;
        let inbox = self.relays.own_inbox_relays(&me).await;
        let read = self.relays.read_relays();

        let limit = self.backfill_limit as usize;
        let wrap_filters = [Filter::new().kind(kind(KIND_GIFT_WRAP)).pubkey(me).limit(limit)];
        let legacy_filters = [
            Filter::new().kind(kind(KIND_LEGACY_DM)).author(me).limit(limit),
            Filter::new().kind(kind(KIND_LEGACY_DM)).pubkey(me).limit(limit),
        ];
        let (wrap_events, legacy_events) = tokio::join!(
            self.transport.fetch(&inbox, &wrap_filters, self.fetch_timeout),
            self.transport.fetch(&read, &legacy_filters, self.fetch_timeout),
        );

        let mut stored = 0usize;
        let mut seen = 0usize;
        for (label, result) in [("gift wrap", wrap_events), ("legacy", legacy_events)] {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tlog!("sync: {label} backfill failed: {e}");
                    continue;
                }
            };
            seen += events.len();
            for event in &events {
                if router.route(event).await?.is_some() {
                    stored += 1;
                }
            }
        }
        tlog!("sync: backfill stored {stored} of {seen} fetched event(s)");
        Ok(stored)
    }

    async fn teardown(&self, session: Session) {
        if let Err(e) = self.transport.unsubscribe_live(&session.subscription_id).await {
            tlog!("sync: unsubscribe {} failed: {e}", session.subscription_id);
        }
        session.pump.abort();
        // Wait for the pump so no save can land after teardown returns.
        let _ = session.pump.await;
    }

    pub async fn stop(&self) {
        let mut session = self.lifecycle.lock().await;
        if let Some(current) = session.take() {
            self.teardown(current).await;
            tlog!("sync: stopped");
        }
        self.set_state(SyncState::Stopped);
    }

    /// Stop, then wipe every stored message and conversation.
    ///
    /// The lifecycle lock is held across both steps, so a concurrent `start`
    /// runs either before the teardown or after the wipe.
    pub async fn clear(&self) -> Result<(), SyncError> {
        let mut session = self.lifecycle.lock().await;
        if let Some(current) = session.take() {
            self.teardown(current).await;
            tlog!("sync: stopped");
        }
        self.set_state(SyncState::Stopped);
        self.store.clear()?;
        drop(session);
        tlog!("sync: local messages cleared");
        Ok(())
    }

    async fn router(&self) -> Result<Router, SyncError> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map(|s| s.router.clone())
            .ok_or(SyncError::NotStarted)
    }

    /// Send `content` to `recipient`.
    ///
    /// The message is stored locally as soon as the recipient publish is under
    /// way. The call fails only if that publish fails.
    pub async fn send(
        &self,
        recipient: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt, SyncError> {
        let router = self.router().await?;
        let me = router.me;
        let recipient_key = parse_pubkey(recipient).map_err(CodecError::InvalidRecipient)?;
        let rumor = MessageCodec::build_rumor(me, content, &recipient_key, reply_to, None)?;
        let rumor_id = rumor.id.ok_or(CodecError::Event(EventError::MissingId))?;
        let for_recipient = router.codec.wrap(&rumor, &recipient_key).await?;
        let for_self = router.codec.wrap(&rumor, &me).await?;

        let (recipient_relays, own_relays) = tokio::join!(
            self.relays.inbox_relays(&recipient_key),
            self.relays.own_inbox_relays(&me)
        );

        let transport = self.transport.clone();
        let primary = tokio::spawn(async move {
            transport.publish(&recipient_relays, &for_recipient).await
        });

        let message = Message {
            id: rumor_id.to_hex(),
            pubkey: me.to_hex(),
            content: content.to_string(),
            created_at: rumor.created_at.as_u64(),
            conversation_with: recipient_key.to_hex(),
            reply_to: reply_to.map(str::to_string),
            subject: None,
            is_mine: true,
            wrap_id: for_self.id.to_hex(),
            format: MessageFormat::Layered,
        };
        self.store.save_message(&message)?;

        let self_copy = match self.transport.publish(&own_relays, &for_self).await {
            Ok(()) => BestEffort::Completed,
            Err(e) => {
                tlog!("send: self copy {} not published: {e}", logging::event_id(&message.wrap_id));
                BestEffort::Failed(e.to_string())
            }
        };

        primary
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;
        tlog!(
            "send: {} delivered to {}",
            logging::event_id(&message.id),
            logging::pubkey(&message.conversation_with)
        );
        Ok(SendReceipt { message, self_copy })
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<Event>,
    router: Router,
    events: broadcast::Sender<SyncEvent>,
) {
    while let Some(event) = rx.recv().await {
        match router.route(&event).await {
            Ok(Some(message)) => {
                tlog!(
                    "sync: new message from {}",
                    logging::pubkey(&message.conversation_with)
                );
                let _ = events.send(SyncEvent::MessageReceived(message));
            }
            Ok(None) => {}
            Err(e) => tlog!(
                "sync: failed to store {}: {e}",
                logging::event_id(&event.id.to_hex())
            ),
        }
    }
    tlog_debug!(
        "sync: live pump for {} ended",
        logging::pubkey(&router.me.to_hex())
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::tag;

    fn t(values: &[&str]) -> Tag {
        tag(values).unwrap()
    }

    #[test]
    fn reply_marker_wins_over_position() {
        let tags = vec![t(&["p", "x"]), t(&["e", "root", "", "root"]), t(&["e", "parent", "", "reply"])];
        assert_eq!(reply_target(&tags).as_deref(), Some("parent"));
        assert_eq!(reply_target(&[t(&["e", "only"])]).as_deref(), Some("only"));
        assert_eq!(reply_target(&[t(&["e"]), t(&["p", "x"])]), None);
    }

    #[test]
    fn timestamps_beyond_the_signed_range_are_not_storable() {
        assert_eq!(storable_secs(Timestamp::from(5_u64), "ev"), Some(5));
        let edge = i64::MAX as u64;
        assert_eq!(storable_secs(Timestamp::from(edge), "ev"), Some(edge));
        assert_eq!(storable_secs(Timestamp::from(edge + 1), "ev"), None);
        assert_eq!(storable_secs(Timestamp::from(u64::MAX), "ev"), None);
    }

    #[test]
    fn subscription_id_uses_key_prefix() {
        assert_eq!(subscription_id(&"ab12".repeat(16)), "dm-ab12ab12");
        assert_eq!(subscription_id("abc"), "dm-abc");
    }
}
