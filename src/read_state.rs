//! Unread counts and conversation lists filtered by mutes and follows.
//!
//! Nothing here writes to the store. Muted partners are left out of every
//! count and list; the rest are split into "known" (followed) and "unknown"
//! (message requests). The mute set is loaded on first use and kept until
//! [`ReadState::notify_mutes_changed`] is called.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::logging;
use crate::storage::{Conversation, ConversationStore, StorageError};
use crate::tlog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierError(pub String);

impl std::fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "classifier error: {}", self.0)
    }
}

impl std::error::Error for ClassifierError {}

#[async_trait]
pub trait MuteList: Send + Sync {
    async fn muted_pubkeys(&self) -> Result<HashSet<String>, ClassifierError>;
}

#[async_trait]
pub trait FollowList: Send + Sync {
    /// Cached membership test.
    fn is_followed(&self, pubkey: &str) -> bool;

    /// Reload the cached follow set.
    async fn refresh(&self) -> Result<(), ClassifierError>;
}

/// A mute list held in memory.
#[derive(Default)]
pub struct StaticMuteList {
    muted: RwLock<HashSet<String>>,
}

impl StaticMuteList {
    pub fn new(muted: impl IntoIterator<Item = String>) -> Self {
        Self {
            muted: RwLock::new(muted.into_iter().collect()),
        }
    }

    pub fn set(&self, muted: impl IntoIterator<Item = String>) {
        if let Ok(mut guard) = self.muted.write() {
            *guard = muted.into_iter().collect();
        }
    }
}

#[async_trait]
impl MuteList for StaticMuteList {
    async fn muted_pubkeys(&self) -> Result<HashSet<String>, ClassifierError> {
        self.muted
            .read()
            .map(|m| m.clone())
            .map_err(|_| ClassifierError("mute list lock poisoned".into()))
    }
}

/// A follow list held in memory.
#[derive(Default)]
pub struct StaticFollowList {
    followed: RwLock<HashSet<String>>,
}

impl StaticFollowList {
    pub fn new(followed: impl IntoIterator<Item = String>) -> Self {
        Self {
            followed: RwLock::new(followed.into_iter().collect()),
        }
    }

    pub fn set(&self, followed: impl IntoIterator<Item = String>) {
        if let Ok(mut guard) = self.followed.write() {
            *guard = followed.into_iter().collect();
        }
    }
}

#[async_trait]
impl FollowList for StaticFollowList {
    fn is_followed(&self, pubkey: &str) -> bool {
        self.followed
            .read()
            .map(|f| f.contains(pubkey))
            .unwrap_or(false)
    }

    async fn refresh(&self) -> Result<(), ClassifierError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    /// Partners the identity follows.
    Known,
    /// Everyone else.
    Unknown,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub total: u32,
    pub known: u32,
    pub unknown: u32,
}

#[derive(Default)]
struct MuteCache {
    muted: Option<Arc<HashSet<String>>>,
}

pub struct ReadState {
    store: Arc<ConversationStore>,
    mutes: Arc<dyn MuteList>,
    follows: Arc<dyn FollowList>,
    cache: Mutex<MuteCache>,
    generation: AtomicU64,
}

impl ReadState {
    pub fn new(
        store: Arc<ConversationStore>,
        mutes: Arc<dyn MuteList>,
        follows: Arc<dyn FollowList>,
    ) -> Self {
        Self {
            store,
            mutes,
            follows,
            cache: Mutex::new(MuteCache::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Drop the cached mute set; the next query reloads it.
    pub fn notify_mutes_changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut cache) = self.cache.lock() {
            cache.muted = None;
        }
    }

    /// Ask the follow classifier to reload.
    pub async fn notify_follows_changed(&self) {
        if let Err(e) = self.follows.refresh().await {
            tlog!("read state: follow refresh failed: {e}");
        }
    }

    async fn muted(&self) -> Arc<HashSet<String>> {
        if let Some(muted) = self.cache.lock().ok().and_then(|c| c.muted.clone()) {
            return muted;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        match self.mutes.muted_pubkeys().await {
            Ok(set) => {
                let set = Arc::new(set);
                // A change notification during the load makes this set stale.
                if self.generation.load(Ordering::SeqCst) == generation {
                    if let Ok(mut cache) = self.cache.lock() {
                        cache.muted = Some(set.clone());
                    }
                }
                set
            }
            Err(e) => {
                tlog!("read state: mute list unavailable, counting everyone: {e}");
                Arc::new(HashSet::new())
            }
        }
    }

    async fn visible_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        let muted = self.muted().await;
        let conversations = self.store.get_conversations(None, None)?;
        Ok(conversations
            .into_iter()
            .filter(|c| !muted.contains(&c.partner))
            .collect())
    }

    /// Unread messages across all unmuted conversations.
    pub async fn unread_count(&self) -> Result<u32, StorageError> {
        Ok(self
            .visible_conversations()
            .await?
            .iter()
            .fold(0u32, |total, c| total.saturating_add(c.unread_count)))
    }

    pub async fn unread_counts_split(&self) -> Result<UnreadCounts, StorageError> {
        let mut counts = UnreadCounts::default();
        for conv in self.visible_conversations().await? {
            counts.total = counts.total.saturating_add(conv.unread_count);
            if self.follows.is_followed(&conv.partner) {
                counts.known = counts.known.saturating_add(conv.unread_count);
            } else {
                counts.unknown = counts.unknown.saturating_add(conv.unread_count);
            }
        }
        Ok(counts)
    }

    /// Conversations after mute and follow filtering; `offset` and `limit`
    /// apply to the filtered list.
    pub async fn conversations_filtered(
        &self,
        filter: ConversationFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Conversation>, StorageError> {
        let filtered = self
            .visible_conversations()
            .await?
            .into_iter()
            .filter(|c| match filter {
                ConversationFilter::All => true,
                ConversationFilter::Known => self.follows.is_followed(&c.partner),
                ConversationFilter::Unknown => !self.follows.is_followed(&c.partner),
            })
            .skip(offset);
        let result = match limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        };
        Ok(result)
    }

    /// Whether `partner` is hidden by the mute list.
    pub async fn is_muted(&self, partner: &str) -> bool {
        let muted = self.muted().await;
        if muted.contains(partner) {
            crate::tlog_debug!("read state: {} is muted", logging::pubkey(partner));
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Message, MessageFormat};
    use std::sync::atomic::AtomicUsize;

    struct CountingMutes {
        inner: StaticMuteList,
        loads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl MuteList for CountingMutes {
        async fn muted_pubkeys(&self) -> Result<HashSet<String>, ClassifierError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClassifierError("offline".into()));
            }
            self.inner.muted_pubkeys().await
        }
    }

    fn incoming(partner: &str, wrap_id: &str, created_at: u64) -> Message {
        Message {
            id: wrap_id.to_string(),
            pubkey: partner.to_string(),
            content: "hi".into(),
            created_at,
            conversation_with: partner.to_string(),
            reply_to: None,
            subject: None,
            is_mine: false,
            wrap_id: wrap_id.to_string(),
            format: MessageFormat::Layered,
        }
    }

    struct Fixture {
        state: ReadState,
        mutes: Arc<CountingMutes>,
        follows: Arc<StaticFollowList>,
    }

    /// alice: 2 unread (followed), bob: 1 unread, carol: 3 unread (muted),
    /// dave: 1 unread (followed). Newest first: dave, carol, bob, alice.
    fn fixture() -> Fixture {
        let store = Arc::new(ConversationStore::open_in_memory().unwrap());
        store.save_message(&incoming("alice", "a1", 10)).unwrap();
        store.save_message(&incoming("alice", "a2", 11)).unwrap();
        store.save_message(&incoming("bob", "b1", 20)).unwrap();
        for (i, t) in [30, 31, 32].iter().enumerate() {
            store.save_message(&incoming("carol", &format!("c{i}"), *t)).unwrap();
        }
        store.save_message(&incoming("dave", "d1", 40)).unwrap();

        let mutes = Arc::new(CountingMutes {
            inner: StaticMuteList::new(["carol".to_string()]),
            loads: AtomicUsize::new(0),
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        let follows = Arc::new(StaticFollowList::new(["alice".to_string(), "dave".to_string()]));
        Fixture {
            state: ReadState::new(store, mutes.clone(), follows.clone()),
            mutes,
            follows,
        }
    }

    fn partners(convs: Vec<Conversation>) -> Vec<String> {
        convs.into_iter().map(|c| c.partner).collect()
    }

    #[tokio::test]
    async fn unread_count_excludes_muted_partners() {
        let f = fixture();
        assert_eq!(f.state.unread_count().await.unwrap(), 4);
        let split = f.state.unread_counts_split().await.unwrap();
        assert_eq!(
            split,
            UnreadCounts {
                total: 4,
                known: 3,
                unknown: 1
            }
        );
        assert_eq!(split.total, f.state.unread_count().await.unwrap());
    }

    #[tokio::test]
    async fn mute_set_is_cached_until_notified() {
        let f = fixture();
        f.state.unread_count().await.unwrap();
        f.state.unread_count().await.unwrap();
        assert_eq!(f.mutes.loads.load(Ordering::SeqCst), 1);

        f.mutes.inner.set(Vec::<String>::new());
        assert_eq!(f.state.unread_count().await.unwrap(), 4);

        f.state.notify_mutes_changed();
        assert_eq!(f.state.unread_count().await.unwrap(), 7);
        assert_eq!(f.mutes.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_mute_load_counts_everyone_and_retries() {
        let f = fixture();
        f.mutes.fail.store(true, Ordering::SeqCst);
        assert_eq!(f.state.unread_count().await.unwrap(), 7);

        f.mutes.fail.store(false, Ordering::SeqCst);
        assert_eq!(f.state.unread_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn offset_and_limit_apply_after_filtering() {
        let f = fixture();
        let all = f
            .state
            .conversations_filtered(ConversationFilter::All, None, 0)
            .await
            .unwrap();
        assert_eq!(partners(all), vec!["dave", "bob", "alice"]);

        let known = f
            .state
            .conversations_filtered(ConversationFilter::Known, Some(1), 1)
            .await
            .unwrap();
        assert_eq!(partners(known), vec!["alice"]);

        let unknown = f
            .state
            .conversations_filtered(ConversationFilter::Unknown, Some(5), 0)
            .await
            .unwrap();
        assert_eq!(partners(unknown), vec!["bob"]);

        let past_end = f
            .state
            .conversations_filtered(ConversationFilter::Known, None, 2)
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn follow_changes_move_partners_between_lists() {
        let f = fixture();
        f.follows.set(["bob".to_string()]);
        f.state.notify_follows_changed().await;
        let known = f
            .state
            .conversations_filtered(ConversationFilter::Known, None, 0)
            .await
            .unwrap();
        assert_eq!(partners(known), vec!["bob"]);
        assert!(f.state.is_muted("carol").await);
        assert!(!f.state.is_muted("bob").await);
    }

    #[tokio::test]
    async fn totals_saturate_instead_of_overflowing() {
        let dir = std::env::temp_dir().join(format!(
            "sealpost-read-state-{}-{}",
            std::process::id(),
            crate::event::now_secs()
        ));
        let path = crate::storage::db_path(&dir);
        let store = Arc::new(ConversationStore::open(&path).unwrap());
        store.save_message(&incoming("alice", "a1", 1)).unwrap();
        store.save_message(&incoming("bob", "b1", 2)).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute("UPDATE conversations SET unread_count = 4294967295", [])
            .unwrap();

        let state = ReadState::new(
            store,
            Arc::new(StaticMuteList::default()),
            Arc::new(StaticFollowList::new(["alice".to_string()])),
        );
        assert_eq!(state.unread_count().await.unwrap(), u32::MAX);
        assert_eq!(
            state.unread_counts_split().await.unwrap(),
            UnreadCounts {
                total: u32::MAX,
                known: u32::MAX,
                unknown: u32::MAX
            }
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
