//! The messaging service: one explicitly constructed instance that owns the
//! store, the sync coordinator and the read-state layer.
//!
//! ```ignore
//! let service = MessagingService::init(&config, &db, transport, mutes, follows)?;
//! service.start(signer).await?;
//! let receipt = service.send(&bob, "hi", None).await?;
//! service.stop().await;
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::SealpostConfig;
use crate::read_state::{FollowList, MuteList, ReadState};
use crate::relays::RelayResolver;
use crate::signer::Signer;
use crate::storage::{ConversationStore, StorageError};
use crate::sync::{SendReceipt, SyncCoordinator, SyncError, SyncEvent, SyncState};
use crate::transport::Transport;

pub struct MessagingService {
    store: Arc<ConversationStore>,
    sync: SyncCoordinator,
    read_state: ReadState,
}

impl MessagingService {
    /// Open the database at `db_path` and wire the components together.
    pub fn init(
        config: &SealpostConfig,
        db_path: &Path,
        transport: Arc<dyn Transport>,
        mutes: Arc<dyn MuteList>,
        follows: Arc<dyn FollowList>,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(ConversationStore::open(db_path)?);
        Ok(Self::with_store(config, store, transport, mutes, follows))
    }

    /// Build the service around an already opened store.
    pub fn with_store(
        config: &SealpostConfig,
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
        mutes: Arc<dyn MuteList>,
        follows: Arc<dyn FollowList>,
    ) -> Self {
        let relays = Arc::new(RelayResolver::new(transport.clone(), config));
        let sync = SyncCoordinator::new(store.clone(), transport, relays, config);
        let read_state = ReadState::new(store.clone(), mutes, follows);
        Self {
            store,
            sync,
            read_state,
        }
    }

    pub async fn start(&self, signer: Arc<dyn Signer>) -> Result<(), SyncError> {
        self.sync.start(signer).await
    }

    pub async fn stop(&self) {
        self.sync.stop().await
    }

    /// Stop syncing and delete all local messages.
    pub async fn clear(&self) -> Result<(), SyncError> {
        self.sync.clear().await
    }

    pub async fn send(
        &self,
        recipient: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<SendReceipt, SyncError> {
        self.sync.send(recipient, content, reply_to).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn read_state(&self) -> &ReadState {
        &self.read_state
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }
}
