//! Durable storage of ledger snapshots for crash recovery.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use super::ledger::{Ledger, LedgerSnapshot};
use crate::error::{BotError, StoreError};

/// Opaque durable key-value slot for the ledger snapshot.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read the last saved snapshot, if any.
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError>;

    /// Replace the saved snapshot.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;
}

/// Snapshot stored as pretty JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Ledger snapshot saved");
        Ok(())
    }
}

/// In-memory store, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: parking_lot::Mutex<Option<LedgerSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with `snapshot`.
    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            slot: parking_lot::Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last saved snapshot.
    pub fn latest(&self) -> Option<LedgerSnapshot> {
        self.slot.lock().clone()
    }

    /// Number of saves performed.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        *self.slot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Ledger paired with its store.
///
/// Saves are serialized and each one snapshots the ledger after taking the
/// save lock, so the newest state is always the one left on disk.
#[derive(Clone)]
pub struct LedgerPersistence {
    ledger: Ledger,
    store: Arc<dyn LedgerStore>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for LedgerPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerPersistence")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl LedgerPersistence {
    /// Restore the ledger from `store`, or seed it with `start_bankroll`.
    #[instrument(skip(store))]
    pub async fn open(store: Arc<dyn LedgerStore>, start_bankroll: Decimal) -> Result<Self, BotError> {
        let ledger = match store.load().await? {
            Some(snapshot) => Ledger::restore(snapshot)?,
            None => {
                info!(start_bankroll = %start_bankroll, "No persisted ledger, seeding");
                Ledger::new(start_bankroll)
            }
        };
        Ok(Self::new(ledger, store))
    }

    /// Pair an existing ledger with a store.
    pub fn new(ledger: Ledger, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            store,
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The ledger handle.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Write the current ledger state.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.ledger.snapshot();
        self.store.save(&snapshot).await
    }
}
