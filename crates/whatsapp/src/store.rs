//! Durable per-session credential records.
//!
//! Records are addressed by `(session_id, record_id)`. Record ids are
//! canonicalized to `[A-Za-z0-9._-]` plus `%XX` escapes before they reach the
//! backing store, so the mapping is a bijection and ids containing `/` or `:`
//! never collide.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    tracing::{debug, trace},
};

use herald_common::now_ms;

/// Name of the singular credentials record.
pub const CREDS_RECORD: &str = "creds";

const TREE_PREFIX: &str = "creds/";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential database: {0}")]
    Database(#[from] sled::Error),

    #[error("corrupt record {record_id} for session {session_id}: {source}")]
    Corrupt {
        session_id: String,
        record_id: String,
        #[source]
        source: postcard::Error,
    },

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// A record write (`Some`) or delete (`None`) emitted by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub record_id: String,
    pub data: Option<Vec<u8>>,
}

impl RecordChange {
    pub fn write(record_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            record_id: record_id.into(),
            data: Some(data.into()),
        }
    }

    pub fn delete(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            data: None,
        }
    }
}

/// Per-session key/value persistence for authentication material.
///
/// Reads of absent records return `Ok(None)`. Writes are upserts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn read(&self, session_id: &str, record_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn write(&self, session_id: &str, record_id: &str, payload: &[u8])
    -> Result<(), StoreError>;

    async fn delete(&self, session_id: &str, record_id: &str) -> Result<(), StoreError>;

    /// Remove every record of `session_id`. Returns the number removed.
    async fn delete_session(&self, session_id: &str) -> Result<usize, StoreError>;

    /// Session ids that own at least one record.
    async fn sessions(&self) -> Result<Vec<String>, StoreError>;
}

/// Map a record id onto the storage-safe alphabet.
pub fn canonical_record_id(record_id: &str) -> String {
    let mut out = String::with_capacity(record_id.len());
    for byte in record_id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ── Sled store ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    updated_at: u64,
    data: Vec<u8>,
}

/// Sled-backed store with one tree per session.
#[derive(Clone)]
pub struct SledCredentialStore {
    db: sled::Db,
}

impl SledCredentialStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let db = sled::open(path)?;
        debug!(path = %path.display(), "opened credential store");
        Ok(Self { db })
    }

    /// In-memory database removed on drop.
    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree_name(session_id: &str) -> Vec<u8> {
        let mut name = TREE_PREFIX.as_bytes().to_vec();
        name.extend_from_slice(session_id.as_bytes());
        name
    }

    fn tree(&self, session_id: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(Self::tree_name(session_id))?)
    }
}

#[async_trait]
impl CredentialStore for SledCredentialStore {
    async fn read(&self, session_id: &str, record_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = canonical_record_id(record_id);
        let Some(raw) = self.tree(session_id)?.get(key.as_bytes())? else {
            trace!(session_id, record_id, "credential record not provisioned");
            return Ok(None);
        };
        let record: StoredRecord =
            postcard::from_bytes(&raw).map_err(|source| StoreError::Corrupt {
                session_id: session_id.to_string(),
                record_id: record_id.to_string(),
                source,
            })?;
        Ok(Some(record.data))
    }

    async fn write(
        &self,
        session_id: &str,
        record_id: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let key = canonical_record_id(record_id);
        let record = StoredRecord {
            updated_at: now_ms(),
            data: payload.to_vec(),
        };
        let bytes = postcard::to_allocvec(&record).map_err(|source| StoreError::Corrupt {
            session_id: session_id.to_string(),
            record_id: record_id.to_string(),
            source,
        })?;
        let tree = self.tree(session_id)?;
        tree.insert(key.as_bytes(), bytes)?;
        tree.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str, record_id: &str) -> Result<(), StoreError> {
        let key = canonical_record_id(record_id);
        let tree = self.tree(session_id)?;
        if tree.remove(key.as_bytes())?.is_some() {
            tree.flush_async().await?;
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let name = Self::tree_name(session_id);
        let removed = self.db.open_tree(&name)?.len();
        self.db.drop_tree(&name)?;
        self.db.flush_async().await?;
        debug!(session_id, removed, "purged credential records");
        Ok(removed)
    }

    async fn sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for name in self.db.tree_names() {
            let Some(raw) = name.strip_prefix(TREE_PREFIX.as_bytes()) else {
                continue;
            };
            let Ok(session_id) = std::str::from_utf8(raw) else {
                continue;
            };
            if !self.db.open_tree(&name)?.is_empty() {
                ids.push(session_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Process-memory store, used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: DashMap<(String, String), Vec<u8>>,
    creations: AtomicUsize,
    failing_writes: AtomicU32,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical record ids currently held for `session_id`, sorted.
    pub fn records(&self, session_id: &str) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.into_iter().collect()
    }

    /// Number of writes that created a record rather than overwriting one.
    #[cfg(test)]
    pub(crate) fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Make the next `n` writes fail.
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn read(&self, session_id: &str, record_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = (session_id.to_string(), canonical_record_id(record_id));
        Ok(self.records.get(&key).map(|v| v.value().clone()))
    }

    async fn write(
        &self,
        session_id: &str,
        record_id: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        let key = (session_id.to_string(), canonical_record_id(record_id));
        if self.records.insert(key, payload.to_vec()).is_none() {
            self.creations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str, record_id: &str) -> Result<(), StoreError> {
        let key = (session_id.to_string(), canonical_record_id(record_id));
        self.records.remove(&key);
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|(owner, _), _| owner != session_id);
        Ok(before - self.records.len())
    }

    async fn sessions(&self) -> Result<Vec<String>, StoreError> {
        let ids: BTreeSet<String> = self
            .records
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}

// ── Session-scoped key view ─────────────────────────────────────────────────

/// Signal key material of one session, addressed as `{category}-{id}`.
#[derive(Clone)]
pub struct SessionKeys {
    session_id: String,
    store: Arc<dyn CredentialStore>,
}

impl SessionKeys {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record_id(category: &str, id: &str) -> String {
        format!("{category}-{id}")
    }

    /// Fetch several keys of one category. Missing keys map to `None`.
    pub async fn get(
        &self,
        category: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError> {
        let reads = ids.iter().map(|id| async move {
            let value = self
                .store
                .read(&self.session_id, &Self::record_id(category, id))
                .await?;
            Ok::<_, StoreError>((id.clone(), value))
        });
        Ok(futures::future::try_join_all(reads)
            .await?
            .into_iter()
            .collect())
    }

    /// Persist one change: `Some` upserts, `None` deletes.
    pub async fn set(&self, change: &RecordChange) -> Result<(), StoreError> {
        match &change.data {
            Some(data) => {
                self.store
                    .write(&self.session_id, &change.record_id, data)
                    .await
            },
            None => self.store.delete(&self.session_id, &change.record_id).await,
        }
    }
}
