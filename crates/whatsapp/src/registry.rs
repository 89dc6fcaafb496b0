use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    herald_channels::{ChannelHealthSnapshot, ChannelOutbound, ChannelStatus, ConversationEngine},
    herald_common::DeliveryReceipt,
    herald_config::WhatsAppConfig,
};

use crate::{
    client::NetworkConnector,
    error::{Error, PairingError, Result},
    pairing::{PairingOutcome, PairingSlot},
    policy::{ReconnectPolicy, RetryLedger},
    session::{ConnectionSession, SessionSummary},
    state::{ConnectionState, DisconnectReason},
    stats,
    store::{CredentialStore, StoreError},
    worker,
};

const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids become part of storage keys and log fields.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSessionId(id.to_string()))
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Result of re-creating every session found in the credential store.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub errors: Vec<(String, Error)>,
}

/// How a session leaves the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The network invalidated the credentials.
    LoggedOut,
    /// Reconnect budget spent. Credentials stay for manual re-creation.
    RetriesExhausted(DisconnectReason),
    /// A handed-out pairing code expired unscanned.
    PairingExpired,
    PairingTimedOut(Duration),
    Deleted,
}

impl Termination {
    fn purges(&self) -> bool {
        !matches!(self, Self::RetriesExhausted(_))
    }

    fn logs_out(&self) -> bool {
        matches!(
            self,
            Self::PairingExpired | Self::PairingTimedOut(_) | Self::Deleted
        )
    }

    fn pairing_error(&self) -> PairingError {
        match self {
            Self::LoggedOut => PairingError::SessionEnded(DisconnectReason::LoggedOut),
            Self::RetriesExhausted(reason) => PairingError::SessionEnded(reason.clone()),
            Self::PairingTimedOut(after) => PairingError::TimedOut(*after),
            Self::PairingExpired | Self::Deleted => PairingError::Removed,
        }
    }
}

// ── Per-id locks ─────────────────────────────────────────────────────────────

/// Serializes lifecycle operations on one session id. Different ids never
/// wait on each other.
#[derive(Default)]
struct IdLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdLocks {
    async fn lock(&self, id: &str) -> IdGuard<'_> {
        let lock = Arc::clone(self.locks.entry(id.to_string()).or_default().value());
        IdGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Forget the lock once nobody holds or awaits it.
        self.locks
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

/// Collaborators and policy shared by every session worker.
pub(crate) struct RegistryShared {
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) connector: Arc<dyn NetworkConnector>,
    engine: RwLock<Option<Arc<dyn ConversationEngine>>>,
    pub(crate) ledger: RetryLedger,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) config: WhatsAppConfig,
}

impl RegistryShared {
    pub(crate) async fn engine(&self) -> Option<Arc<dyn ConversationEngine>> {
        self.engine.read().await.clone()
    }
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<ConnectionSession>>>,
    locks: IdLocks,
    shared: RegistryShared,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// The single source of truth for which sessions are live.
///
/// Cheap to clone; clones share the same map. Create one at process start,
/// hand it to whatever needs session lookup, and call
/// [`shutdown`](Self::shutdown) on exit.
///
/// Create, delete and teardown of one id are serialized. Operations on
/// different ids run concurrently, so a session stuck in teardown never
/// delays another.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn NetworkConnector>,
        config: &WhatsAppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                locks: IdLocks::default(),
                shared: RegistryShared {
                    store,
                    connector,
                    engine: RwLock::new(None),
                    ledger: RetryLedger::new(),
                    policy: ReconnectPolicy::from_config(config),
                    config: config.clone(),
                },
                generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Late-bind the conversation engine (it usually needs the registry to reply).
    pub async fn set_engine(&self, engine: Arc<dyn ConversationEngine>) {
        *self.inner.shared.engine.write().await = Some(engine);
    }

    pub(crate) fn shared(&self) -> &RegistryShared {
        &self.inner.shared
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Credential store backing this registry.
    pub fn store(&self) -> Arc<dyn CredentialStore> {
        Arc::clone(&self.inner.shared.store)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start a session, or return the live one under the same id untouched.
    pub async fn create(&self, session_id: &str) -> Result<SessionSummary> {
        validate_session_id(session_id)?;
        let _guard = self.inner.locks.lock(session_id).await;
        self.ensure_running()?;

        if let Some(existing) = self.live(session_id).await {
            debug!(session_id, "session already live");
            return Ok(self.summarize(&existing));
        }
        let session = self.spawn(session_id, PairingSlot::detached()).await?;
        info!(session_id, generation = session.generation(), "session created");
        Ok(self.summarize(&session))
    }

    /// Start a fresh session for an interactive caller and wait for its
    /// pairing code, bounded by the pairing timeout.
    ///
    /// Fails with [`Error::AlreadyExists`] if the id is live. When stored
    /// credentials are still valid the session authenticates without a code
    /// and [`PairingOutcome::Authenticated`] is returned.
    pub async fn create_with_pairing(&self, session_id: &str) -> Result<PairingOutcome> {
        validate_session_id(session_id)?;
        let (session, rx) = {
            let _guard = self.inner.locks.lock(session_id).await;
            self.ensure_running()?;
            if self.live(session_id).await.is_some() {
                return Err(Error::AlreadyExists(session_id.to_string()));
            }
            let (slot, rx) = PairingSlot::attached();
            (self.spawn(session_id, slot).await?, rx)
        };
        info!(session_id, "waiting for pairing code");

        let timeout = self.inner.shared.config.pairing_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) => Err(PairingError::Removed.into()),
            Err(_) => {
                warn!(session_id, timeout_secs = timeout.as_secs(), "pairing timed out");
                self.evict(&session, Termination::PairingTimedOut(timeout))
                    .await;
                Err(PairingError::TimedOut(timeout).into())
            },
        }
    }

    /// Tear a session down and purge its credentials.
    pub async fn delete(&self, session_id: &str) -> Result<DeleteOutcome> {
        let _guard = self.inner.locks.lock(session_id).await;
        let Some(session) = self.take(session_id).await else {
            debug!(session_id, "delete of unknown session");
            return Ok(DeleteOutcome::NotFound);
        };
        session.cancel();
        session.join_worker().await;
        self.release(&session, &Termination::Deleted).await?;
        info!(session_id, "session deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Re-create a session for every id that has stored credentials.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let ids = self.inner.shared.store.sessions().await?;
        let mut report = RestoreReport::default();
        for id in ids {
            match self.create(&id).await {
                Ok(_) => report.restored.push(id),
                Err(e) => {
                    error!(session_id = %id, error = %e, "failed to restore session");
                    report.errors.push((id, e));
                },
            }
        }
        info!(
            restored = report.restored.len(),
            failed = report.errors.len(),
            "sessions restored"
        );
        Ok(report)
    }

    /// Stop every session. Clients are closed without logging out and
    /// credentials are kept, so [`restore`](Self::restore) picks them up again.
    pub async fn shutdown(&self) {
        // Every session token is a child of this one.
        self.inner.shutdown.cancel();
        let drained: Vec<_> = {
            let mut sessions = self.inner.sessions.write().await;
            let drained = sessions.drain().map(|(_, s)| s).collect();
            stats::live_sessions(0);
            drained
        };
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|session| async move {
            session.join_worker().await;
            session.force_state(ConnectionState::Disconnecting);
            if let Some(client) = session.take_client() {
                client.close().await;
            }
            session.pairing.fail(PairingError::Removed);
            self.inner.shared.ledger.remove(session.id());
            session.force_state(ConnectionState::Disconnected);
        }))
        .await;
        info!(sessions = count, "session registry shut down");
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn get(&self, session_id: &str) -> Option<Arc<ConnectionSession>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionSummary> {
        self.get(session_id).await.map(|s| self.summarize(&s))
    }

    /// Every live session, ordered by id.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.read().await;
        let mut summaries: Vec<_> = sessions.values().map(|s| self.summarize(s)).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Watch connection-state changes of a live session.
    pub async fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.get(session_id).await.map(|s| s.subscribe())
    }

    /// Drop idle conversation entries across sessions.
    /// Returns `(session_id, sender_id)` for each evicted conversation.
    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<(String, String)> {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        sessions
            .iter()
            .flat_map(|session| {
                session
                    .evict_idle_conversations(threshold)
                    .into_iter()
                    .map(move |sender| (session.id().to_string(), sender))
            })
            .collect()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn summarize(&self, session: &ConnectionSession) -> SessionSummary {
        session.summary(self.inner.shared.ledger.get(session.id()))
    }

    async fn live(&self, session_id: &str) -> Option<Arc<ConnectionSession>> {
        self.get(session_id)
            .await
            .filter(|session| !session.is_cancelled())
    }

    /// Build a session, publish it, then start its worker. The map only ever
    /// holds fully constructed sessions. Caller holds the id lock.
    async fn spawn(
        &self,
        session_id: &str,
        pairing: PairingSlot,
    ) -> Result<Arc<ConnectionSession>> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ConnectionSession::new(
            session_id,
            generation,
            pairing,
            self.inner.shutdown.child_token(),
        ));
        {
            let mut sessions = self.inner.sessions.write().await;
            // Checked under the map lock so nothing is inserted after shutdown drains.
            self.ensure_running()?;
            if let Some(stale) = sessions.insert(session_id.to_string(), Arc::clone(&session)) {
                stale.cancel();
            }
            stats::live_sessions(sessions.len());
        }
        stats::session_created();
        let handle = tokio::spawn(worker::run(self.clone(), Arc::clone(&session)));
        session.set_worker(handle);
        Ok(session)
    }

    async fn take(&self, session_id: &str) -> Option<Arc<ConnectionSession>> {
        let mut sessions = self.inner.sessions.write().await;
        let taken = sessions.remove(session_id);
        stats::live_sessions(sessions.len());
        taken
    }

    /// Whether `session` is still the registered instance for its id.
    pub(crate) async fn is_current(&self, session: &Arc<ConnectionSession>) -> bool {
        self.inner
            .sessions
            .read()
            .await
            .get(session.id())
            .is_some_and(|live| Arc::ptr_eq(live, session))
    }

    async fn remove_if_current(&self, session: &Arc<ConnectionSession>) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        let current = sessions
            .get(session.id())
            .is_some_and(|live| Arc::ptr_eq(live, session));
        if current {
            sessions.remove(session.id());
            stats::live_sessions(sessions.len());
        }
        current
    }

    /// Called from the session's own worker when it reaches a terminal state.
    ///
    /// Whoever else holds the id lock (delete, pairing eviction) cancels this
    /// session before joining its worker, so waiting here never deadlocks.
    pub(crate) async fn terminate(&self, session: &Arc<ConnectionSession>, how: Termination) {
        let _guard = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            guard = self.inner.locks.lock(session.id()) => guard,
        };
        if !self.is_current(session).await {
            debug!(session_id = %session.id(), "terminal session already removed");
            return;
        }
        session.cancel();
        info!(session_id = %session.id(), termination = ?how, "session removed");
        // Purge while still registered; a re-create of this id waits on the lock.
        if let Err(e) = self.release(session, &how).await {
            error!(session_id = %session.id(), error = %e, "failed to purge credentials");
        }
        self.remove_if_current(session).await;
    }

    /// Remove a session from outside its worker.
    async fn evict(&self, session: &Arc<ConnectionSession>, how: Termination) {
        let _guard = self.inner.locks.lock(session.id()).await;
        if !self.remove_if_current(session).await {
            return;
        }
        session.cancel();
        session.join_worker().await;
        if let Err(e) = self.release(session, &how).await {
            error!(session_id = %session.id(), error = %e, "failed to purge credentials");
        }
    }

    /// Release everything a removed session holds.
    async fn release(
        &self,
        session: &ConnectionSession,
        how: &Termination,
    ) -> Result<(), StoreError> {
        let session_id = session.id();
        session.force_state(ConnectionState::Disconnecting);
        if let Some(client) = session.take_client() {
            if how.logs_out()
                && let Err(e) = client.logout().await
            {
                warn!(session_id, error = %e, "logout failed");
            }
            client.close().await;
        }
        session.pairing.fail(how.pairing_error());
        self.inner.shared.ledger.remove(session_id);

        let purged = if how.purges() {
            let removed = self.inner.shared.store.delete_session(session_id).await;
            if let Ok(count) = &removed {
                debug!(session_id, records = count, "credentials purged");
            }
            removed.map(|_| ())
        } else {
            Ok(())
        };
        session.force_state(ConnectionState::Disconnected);
        purged
    }
}

// ── Channel surfaces ─────────────────────────────────────────────────────────

#[async_trait]
impl ChannelOutbound for SessionRegistry {
    async fn send_text(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
    ) -> anyhow::Result<DeliveryReceipt> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        let client = session
            .client()
            .filter(|_| session.state() == ConnectionState::Authenticated)
            .ok_or_else(|| Error::NotAuthenticated(session_id.to_string()))?;
        let receipt = client.send(to, text).await?;
        debug!(session_id, to, message_id = %receipt.message_id, "message sent");
        Ok(receipt)
    }
}

#[async_trait]
impl ChannelStatus for SessionRegistry {
    async fn health(&self, session_id: &str) -> anyhow::Result<ChannelHealthSnapshot> {
        let summary = self
            .status(session_id)
            .await
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        let mut details = format!("{} (retries {})", summary.status, summary.retry_count);
        if summary.degraded {
            details.push_str(", credential persistence degraded");
        }
        if let Some(reason) = &summary.last_disconnect {
            details.push_str(&format!(", last disconnect: {reason}"));
        }
        Ok(ChannelHealthSnapshot {
            connected: summary.status == ConnectionState::Authenticated,
            session_id: summary.id,
            details: Some(details),
        })
    }
}
