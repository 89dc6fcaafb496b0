use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    serde::Serialize,
    tokio::{sync::watch, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use herald_common::now_ms;

use crate::{
    client::NetworkClient,
    pairing::PairingSlot,
    state::{ConnectionState, DisconnectReason},
};

/// How long teardown waits for a session worker before aborting it.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: ConnectionState,
    pub retry_count: u32,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectReason>,
    pub created_at: u64,
}

/// One network connection bound to one session id, across reconnects.
///
/// Owned by the registry. Workers and teardown hold clones of the `Arc`, but
/// only while the registry still lists this exact instance.
pub struct ConnectionSession {
    id: String,
    generation: u64,
    state: watch::Sender<ConnectionState>,
    last_disconnect: Mutex<Option<DisconnectReason>>,
    client: Mutex<Option<Arc<dyn NetworkClient>>>,
    cancel: CancellationToken,
    degraded: AtomicBool,
    pub(crate) pairing: PairingSlot,
    /// sender id -> last inbound activity
    conversations: DashMap<String, Instant>,
    worker: Mutex<Option<JoinHandle<()>>>,
    created_at: u64,
}

impl ConnectionSession {
    pub(crate) fn new(
        id: impl Into<String>,
        generation: u64,
        pairing: PairingSlot,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id: id.into(),
            generation,
            state,
            last_disconnect: Mutex::new(None),
            client: Mutex::new(None),
            cancel,
            degraded: AtomicBool::new(false),
            pairing,
            conversations: DashMap::new(),
            worker: Mutex::new(None),
            created_at: now_ms(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply a state-machine transition. On success returns the previous
    /// state; on rejection returns the unchanged current state.
    pub(crate) fn transition(
        &self,
        next: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(next);
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(*current);
                false
            }
        });
        outcome
    }

    /// Move to `next` from wherever the session is, for teardown paths.
    pub(crate) fn force_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    pub fn last_disconnect(&self) -> Option<DisconnectReason> {
        locked(&self.last_disconnect).clone()
    }

    pub(crate) fn set_last_disconnect(&self, reason: DisconnectReason) {
        *locked(&self.last_disconnect) = Some(reason);
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn NetworkClient>> {
        locked(&self.client).clone()
    }

    pub(crate) fn set_client(&self, client: Arc<dyn NetworkClient>) {
        *locked(&self.client) = Some(client);
    }

    pub(crate) fn take_client(&self) -> Option<Arc<dyn NetworkClient>> {
        locked(&self.client).take()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *locked(&self.worker) = Some(handle);
    }

    /// Wait for the worker to exit after cancellation, aborting it if it hangs.
    pub(crate) async fn join_worker(&self) {
        let Some(handle) = locked(&self.worker).take() else {
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) if e.is_cancelled() => {},
            Ok(Err(e)) => warn!(session_id = %self.id, error = %e, "session worker panicked"),
            Err(_) => {
                warn!(session_id = %self.id, "session worker did not stop, aborting");
                abort.abort();
            },
        }
    }

    pub(crate) fn touch_conversation(&self, sender_id: &str) {
        self.conversations
            .insert(sender_id.to_string(), Instant::now());
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Drop conversations idle for longer than `threshold`, returning their sender ids.
    pub(crate) fn evict_idle_conversations(&self, threshold: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        self.conversations.retain(|sender, last| {
            let keep = last.elapsed() <= threshold;
            if !keep {
                evicted.push(sender.clone());
            }
            keep
        });
        evicted
    }

    pub(crate) fn summary(&self, retry_count: u32) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.state(),
            retry_count,
            degraded: self.is_degraded(),
            last_disconnect: self.last_disconnect(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> ConnectionSession {
        ConnectionSession::new("s1", 1, PairingSlot::detached(), CancellationToken::new())
    }

    #[test]
    fn starts_connecting_and_walks_the_machine() {
        let s = session();
        assert_eq!(s.state(), ConnectionState::Connecting);
        assert_eq!(
            s.transition(ConnectionState::Connected),
            Ok(ConnectionState::Connecting)
        );
        assert_eq!(
            s.transition(ConnectionState::Connecting),
            Err(ConnectionState::Connected)
        );
        assert_eq!(s.state(), ConnectionState::Connected);
        s.transition(ConnectionState::Authenticated).unwrap();
        s.transition(ConnectionState::Disconnected).unwrap();
        s.transition(ConnectionState::Connecting).unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let s = session();
        let mut rx = s.subscribe();
        s.transition(ConnectionState::Connected).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn force_state_ignores_machine() {
        let s = session();
        s.force_state(ConnectionState::Disconnecting);
        s.force_state(ConnectionState::Disconnected);
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn idle_conversations_are_evicted() {
        let s = session();
        s.touch_conversation("u1");
        std::thread::sleep(Duration::from_millis(60));
        s.touch_conversation("u2");
        let evicted = s.evict_idle_conversations(Duration::from_millis(30));
        assert_eq!(evicted, vec!["u1".to_string()]);
        assert_eq!(s.conversation_count(), 1);
    }
}
