//! Scripted network doubles for lifecycle tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    tokio::sync::mpsc,
};

use {
    herald_channels::ConversationEngine,
    herald_common::{DeliveryReceipt, InboundMessage},
    herald_config::WhatsAppConfig,
};

use crate::{
    client::{
        AuthState, Connection, ConnectionUpdate, MessageKey, NetworkClient, NetworkConnector,
        NetworkEvent, RawMessage, UpsertKind,
    },
    registry::SessionRegistry,
    state::{ConnectionState, DisconnectReason},
    store::{CredentialStore, MemoryCredentialStore, RecordChange},
};

pub(crate) const WAIT: Duration = Duration::from_secs(3);

// ── Client ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MockClient {
    pub sends: Mutex<Vec<(String, String)>>,
    pub reads: Mutex<Vec<MessageKey>>,
    pub acks: Mutex<Vec<u64>>,
    pub logouts: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_sends: AtomicBool,
}

impl MockClient {
    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reads(&self) -> Vec<MessageKey> {
        self.reads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NetworkClient for MockClient {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<DeliveryReceipt> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("send rejected");
        }
        let mut sends = self.sends.lock().unwrap_or_else(|e| e.into_inner());
        sends.push((recipient_id.to_string(), text.to_string()));
        Ok(DeliveryReceipt::new(format!("out-{}", sends.len()), recipient_id))
    }

    async fn read_receipts(&self, keys: &[MessageKey]) -> Result<()> {
        self.reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(keys);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acknowledge(&self, event_id: u64) -> Result<()> {
        self.acks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event_id);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

/// One open mock connection, held by the test to script the network side.
/// Dropping it closes the event stream.
pub(crate) struct MockLink {
    pub session_id: String,
    pub events: mpsc::Sender<NetworkEvent>,
    pub client: Arc<MockClient>,
    pub auth: AuthState,
}

impl MockLink {
    pub async fn emit(&self, event: NetworkEvent) {
        self.events.send(event).await.unwrap_or_else(|_| {
            panic!("session {} stopped consuming events", self.session_id)
        });
    }

    pub async fn state(&self, state: ConnectionState) {
        self.emit(NetworkEvent::Connection(ConnectionUpdate::state(state)))
            .await;
    }

    /// Transport up, then identity confirmed.
    pub async fn open(&self) {
        self.state(ConnectionState::Connected).await;
        self.state(ConnectionState::Authenticated).await;
    }

    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.emit(NetworkEvent::Connection(ConnectionUpdate::disconnected(
            reason,
        )))
        .await;
    }

    pub async fn qr(&self, payload: &str) {
        self.emit(NetworkEvent::Connection(ConnectionUpdate::qr(payload)))
            .await;
    }

    pub async fn creds(&self, event_id: u64, records: Vec<RecordChange>) {
        self.emit(NetworkEvent::Credentials { event_id, records })
            .await;
    }

    pub async fn text(&self, id: &str, from: &str, text: &str) {
        self.emit(NetworkEvent::Messages {
            kind: UpsertKind::Notify,
            messages: vec![RawMessage {
                id: Some(id.into()),
                remote_jid: Some(from.into()),
                from_me: false,
                timestamp: Some(1_700_000_000),
                text: Some(text.into()),
                kind: Some("conversation".into()),
            }],
        })
        .await;
    }
}

pub(crate) struct MockConnector {
    links: mpsc::UnboundedSender<MockLink>,
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
    /// Connect attempts never complete while set.
    pub hang: AtomicBool,
}

#[async_trait]
impl NetworkConnector for MockConnector {
    async fn connect(&self, session_id: &str, auth: AuthState) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            bail!("network unreachable");
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (tx, rx) = mpsc::channel(64);
        let client = Arc::new(MockClient::default());
        let link = MockLink {
            session_id: session_id.to_string(),
            events: tx,
            client: Arc::clone(&client),
            auth,
        };
        if self.links.send(link).is_err() {
            bail!("test harness gone");
        }
        Ok(Connection { client, events: rx })
    }
}

/// The test's end of the connector: every connect attempt shows up here.
pub(crate) struct MockLinks {
    rx: mpsc::UnboundedReceiver<MockLink>,
}

impl MockLinks {
    pub async fn next(&mut self) -> MockLink {
        match tokio::time::timeout(WAIT, self.rx.recv()).await {
            Ok(Some(link)) => link,
            _ => panic!("no connection attempt within {WAIT:?}"),
        }
    }

    /// Assert no connection attempt arrives within `within`.
    pub async fn none(&mut self, within: Duration) {
        if let Ok(Some(link)) = tokio::time::timeout(within, self.rx.recv()).await {
            panic!("unexpected connection attempt for {}", link.session_id);
        }
    }
}

pub(crate) fn mock_connector() -> (Arc<MockConnector>, MockLinks) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockConnector {
            links: tx,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        }),
        MockLinks { rx },
    )
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingEngine {
    pub inbound: Mutex<Vec<InboundMessage>>,
    pub idle: Mutex<Vec<(String, String)>>,
    pub fail: AtomicBool,
}

impl RecordingEngine {
    pub fn inbound(&self) -> Vec<InboundMessage> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn idle(&self) -> Vec<(String, String)> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ConversationEngine for RecordingEngine {
    async fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        if self.fail.load(Ordering::SeqCst) {
            bail!("engine exploded");
        }
        Ok(())
    }

    async fn conversation_idle(&self, session_id: &str, sender_id: &str) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((session_id.to_string(), sender_id.to_string()));
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub(crate) fn test_config() -> WhatsAppConfig {
    WhatsAppConfig {
        reconnect_interval_ms: 10,
        connect_timeout_secs: 2,
        pairing_timeout_secs: 2,
        persist_retry_ms: 1,
        ..Default::default()
    }
}

pub(crate) struct Harness {
    pub registry: SessionRegistry,
    pub links: MockLinks,
    pub connector: Arc<MockConnector>,
    pub store: Arc<MemoryCredentialStore>,
    pub engine: Arc<RecordingEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: WhatsAppConfig) -> Self {
        let store = Arc::new(MemoryCredentialStore::new());
        let (connector, links) = mock_connector();
        let registry = SessionRegistry::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&connector) as Arc<dyn NetworkConnector>,
            &config,
        );
        let engine = Arc::new(RecordingEngine::default());
        registry
            .set_engine(Arc::clone(&engine) as Arc<dyn ConversationEngine>)
            .await;
        Self {
            registry,
            links,
            connector,
            store,
            engine,
        }
    }

    /// Create `id`, take its connection and drive it to AUTHENTICATED.
    pub async fn authenticated(&mut self, id: &str) -> MockLink {
        self.registry.create(id).await.unwrap_or_else(|e| panic!("create {id}: {e}"));
        let link = self.links.next().await;
        link.open().await;
        self.wait_state(id, ConnectionState::Authenticated).await;
        link
    }

    pub async fn wait_state(&self, id: &str, state: ConnectionState) {
        let Some(mut rx) = self.registry.subscribe(id).await else {
            panic!("session {id} is not live");
        };
        let reached = match tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => panic!("session {id} dropped before reaching {state}"),
            Err(_) => false,
        };
        if !reached {
            panic!("session {id} never reached {state}, stuck at {}", *rx.borrow());
        }
    }

    pub async fn wait_removed(&self, id: &str) {
        self.wait_until(|| async move { self.registry.get(id).await.is_none() })
            .await;
    }

    pub async fn wait_until<F, Fut>(&self, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check().await {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met within {WAIT:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
