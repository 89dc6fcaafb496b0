//! WebSocket adapter to an external network bridge process.
//!
//! One socket per session. Frames are JSON objects tagged by `type`; binary
//! payloads travel base64-encoded. The bridge must not request keys touched
//! by a `creds` event it has not seen acknowledged.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, anyhow, bail},
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD},
    futures::{SinkExt, Stream, StreamExt},
    serde::{Deserialize, Serialize},
    tokio::sync::{Mutex, mpsc, oneshot},
    tokio_tungstenite::{
        connect_async,
        tungstenite::{self, Message},
    },
    tracing::{debug, trace, warn},
};

use {
    herald_common::{DeliveryReceipt, now_ms},
    herald_config::{BridgeConfig, WhatsAppConfig},
};

use crate::{
    client::{
        AuthState, Connection, ConnectionUpdate, Credentials, MessageKey, NetworkClient,
        NetworkConnector, NetworkEvent, RawMessage, UpsertKind,
    },
    state::{ConnectionState, DisconnectReason},
    store::{RecordChange, SessionKeys},
};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Events held by the reader while the consumer is behind. Past this the
/// socket is no longer read.
const BACKLOG_LIMIT: usize = 1024;

// ── Wire frames ──────────────────────────────────────────────────────────────

/// Gateway → bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutFrame {
    Open {
        session_id: String,
        /// Base64 of the stored "creds" record; `null` asks for a fresh login.
        creds: Option<String>,
    },
    Send {
        request_id: u64,
        to: String,
        text: String,
    },
    Read {
        keys: Vec<WireKey>,
    },
    Logout,
    Ack {
        event_id: u64,
    },
    #[serde(rename = "keys.result")]
    KeysResult {
        request_id: u64,
        /// id → base64 payload, `null` when absent.
        keys: HashMap<String, Option<String>>,
    },
}

/// Bridge → gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InFrame {
    Connection {
        state: Option<String>,
        reason: Option<String>,
        status_code: Option<u16>,
        qr: Option<String>,
    },
    Creds {
        event_id: u64,
        records: Vec<WireRecord>,
    },
    Messages {
        upsert_type: String,
        messages: Vec<WireMessage>,
    },
    #[serde(rename = "message.status")]
    MessageStatus { message_id: String, status: String },
    Presence { jid: String, presence: String },
    Groups { ids: Vec<String> },
    Contacts { ids: Vec<String> },
    #[serde(rename = "send.result")]
    SendResult {
        request_id: u64,
        message_id: Option<String>,
        error: Option<String>,
    },
    #[serde(rename = "keys.get")]
    KeysGet {
        request_id: u64,
        category: String,
        ids: Vec<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireKey {
    remote_jid: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMessage {
    id: Option<String>,
    remote_jid: Option<String>,
    from_me: bool,
    timestamp: Option<u64>,
    text: Option<String>,
    kind: Option<String>,
}

impl From<WireMessage> for RawMessage {
    fn from(m: WireMessage) -> Self {
        Self {
            id: m.id,
            remote_jid: m.remote_jid,
            from_me: m.from_me,
            timestamp: m.timestamp,
            text: m.text,
            kind: m.kind,
        }
    }
}

fn parse_state(label: &str) -> Option<ConnectionState> {
    match label {
        "connecting" => Some(ConnectionState::Connecting),
        "connected" => Some(ConnectionState::Connected),
        "open" | "authenticated" => Some(ConnectionState::Authenticated),
        "close" | "closed" | "disconnected" => Some(ConnectionState::Disconnected),
        _ => None,
    }
}

/// Map the network's numeric disconnect codes.
fn reason_from_status(code: u16) -> DisconnectReason {
    match code {
        401 => DisconnectReason::LoggedOut,
        515 => DisconnectReason::RestartRequired,
        428 => DisconnectReason::ConnectionClosed,
        408 => DisconnectReason::ConnectionLost,
        440 => DisconnectReason::ConnectionReplaced,
        500 => DisconnectReason::BadSession,
        other => DisconnectReason::Other(format!("status {other}")),
    }
}

/// What the reader does with one inbound frame.
#[derive(Debug)]
enum Decoded {
    Event(NetworkEvent),
    SendResult {
        request_id: u64,
        result: std::result::Result<String, String>,
    },
    KeysGet {
        request_id: u64,
        category: String,
        ids: Vec<String>,
    },
}

fn decode(text: &str) -> Result<Decoded> {
    let frame: InFrame = serde_json::from_str(text).context("undecodable bridge frame")?;
    let decoded = match frame {
        InFrame::Connection {
            state,
            reason,
            status_code,
            qr,
        } => {
            let state = match state.as_deref() {
                Some(label) => {
                    Some(parse_state(label).ok_or_else(|| anyhow!("unknown state {label:?}"))?)
                },
                None => None,
            };
            let reason = status_code
                .map(reason_from_status)
                .or_else(|| reason.as_deref().map(DisconnectReason::from_label));
            Decoded::Event(NetworkEvent::Connection(ConnectionUpdate { state, reason, qr }))
        },
        InFrame::Creds { event_id, records } => {
            let records = records
                .into_iter()
                .map(|r| {
                    let data = r
                        .data
                        .map(|d| STANDARD.decode(d))
                        .transpose()
                        .with_context(|| format!("record {} is not base64", r.id))?;
                    Ok(RecordChange {
                        record_id: r.id,
                        data,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Decoded::Event(NetworkEvent::Credentials { event_id, records })
        },
        InFrame::Messages {
            upsert_type,
            messages,
        } => {
            let kind = match upsert_type.as_str() {
                "notify" => UpsertKind::Notify,
                "append" => UpsertKind::Append,
                other => bail!("unknown upsert type {other:?}"),
            };
            Decoded::Event(NetworkEvent::Messages {
                kind,
                messages: messages.into_iter().map(Into::into).collect(),
            })
        },
        InFrame::MessageStatus { message_id, status } => {
            Decoded::Event(NetworkEvent::MessageStatus { message_id, status })
        },
        InFrame::Presence { jid, presence } => {
            Decoded::Event(NetworkEvent::Presence { jid, presence })
        },
        InFrame::Groups { ids } => Decoded::Event(NetworkEvent::Groups(ids)),
        InFrame::Contacts { ids } => Decoded::Event(NetworkEvent::Contacts(ids)),
        InFrame::SendResult {
            request_id,
            message_id,
            error,
        } => {
            let result = match (message_id, error) {
                (_, Some(error)) => Err(error),
                (Some(id), None) => Ok(id),
                (None, None) => Err("bridge returned neither id nor error".into()),
            };
            Decoded::SendResult { request_id, result }
        },
        InFrame::KeysGet {
            request_id,
            category,
            ids,
        } => Decoded::KeysGet {
            request_id,
            category,
            ids,
        },
    };
    Ok(decoded)
}

// ── Connector ────────────────────────────────────────────────────────────────

/// Opens one bridge socket per session.
pub struct BridgeConnector {
    url: String,
    queue_capacity: usize,
}

impl BridgeConnector {
    pub fn new(url: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            url: url.into(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn from_config(bridge: &BridgeConfig, whatsapp: &WhatsAppConfig) -> Self {
        Self::new(&bridge.url, whatsapp.event_queue_capacity)
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<String, String>>>>>;

#[async_trait]
impl NetworkConnector for BridgeConnector {
    async fn connect(&self, session_id: &str, auth: AuthState) -> Result<Connection> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to bridge at {}", self.url))?;
        let (mut sink, stream) = ws.split();
        debug!(session_id, url = %self.url, "bridge socket open");

        // Write loop: everything outbound funnels through one channel.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "bridge write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let client = Arc::new(BridgeClient {
            session_id: session_id.to_string(),
            out: out_tx.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(1),
        });

        let creds = match &auth.creds {
            Credentials::Provisioned(bytes) => Some(STANDARD.encode(bytes)),
            Credentials::Fresh => None,
        };
        client.push(&OutFrame::Open {
            session_id: session_id.to_string(),
            creds,
        })?;

        let (events_tx, events_rx) = mpsc::channel(self.queue_capacity);
        let reader = Reader {
            session_id: session_id.to_string(),
            out: out_tx,
            pending: Arc::clone(&client.pending),
            keys: auth.keys,
            events: events_tx,
            backlog: VecDeque::new(),
            backlog_limit: BACKLOG_LIMIT,
            saw_connected: false,
            saw_disconnect: false,
        };
        tokio::spawn(reader.run(stream));

        Ok(Connection {
            client,
            events: events_rx,
        })
    }
}

struct Reader {
    session_id: String,
    out: mpsc::UnboundedSender<Message>,
    pending: Pending,
    keys: SessionKeys,
    events: mpsc::Sender<NetworkEvent>,
    /// Decoded events not yet accepted by the consumer.
    backlog: VecDeque<NetworkEvent>,
    backlog_limit: usize,
    saw_connected: bool,
    saw_disconnect: bool,
}

impl Reader {
    /// Read frames until the socket closes or the consumer goes away.
    ///
    /// Send results and key requests are answered as soon as they are read,
    /// so a slow consumer only delays connection and message events.
    async fn run<S>(mut self, mut stream: S)
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let events = self.events.clone();
            tokio::select! {
                permit = events.reserve(), if !self.backlog.is_empty() => {
                    let Ok(permit) = permit else {
                        debug!(session_id = %self.session_id, "event consumer gone");
                        break;
                    };
                    if let Some(event) = self.backlog.pop_front() {
                        permit.send(event);
                    }
                },
                msg = stream.next(), if self.backlog.len() < self.backlog_limit => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        debug!(session_id = %self.session_id, error = %e, "bridge read failed");
                        break;
                    },
                },
            }
        }
        self.closed().await;
    }

    /// Handle one text frame.
    async fn on_text(&mut self, text: &str) {
        trace!(session_id = %self.session_id, len = text.len(), "bridge -> gateway");
        let decoded = match decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "dropping malformed bridge frame");
                return;
            },
        };
        match decoded {
            Decoded::Event(event) => {
                if let NetworkEvent::Connection(ConnectionUpdate {
                    state: Some(state), ..
                }) = &event
                {
                    match state {
                        ConnectionState::Connected => self.saw_connected = true,
                        // Bridges may report "open" without a separate transport step.
                        ConnectionState::Authenticated if !self.saw_connected => {
                            self.saw_connected = true;
                            let connected = ConnectionUpdate::state(ConnectionState::Connected);
                            self.backlog.push_back(NetworkEvent::Connection(connected));
                        },
                        ConnectionState::Disconnected => self.saw_disconnect = true,
                        _ => {},
                    }
                }
                self.backlog.push_back(event);
            },
            Decoded::SendResult { request_id, result } => {
                match self.pending.lock().await.remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    },
                    None => warn!(session_id = %self.session_id, request_id, "send result for unknown request"),
                }
            },
            Decoded::KeysGet {
                request_id,
                category,
                ids,
            } => {
                let keys = match self.keys.get(&category, &ids).await {
                    Ok(found) => found
                        .into_iter()
                        .map(|(id, data)| (id, data.map(|d| STANDARD.encode(d))))
                        .collect(),
                    Err(e) => {
                        warn!(session_id = %self.session_id, %category, error = %e, "key lookup failed");
                        ids.into_iter().map(|id| (id, None)).collect()
                    },
                };
                if let Ok(frame) = serde_json::to_string(&OutFrame::KeysResult { request_id, keys }) {
                    let _ = self.out.send(Message::Text(frame.into()));
                }
            },
        }
    }

    async fn closed(mut self) {
        debug!(session_id = %self.session_id, "bridge socket closed");
        self.pending.lock().await.clear();
        while let Some(event) = self.backlog.pop_front() {
            if self.events.send(event).await.is_err() {
                return;
            }
        }
        if !self.saw_disconnect {
            let _ = self
                .events
                .send(NetworkEvent::Connection(ConnectionUpdate::disconnected(
                    DisconnectReason::ConnectionLost,
                )))
                .await;
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

struct BridgeClient {
    session_id: String,
    out: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_request: AtomicU64,
}

impl BridgeClient {
    fn push(&self, frame: &OutFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        trace!(session_id = %self.session_id, len = text.len(), "gateway -> bridge");
        self.out
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow!("bridge connection closed"))
    }
}

#[async_trait]
impl NetworkClient for BridgeClient {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<DeliveryReceipt> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self.push(&OutFrame::Send {
            request_id,
            to: recipient_id.to_string(),
            text: text.to_string(),
        }) {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let result = tokio::time::timeout(SEND_TIMEOUT, rx)
            .await
            .context("bridge send timed out")?
            .context("bridge connection closed before send completed")?;
        match result {
            Ok(message_id) => Ok(DeliveryReceipt {
                message_id,
                recipient_id: recipient_id.to_string(),
                sent_at: now_ms(),
            }),
            Err(error) => bail!("send failed: {error}"),
        }
    }

    async fn read_receipts(&self, keys: &[MessageKey]) -> Result<()> {
        self.push(&OutFrame::Read {
            keys: keys
                .iter()
                .map(|k| WireKey {
                    remote_jid: k.remote_jid.clone(),
                    id: k.id.clone(),
                })
                .collect(),
        })
    }

    async fn logout(&self) -> Result<()> {
        self.push(&OutFrame::Logout)
    }

    async fn acknowledge(&self, event_id: u64) -> Result<()> {
        self.push(&OutFrame::Ack { event_id })
    }

    async fn close(&self) {
        // Dropping pending senders fails in-flight sends.
        self.pending.lock().await.clear();
        let _ = self.out.send(Message::Close(None));
    }
}
