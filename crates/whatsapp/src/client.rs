//! The narrow seam between the session core and the external network client.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, tokio::sync::mpsc};

use herald_common::DeliveryReceipt;

use crate::{
    state::{ConnectionState, DisconnectReason},
    store::{RecordChange, SessionKeys},
};

/// The stored "creds" record, or a marker telling the client to start fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Provisioned(Vec<u8>),
    Fresh,
}

impl Credentials {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Authentication material handed to the client on connect.
#[derive(Clone)]
pub struct AuthState {
    pub creds: Credentials,
    pub keys: SessionKeys,
}

/// Connection-level update. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub state: Option<ConnectionState>,
    pub reason: Option<DisconnectReason>,
    /// Pairing payload to show the user as a QR code.
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn state(state: ConnectionState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn disconnected(reason: DisconnectReason) -> Self {
        Self {
            state: Some(ConnectionState::Disconnected),
            reason: Some(reason),
            qr: None,
        }
    }

    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            qr: Some(payload.into()),
            ..Default::default()
        }
    }
}

/// Whether a message batch is new traffic or history sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
}

/// A message as the network reports it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: Option<String>,
    pub remote_jid: Option<String>,
    pub from_me: bool,
    pub timestamp: Option<u64>,
    pub text: Option<String>,
    /// Network-side message type, e.g. "conversation" or "imageMessage".
    pub kind: Option<String>,
}

/// Key of a message to mark as read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub remote_jid: String,
    pub id: String,
}

/// Everything a connection can emit, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connection(ConnectionUpdate),
    /// Rotated key material. `event_id` is acknowledged once persisted.
    Credentials {
        event_id: u64,
        records: Vec<RecordChange>,
    },
    Messages {
        kind: UpsertKind,
        messages: Vec<RawMessage>,
    },
    MessageStatus {
        message_id: String,
        status: String,
    },
    Presence {
        jid: String,
        presence: String,
    },
    Groups(Vec<String>),
    Contacts(Vec<String>),
}

impl NetworkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection.update",
            Self::Credentials { .. } => "creds.update",
            Self::Messages { .. } => "messages.upsert",
            Self::MessageStatus { .. } => "messages.update",
            Self::Presence { .. } => "presence.update",
            Self::Groups(_) => "groups.update",
            Self::Contacts(_) => "contacts.update",
        }
    }
}

/// Operations the core needs from a connected client.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<DeliveryReceipt>;

    async fn read_receipts(&self, keys: &[MessageKey]) -> Result<()>;

    /// Invalidate the credential set on the network side.
    async fn logout(&self) -> Result<()>;

    /// Confirm that the credential event `event_id` has been persisted.
    async fn acknowledge(&self, event_id: u64) -> Result<()>;

    /// Drop the transport without logging out.
    async fn close(&self);
}

/// An open connection: the client plus its ordered event stream.
pub struct Connection {
    pub client: Arc<dyn NetworkClient>,
    pub events: mpsc::Receiver<NetworkEvent>,
}

/// Opens connections to the network.
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    async fn connect(&self, session_id: &str, auth: AuthState) -> Result<Connection>;
}
