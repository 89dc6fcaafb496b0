//! Ordered consumption of one connection's event stream.

use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{debug, error, info, trace, warn},
};

use herald_common::{InboundMessage, now_ms};

use crate::{
    client::{MessageKey, NetworkClient, NetworkEvent, RawMessage, UpsertKind},
    pairing::QrAction,
    registry::RegistryShared,
    session::ConnectionSession,
    state::{ConnectionState, DisconnectReason},
    stats,
    store::{RecordChange, SessionKeys, StoreError},
};

/// Why a connection's event loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEnd {
    Disconnected(DisconnectReason),
    /// A handed-out pairing code expired unscanned, or could not be rendered.
    PairingExpired,
    Cancelled,
}

/// Why a raw message was dropped instead of forwarded.
#[derive(Debug, PartialEq, Eq)]
enum Skip {
    Malformed(&'static str),
    OwnMessage,
    NotText,
}

/// Normalize a raw network message into what the conversation engine sees.
fn normalize(session_id: &str, raw: &RawMessage) -> Result<InboundMessage, Skip> {
    let sender_id = raw
        .remote_jid
        .as_deref()
        .filter(|jid| !jid.is_empty())
        .ok_or(Skip::Malformed("missing sender"))?;
    if raw.from_me {
        return Err(Skip::OwnMessage);
    }
    let text = raw
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(Skip::NotText)?;
    Ok(InboundMessage {
        session_id: session_id.to_string(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        timestamp: raw
            .timestamp
            .unwrap_or_else(|| now_ms() / 1000),
        message_id: raw.id.clone(),
    })
}

pub(crate) struct Dispatcher<'a> {
    session: &'a ConnectionSession,
    shared: &'a RegistryShared,
    client: Arc<dyn NetworkClient>,
    keys: SessionKeys,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        session: &'a ConnectionSession,
        shared: &'a RegistryShared,
        client: Arc<dyn NetworkClient>,
    ) -> Self {
        let keys = SessionKeys::new(session.id(), Arc::clone(&shared.store));
        Self {
            session,
            shared,
            client,
            keys,
        }
    }

    /// Consume events strictly in arrival order until the connection ends.
    pub(crate) async fn run(self, mut events: mpsc::Receiver<NetworkEvent>) -> ConnectionEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.session.cancelled() => return ConnectionEnd::Cancelled,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!(session_id = %self.session.id(), "event stream closed");
                return self.disconnected(DisconnectReason::ConnectionLost);
            };
            let end = tokio::select! {
                biased;
                _ = self.session.cancelled() => return ConnectionEnd::Cancelled,
                end = self.dispatch(event) => end,
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    async fn dispatch(&self, event: NetworkEvent) -> Option<ConnectionEnd> {
        let session_id = self.session.id();
        trace!(session_id, kind = event.kind(), "dispatching event");

        match event {
            NetworkEvent::Connection(update) => {
                if let Some(qr) = update.qr.as_deref() {
                    match self.session.pairing.on_qr(qr) {
                        QrAction::Ignore => {
                            debug!(session_id, "pairing code ignored, no interactive caller")
                        },
                        QrAction::Delivered => info!(session_id, "pairing code issued"),
                        QrAction::TearDown => {
                            warn!(session_id, "pairing code expired unscanned");
                            return Some(ConnectionEnd::PairingExpired);
                        },
                    }
                }
                let next = update.state?;
                if next == ConnectionState::Disconnected {
                    let reason = update.reason.unwrap_or(DisconnectReason::ConnectionClosed);
                    return Some(self.disconnected(reason));
                }
                self.apply_state(next);
                None
            },
            NetworkEvent::Credentials { event_id, records } => {
                self.persist_credentials(event_id, &records).await;
                None
            },
            NetworkEvent::Messages { kind, messages } => {
                if kind != UpsertKind::Notify {
                    debug!(session_id, count = messages.len(), "skipping history batch");
                    return None;
                }
                for raw in &messages {
                    self.handle_message(raw).await;
                }
                None
            },
            NetworkEvent::MessageStatus { message_id, status } => {
                info!(session_id, %message_id, %status, "message status update");
                None
            },
            NetworkEvent::Presence { jid, presence } => {
                info!(session_id, %jid, %presence, "presence update");
                None
            },
            NetworkEvent::Groups(ids) => {
                info!(session_id, groups = ?ids, "group update");
                None
            },
            NetworkEvent::Contacts(ids) => {
                info!(session_id, contacts = ?ids, "contact update");
                None
            },
        }
    }

    fn disconnected(&self, reason: DisconnectReason) -> ConnectionEnd {
        self.session.force_state(ConnectionState::Disconnected);
        self.session.set_last_disconnect(reason.clone());
        ConnectionEnd::Disconnected(reason)
    }

    fn apply_state(&self, next: ConnectionState) {
        let session_id = self.session.id();
        match self.session.transition(next) {
            Ok(previous) => {
                debug!(session_id, %previous, %next, "connection state changed");
                match next {
                    ConnectionState::Connected => info!(session_id, "transport connected"),
                    ConnectionState::Authenticated => {
                        self.shared.ledger.reset(session_id);
                        self.session.pairing.on_authenticated();
                        info!(session_id, "connection opened successfully");
                    },
                    _ => {},
                }
            },
            Err(current) => {
                warn!(session_id, %current, %next, "dropping illegal state transition");
            },
        }
    }

    async fn persist_credentials(&self, event_id: u64, records: &[RecordChange]) {
        let session_id = self.session.id();
        for change in records {
            if let Err(e) = self.persist(change).await {
                error!(
                    session_id,
                    record_id = %change.record_id,
                    error = %e,
                    "credential write failed, session degraded"
                );
                self.session.mark_degraded();
                stats::session_degraded();
                return;
            }
        }
        debug!(session_id, event_id, count = records.len(), "credentials updated");
        if let Err(e) = self.client.acknowledge(event_id).await {
            warn!(session_id, event_id, error = %e, "failed to acknowledge credential event");
        }
    }

    async fn persist(&self, change: &RecordChange) -> Result<(), StoreError> {
        let attempts = self.shared.config.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.keys.set(change).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    stats::credential_write_failed();
                    warn!(
                        session_id = %self.session.id(),
                        record_id = %change.record_id,
                        attempt,
                        error = %e,
                        "credential write failed, retrying"
                    );
                    tokio::time::sleep(self.shared.config.persist_retry()).await;
                    attempt += 1;
                },
                Err(e) => {
                    stats::credential_write_failed();
                    return Err(e);
                },
            }
        }
    }

    async fn handle_message(&self, raw: &RawMessage) {
        let session_id = self.session.id();
        let message = match normalize(session_id, raw) {
            Ok(message) => message,
            Err(Skip::Malformed(why)) => {
                warn!(session_id, message_id = ?raw.id, why, "dropping malformed message");
                return;
            },
            Err(skip) => {
                debug!(session_id, message_id = ?raw.id, ?skip, kind = ?raw.kind, "message not forwarded");
                return;
            },
        };
        if self.session.state() != ConnectionState::Authenticated {
            warn!(session_id, state = %self.session.state(), "dropping message received before authentication");
            return;
        }

        if let Some(id) = &message.message_id {
            let key = MessageKey {
                remote_jid: message.sender_id.clone(),
                id: id.clone(),
            };
            if let Err(e) = self.client.read_receipts(&[key]).await {
                warn!(session_id, error = %e, "failed to send read receipt");
            }
        }

        info!(
            session_id,
            message_id = ?message.message_id,
            sender = %message.sender_id,
            timestamp = message.timestamp,
            "message received"
        );
        self.session.touch_conversation(&message.sender_id);

        let Some(engine) = self.shared.engine().await else {
            warn!(session_id, "no conversation engine attached, message dropped");
            return;
        };
        stats::message_forwarded();
        if let Err(e) = engine.handle_inbound(message).await {
            error!(session_id, error = %e, "conversation engine failed");
        }
    }
}
