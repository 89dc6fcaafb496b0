//! Session lifecycle core for the WhatsApp channel.
//!
//! A [`SessionRegistry`] owns every live [`ConnectionSession`]. Each session
//! runs one worker that opens a connection through a [`NetworkConnector`],
//! consumes its event stream strictly in order, persists rotated credentials
//! through a [`CredentialStore`] before acknowledging them, forwards inbound
//! text to the [`ConversationEngine`](herald_channels::ConversationEngine),
//! and reconnects under a bounded [`ReconnectPolicy`].
//!
//! The network itself sits behind [`NetworkClient`]; [`BridgeConnector`]
//! adapts it to an external bridge process over WebSocket.

pub mod bridge;
pub mod client;
mod dispatcher;
pub mod error;
pub mod pairing;
pub mod policy;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;
pub mod store;
pub mod sweep;
#[cfg(test)]
mod testing;
mod worker;

pub use {
    bridge::BridgeConnector,
    client::{
        AuthState, Connection, ConnectionUpdate, Credentials, MessageKey, NetworkClient,
        NetworkConnector, NetworkEvent, RawMessage, UpsertKind,
    },
    error::{Error, PairingError, Result},
    pairing::{PairingOutcome, render_data_url, render_terminal},
    policy::{ReconnectDecision, ReconnectPolicy, RetryLedger},
    registry::{DeleteOutcome, RestoreReport, SessionRegistry, validate_session_id},
    session::{ConnectionSession, SessionSummary},
    state::{ConnectionState, DisconnectReason},
    store::{
        CREDS_RECORD, CredentialStore, MemoryCredentialStore, RecordChange, SessionKeys,
        SledCredentialStore, StoreError,
    },
    sweep::{spawn_idle_sweep, sweep_once},
};
