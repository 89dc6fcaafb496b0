//! Connection state machine and the disconnect taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection state of one session.
///
/// ```text
/// CONNECTING    -> CONNECTED | DISCONNECTING | DISCONNECTED
/// CONNECTED     -> AUTHENTICATED | DISCONNECTING | DISCONNECTED
/// AUTHENTICATED -> DISCONNECTING | DISCONNECTED
/// DISCONNECTING -> DISCONNECTED
/// DISCONNECTED  -> CONNECTING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Authenticated,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected | Disconnecting | Disconnected)
                | (Connected, Authenticated | Disconnecting | Disconnected)
                | (Authenticated, Disconnecting | Disconnected)
                | (Disconnecting, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the network closed a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The credential set was invalidated; re-pairing is required.
    LoggedOut,
    /// The network asked for an immediate reconnect (e.g. right after pairing).
    RestartRequired,
    ConnectionClosed,
    ConnectionLost,
    /// Another client took over the same credentials.
    ConnectionReplaced,
    TimedOut,
    BadSession,
    Other(String),
}

impl DisconnectReason {
    /// Terminal regardless of the retry budget; credentials are purged.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Reconnect without the configured delay.
    pub fn skips_backoff(&self) -> bool {
        matches!(self, Self::RestartRequired)
    }

    /// Parse the loose labels used on the wire.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "logged_out" | "loggedout" => Self::LoggedOut,
            "restart_required" | "restartrequired" => Self::RestartRequired,
            "connection_closed" => Self::ConnectionClosed,
            "connection_lost" => Self::ConnectionLost,
            "connection_replaced" => Self::ConnectionReplaced,
            "timed_out" | "timeout" => Self::TimedOut,
            "bad_session" => Self::BadSession,
            _ => Self::Other(label.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::TimedOut => f.write_str("timed out"),
            Self::BadSession => f.write_str("bad session"),
            Self::Other(other) => write!(f, "other: {other}"),
        }
    }
}
