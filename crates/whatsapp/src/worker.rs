//! Per-session supervisor: connect, dispatch, and decide what follows a disconnect.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    client::{AuthState, Connection, Credentials},
    dispatcher::{ConnectionEnd, Dispatcher},
    policy::ReconnectDecision,
    registry::{SessionRegistry, Termination},
    session::ConnectionSession,
    state::{ConnectionState, DisconnectReason},
    stats,
    store::{CREDS_RECORD, SessionKeys},
};

/// Drive one session until it is cancelled or becomes terminal.
pub(crate) async fn run(registry: SessionRegistry, session: Arc<ConnectionSession>) {
    let session_id = session.id().to_string();
    let mut first = true;

    loop {
        // A reconnect timer may fire after the session was deleted or replaced.
        if session.is_cancelled() || !registry.is_current(&session).await {
            debug!(%session_id, generation = session.generation(), "session no longer registered, worker exiting");
            return;
        }
        if !first && let Err(current) = session.transition(ConnectionState::Connecting) {
            warn!(%session_id, %current, "reconnect from unexpected state");
            session.force_state(ConnectionState::Connecting);
        }
        first = false;

        // Teardown must not wait out a hung connect.
        let opened = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            opened = open(&registry, &session) => opened,
        };
        let end = match opened {
            Ok(connection) => {
                session.set_client(Arc::clone(&connection.client));
                Dispatcher::new(&session, registry.shared(), connection.client)
                    .run(connection.events)
                    .await
            },
            Err(reason) => {
                session.force_state(ConnectionState::Disconnected);
                session.set_last_disconnect(reason.clone());
                ConnectionEnd::Disconnected(reason)
            },
        };

        let reason = match end {
            ConnectionEnd::Cancelled => return,
            ConnectionEnd::PairingExpired => {
                registry
                    .terminate(&session, Termination::PairingExpired)
                    .await;
                return;
            },
            ConnectionEnd::Disconnected(reason) => reason,
        };

        // The transport is gone; drop the handle before deciding what is next.
        if let Some(client) = session.take_client() {
            client.close().await;
        }

        let shared = registry.shared();
        match shared
            .ledger
            .on_disconnect(&session_id, &shared.policy, &reason)
        {
            ReconnectDecision::LoggedOut => {
                warn!(%session_id, "credentials invalidated by the network");
                stats::logged_out();
                registry.terminate(&session, Termination::LoggedOut).await;
                return;
            },
            ReconnectDecision::GiveUp { attempts } => {
                warn!(%session_id, attempts, %reason, "reconnect budget exhausted, giving up");
                stats::retries_exhausted();
                registry
                    .terminate(&session, Termination::RetriesExhausted(reason))
                    .await;
                return;
            },
            ReconnectDecision::Retry { attempt, delay } => {
                stats::reconnect_attempt();
                if reason.skips_backoff() {
                    debug!(%session_id, attempt, "restart required, reconnecting now");
                } else {
                    info!(
                        %session_id,
                        attempt,
                        max = shared.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "reconnecting"
                    );
                }
                if !delay.is_zero() {
                    tokio::select! {
                        _ = session.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {},
                    }
                }
            },
        }
    }
}

/// Load credentials and open one connection, bounded by the connect timeout.
async fn open(
    registry: &SessionRegistry,
    session: &ConnectionSession,
) -> Result<Connection, DisconnectReason> {
    let shared = registry.shared();
    let session_id = session.id();

    let creds = match shared.store.read(session_id, CREDS_RECORD).await {
        Ok(Some(bytes)) => Credentials::Provisioned(bytes),
        Ok(None) => {
            debug!(session_id, "no stored credentials, starting fresh");
            Credentials::Fresh
        },
        Err(e) => {
            error!(session_id, error = %e, "failed to read credentials");
            return Err(DisconnectReason::Other(format!("credential read failed: {e}")));
        },
    };
    let auth = AuthState {
        creds,
        keys: SessionKeys::new(session_id, Arc::clone(&shared.store)),
    };

    let timeout = shared.config.connect_timeout();
    match tokio::time::timeout(timeout, shared.connector.connect(session_id, auth)).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => {
            warn!(session_id, error = %e, "connect failed");
            Err(DisconnectReason::Other(format!("connect failed: {e}")))
        },
        Err(_) => {
            warn!(session_id, timeout_secs = timeout.as_secs(), "connect timed out");
            Err(DisconnectReason::TimedOut)
        },
    }
}
