//! Session lifecycle metrics. Recording is a no-op unless the `metrics`
//! feature is enabled and a recorder is installed.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

pub const SESSIONS_ACTIVE: &str = "whatsapp_sessions_active";
pub const SESSIONS_CREATED_TOTAL: &str = "whatsapp_sessions_created_total";
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "whatsapp_reconnect_attempts_total";
pub const RETRIES_EXHAUSTED_TOTAL: &str = "whatsapp_retries_exhausted_total";
pub const LOGGED_OUT_TOTAL: &str = "whatsapp_logged_out_total";
pub const CREDENTIAL_WRITE_FAILURES_TOTAL: &str = "whatsapp_credential_write_failures_total";
pub const SESSIONS_DEGRADED_TOTAL: &str = "whatsapp_sessions_degraded_total";
pub const MESSAGES_FORWARDED_TOTAL: &str = "whatsapp_messages_forwarded_total";

pub(crate) fn live_sessions(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub(crate) fn session_created() {
    #[cfg(feature = "metrics")]
    counter!(SESSIONS_CREATED_TOTAL).increment(1);
}

pub(crate) fn reconnect_attempt() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

pub(crate) fn retries_exhausted() {
    #[cfg(feature = "metrics")]
    counter!(RETRIES_EXHAUSTED_TOTAL).increment(1);
}

pub(crate) fn logged_out() {
    #[cfg(feature = "metrics")]
    counter!(LOGGED_OUT_TOTAL).increment(1);
}

pub(crate) fn credential_write_failed() {
    #[cfg(feature = "metrics")]
    counter!(CREDENTIAL_WRITE_FAILURES_TOTAL).increment(1);
}

pub(crate) fn session_degraded() {
    #[cfg(feature = "metrics")]
    counter!(SESSIONS_DEGRADED_TOTAL).increment(1);
}

pub(crate) fn message_forwarded() {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_FORWARDED_TOTAL).increment(1);
}
