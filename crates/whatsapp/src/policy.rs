//! Bounded reconnection: the decision function and its per-session ledger.

use std::time::Duration;

use dashmap::DashMap;

use herald_config::WhatsAppConfig;

use crate::state::DisconnectReason;

/// What to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Retry budget exhausted. Credentials are kept.
    GiveUp { attempts: u32 },
    /// Credentials were invalidated. Terminal, credentials are purged.
    LoggedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&WhatsAppConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self {
            max_retries: config.max_reconnect_retries,
            interval: config.reconnect_interval(),
        }
    }

    /// Decide given the attempts already spent on this credential lifetime.
    pub fn next(&self, retry_count: u32, reason: &DisconnectReason) -> ReconnectDecision {
        if reason.is_logged_out() {
            return ReconnectDecision::LoggedOut;
        }
        if retry_count >= self.max_retries {
            return ReconnectDecision::GiveUp {
                attempts: retry_count,
            };
        }
        let delay = if reason.skips_backoff() {
            Duration::ZERO
        } else {
            self.interval
        };
        ReconnectDecision::Retry {
            attempt: retry_count + 1,
            delay,
        }
    }
}

/// Ephemeral attempt counters, keyed by session id. Never persisted.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: DashMap<String, u32>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> u32 {
        self.attempts.get(session_id).map_or(0, |n| *n)
    }

    /// Consult `policy` for a disconnect and record the attempt it grants.
    pub fn on_disconnect(
        &self,
        session_id: &str,
        policy: &ReconnectPolicy,
        reason: &DisconnectReason,
    ) -> ReconnectDecision {
        let mut count = self.attempts.entry(session_id.to_string()).or_insert(0);
        let decision = policy.next(*count, reason);
        if let ReconnectDecision::Retry { attempt, .. } = decision {
            *count = attempt;
        }
        decision
    }

    pub fn reset(&self, session_id: &str) {
        if let Some(mut count) = self.attempts.get_mut(session_id) {
            *count = 0;
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.attempts.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: 5,
            interval: Duration::from_millis(250),
        }
    }

    #[test]
    fn retries_until_budget_spent() {
        let ledger = RetryLedger::new();
        let lost = DisconnectReason::ConnectionLost;
        for expected in 1..=4 {
            assert_eq!(
                ledger.on_disconnect("s1", &policy(), &lost),
                ReconnectDecision::Retry {
                    attempt: expected,
                    delay: Duration::from_millis(250),
                }
            );
        }
        assert_eq!(ledger.get("s1"), 4);

        // At 4 of 5 one more attempt is granted.
        assert!(matches!(
            ledger.on_disconnect("s1", &policy(), &lost),
            ReconnectDecision::Retry { attempt: 5, .. }
        ));
        assert_eq!(ledger.get("s1"), 5);

        // At 5 of 5 the session gives up.
        assert_eq!(
            ledger.on_disconnect("s1", &policy(), &lost),
            ReconnectDecision::GiveUp { attempts: 5 }
        );
        assert_eq!(ledger.get("s1"), 5);
    }

    #[test]
    fn restart_required_skips_delay_but_counts() {
        let ledger = RetryLedger::new();
        assert_eq!(
            ledger.on_disconnect("s1", &policy(), &DisconnectReason::RestartRequired),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::ZERO,
            }
        );
        assert_eq!(ledger.get("s1"), 1);
    }

    #[test]
    fn logged_out_is_terminal_at_any_count() {
        let ledger = RetryLedger::new();
        assert_eq!(
            ledger.on_disconnect("s1", &policy(), &DisconnectReason::LoggedOut),
            ReconnectDecision::LoggedOut
        );
        assert_eq!(ledger.get("s1"), 0);
    }

    #[test]
    fn reset_and_remove_are_per_session() {
        let ledger = RetryLedger::new();
        let lost = DisconnectReason::TimedOut;
        ledger.on_disconnect("s1", &policy(), &lost);
        ledger.on_disconnect("s1", &policy(), &lost);
        ledger.on_disconnect("s2", &policy(), &lost);

        ledger.reset("s1");
        assert_eq!(ledger.get("s1"), 0);
        assert_eq!(ledger.get("s2"), 1);

        ledger.remove("s2");
        assert_eq!(ledger.get("s2"), 0);
    }

    #[test]
    fn zero_budget_gives_up_immediately() {
        let policy = ReconnectPolicy {
            max_retries: 0,
            interval: Duration::ZERO,
        };
        assert_eq!(
            policy.next(0, &DisconnectReason::ConnectionClosed),
            ReconnectDecision::GiveUp { attempts: 0 }
        );
    }
}
