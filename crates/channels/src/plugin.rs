use {
    anyhow::Result,
    async_trait::async_trait,
    herald_common::{DeliveryReceipt, InboundMessage},
};

/// Consumes normalized inbound messages and produces replies.
///
/// Calls for one session arrive in order, one at a time. Replies go back out
/// through a [`ChannelOutbound`] the engine holds on its own.
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    async fn handle_inbound(&self, message: InboundMessage) -> Result<()>;

    /// A conversation saw no traffic for longer than the idle threshold and
    /// its tracking entry was dropped.
    async fn conversation_idle(&self, _session_id: &str, _sender_id: &str) {}
}

/// Send messages through a live session.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, session_id: &str, to: &str, text: &str) -> Result<DeliveryReceipt>;
}

/// Report session health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn health(&self, session_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Session health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub session_id: String,
    pub details: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, std::sync::Mutex};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InboundMessage>>,
    }

    #[async_trait]
    impl ConversationEngine for Recorder {
        async fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn idle_notification_defaults_to_noop() {
        let engine = Recorder::default();
        engine.conversation_idle("s1", "u1").await;
        engine
            .handle_inbound(InboundMessage {
                session_id: "s1".into(),
                sender_id: "u1".into(),
                text: "hi".into(),
                timestamp: 0,
                message_id: None,
            })
            .await
            .unwrap();
        assert_eq!(engine.seen.lock().unwrap().len(), 1);
    }
}
