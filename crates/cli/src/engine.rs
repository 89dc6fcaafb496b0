use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, tracing::{debug, info}};

use {
    herald_channels::{ChannelOutbound, ConversationEngine},
    herald_common::InboundMessage,
};

/// Logs inbound traffic and optionally answers with a fixed reply.
pub struct LoggingEngine {
    outbound: Arc<dyn ChannelOutbound>,
    auto_reply: Option<String>,
}

impl LoggingEngine {
    pub fn new(outbound: Arc<dyn ChannelOutbound>, auto_reply: &str) -> Self {
        let auto_reply = auto_reply.trim();
        Self {
            outbound,
            auto_reply: (!auto_reply.is_empty()).then(|| auto_reply.to_string()),
        }
    }
}

#[async_trait]
impl ConversationEngine for LoggingEngine {
    async fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
        info!(
            session_id = %message.session_id,
            sender = %message.sender_id,
            len = message.text.len(),
            "inbound message"
        );
        if let Some(reply) = &self.auto_reply {
            let receipt = self
                .outbound
                .send_text(&message.session_id, &message.sender_id, reply)
                .await?;
            debug!(message_id = %receipt.message_id, "auto reply sent");
        }
        Ok(())
    }

    async fn conversation_idle(&self, session_id: &str, sender_id: &str) {
        debug!(session_id, sender_id, "conversation went idle");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use {super::*, herald_common::DeliveryReceipt};

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ChannelOutbound for Outbox {
        async fn send_text(&self, session_id: &str, to: &str, text: &str) -> Result<DeliveryReceipt> {
            self.sent
                .lock()
                .unwrap()
                .push((session_id.into(), to.into(), text.into()));
            Ok(DeliveryReceipt::new("r1", to))
        }
    }

    fn message() -> InboundMessage {
        InboundMessage {
            session_id: "s1".into(),
            sender_id: "u1".into(),
            text: "hi".into(),
            timestamp: 0,
            message_id: None,
        }
    }

    #[tokio::test]
    async fn replies_only_when_configured() {
        let outbox = Arc::new(Outbox::default());
        let quiet = LoggingEngine::new(Arc::clone(&outbox) as Arc<dyn ChannelOutbound>, "  ");
        quiet.handle_inbound(message()).await.unwrap();
        assert!(outbox.sent.lock().unwrap().is_empty());

        let chatty = LoggingEngine::new(Arc::clone(&outbox) as Arc<dyn ChannelOutbound>, "thanks!");
        chatty.handle_inbound(message()).await.unwrap();
        assert_eq!(outbox.sent.lock().unwrap().as_slice(), &[(
            "s1".to_string(),
            "u1".to_string(),
            "thanks!".to_string()
        )]);
    }
}
