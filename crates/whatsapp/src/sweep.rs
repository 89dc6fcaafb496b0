//! Periodic eviction of idle conversation state, independent of session lifecycle.

use std::time::Duration;

use {
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tracing::{debug, info},
};

use crate::registry::SessionRegistry;

/// Spawn the idle sweep. It stops when the registry shuts down.
pub fn spawn_idle_sweep(
    registry: SessionRegistry,
    every: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = registry.shutdown_token().cancelled() => {
                    debug!("idle sweep stopped");
                    return;
                },
                _ = interval.tick() => {},
            }
            sweep_once(&registry, idle_timeout).await;
        }
    })
}

/// Evict idle conversations once and notify the engine. Returns how many were evicted.
pub async fn sweep_once(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
    let evicted = registry.sweep_idle(idle_timeout).await;
    if evicted.is_empty() {
        return 0;
    }
    info!(count = evicted.len(), "evicted idle conversations");
    if let Some(engine) = registry.shared().engine().await {
        for (session_id, sender_id) in &evicted {
            engine.conversation_idle(session_id, sender_id).await;
        }
    }
    evicted.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, crate::testing::Harness};

    #[tokio::test]
    async fn idle_conversations_are_evicted_and_reported() {
        let mut h = Harness::new().await;
        let link = h.authenticated("s1").await;
        link.text("m1", "u1", "hi").await;
        let engine = &h.engine;
        h.wait_until(|| async move { engine.inbound().len() == 1 })
            .await;

        assert_eq!(sweep_once(&h.registry, Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sweep_once(&h.registry, Duration::from_millis(10)).await, 1);
        assert_eq!(h.engine.idle(), vec![("s1".to_string(), "u1".to_string())]);
        assert_eq!(h.registry.get("s1").await.unwrap().conversation_count(), 0);
    }

    #[tokio::test]
    async fn sweep_task_stops_on_shutdown() {
        let h = Harness::new().await;
        let handle = spawn_idle_sweep(
            h.registry.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        h.registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
