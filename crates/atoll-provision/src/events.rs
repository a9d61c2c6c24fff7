use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use atoll_common::{now_ms, DeploymentEvent, EventLevel};
use atoll_meta::{keys, MetaStore};

/// Per-subscriber broadcast buffer. A subscriber that falls more than
/// this many events behind is disconnected instead of blocking the
/// publisher.
const SUBSCRIBER_BUFFER: usize = 256;

struct StreamEntry {
    backlog: Mutex<Vec<DeploymentEvent>>,
    tx: broadcast::Sender<DeploymentEvent>,
}

/// What a subscriber gets: everything published so far, in order from
/// seq 1, plus a live receiver for what comes next. `live` is `None`
/// when the deployment already reached a terminal state.
pub struct Subscription {
    pub backlog: Vec<DeploymentEvent>,
    pub live: Option<broadcast::Receiver<DeploymentEvent>>,
}

/// Fan-out log channel per in-flight deployment.
///
/// Events are persisted as they are published, so history survives the
/// stream itself; the in-memory backlog exists to hand late subscribers
/// the full ordered sequence without a store round trip per event.
pub struct EventHub {
    store: Arc<dyn MetaStore>,
    streams: DashMap<String, Arc<StreamEntry>>,
}

impl EventHub {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            streams: DashMap::new(),
        }
    }

    fn entry(&self, deployment_id: &str) -> Arc<StreamEntry> {
        self.streams
            .entry(deployment_id.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(SUBSCRIBER_BUFFER);
                Arc::new(StreamEntry {
                    backlog: Mutex::new(Vec::new()),
                    tx,
                })
            })
            .clone()
    }

    /// Publish one event. Sequence numbers are assigned here and are
    /// gap-free per deployment, starting at 1.
    pub async fn publish(
        &self,
        deployment_id: &str,
        level: EventLevel,
        message: impl Into<String>,
    ) -> DeploymentEvent {
        let entry = self.entry(deployment_id);
        let mut backlog = entry.backlog.lock().await;
        let event = DeploymentEvent {
            deployment_id: deployment_id.to_string(),
            seq: backlog.len() as u64 + 1,
            timestamp_ms: now_ms(),
            level,
            message: message.into(),
        };
        backlog.push(event.clone());

        // The lock is held across the persist so a concurrent publisher
        // cannot reorder sequence numbers on disk.
        if let Ok(bytes) = serde_json::to_vec(&event) {
            if let Err(e) = self
                .store
                .put(&keys::event(deployment_id, event.seq), bytes)
                .await
            {
                tracing::warn!(%deployment_id, seq = event.seq, error = %e, "failed to persist deployment event");
            }
        }
        drop(backlog);

        // No receivers is fine; the backlog still has it.
        let _ = entry.tx.send(event.clone());
        event
    }

    /// Subscribe to a deployment's log stream. Replays the full backlog
    /// first; for already-closed streams the backlog is read back from
    /// the store.
    pub async fn subscribe(&self, deployment_id: &str) -> anyhow::Result<Subscription> {
        if let Some(entry) = self.streams.get(deployment_id).map(|e| e.clone()) {
            // Subscribe while still holding the backlog lock: an event
            // published in between would land in neither the snapshot
            // nor the receiver. The overlap this allows instead
            // (an event in both) is deduplicated by seq downstream.
            let guard = entry.backlog.lock().await;
            let rx = entry.tx.subscribe();
            let backlog = guard.clone();
            drop(guard);
            return Ok(Subscription {
                backlog,
                live: Some(rx),
            });
        }

        Ok(Subscription {
            backlog: self.history(deployment_id).await?,
            live: None,
        })
    }

    /// Persisted event history, in seq order.
    pub async fn history(&self, deployment_id: &str) -> anyhow::Result<Vec<DeploymentEvent>> {
        let mut out = Vec::new();
        for (_, value, _) in self
            .store
            .list_prefix(&keys::events_prefix(deployment_id))
            .await?
        {
            if let Ok(ev) = serde_json::from_slice::<DeploymentEvent>(&value) {
                out.push(ev);
            }
        }
        Ok(out)
    }

    /// Close the stream once its deployment is terminal. Live receivers
    /// drain whatever is still buffered, then see the channel end.
    pub fn close(&self, deployment_id: &str) {
        self.streams.remove(deployment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_meta::MemoryMetaStore;
    use tokio::sync::broadcast::error::RecvError;

    fn hub() -> EventHub {
        EventHub::new(Arc::new(MemoryMetaStore::new()))
    }

    #[tokio::test]
    async fn seq_is_gap_free_from_one() {
        let hub = hub();
        for i in 0..5 {
            hub.publish("d1", EventLevel::Info, format!("step {i}")).await;
        }
        let sub = hub.subscribe("d1").await.unwrap();
        let seqs: Vec<u64> = sub.backlog.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn late_subscriber_sees_backlog_then_live() {
        let hub = hub();
        hub.publish("d1", EventLevel::Info, "early").await;

        let mut sub = hub.subscribe("d1").await.unwrap();
        assert_eq!(sub.backlog.len(), 1);

        hub.publish("d1", EventLevel::Info, "late").await;
        let live = sub.live.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(live.seq, 2);
        assert_eq!(live.message, "late");
    }

    #[tokio::test]
    async fn history_survives_close() {
        let hub = hub();
        hub.publish("d1", EventLevel::Info, "one").await;
        hub.publish("d1", EventLevel::Error, "two").await;
        hub.close("d1");

        let sub = hub.subscribe("d1").await.unwrap();
        assert!(sub.live.is_none());
        assert_eq!(sub.backlog.len(), 2);
        assert_eq!(sub.backlog[1].level, EventLevel::Error);
    }

    #[tokio::test]
    async fn close_ends_live_receivers_after_drain() {
        let hub = hub();
        hub.publish("d1", EventLevel::Info, "one").await;
        let mut sub = hub.subscribe("d1").await.unwrap();
        hub.publish("d1", EventLevel::Info, "two").await;
        hub.close("d1");

        let mut rx = sub.live.take().unwrap();
        assert_eq!(rx.recv().await.unwrap().seq, 2);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscriber_joining_mid_stream_sees_every_seq() {
        let hub = Arc::new(hub());
        hub.publish("d1", EventLevel::Info, "open").await;

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    hub.publish("d1", EventLevel::Info, format!("e{i}")).await;
                }
            })
        };

        // Subscribe while the publisher is running; backlog snapshot and
        // receiver together must cover every seq with no gap.
        let mut sub = hub.subscribe("d1").await.unwrap();
        let mut last_seq = sub.backlog.last().map(|e| e.seq).unwrap_or(0);
        for (i, ev) in sub.backlog.iter().enumerate() {
            assert_eq!(ev.seq, i as u64 + 1);
        }

        publisher.await.unwrap();
        hub.close("d1");

        let mut rx = sub.live.take().unwrap();
        loop {
            match rx.recv().await {
                Ok(ev) if ev.seq <= last_seq => {}
                Ok(ev) => {
                    assert_eq!(ev.seq, last_seq + 1, "gap in live stream");
                    last_seq = ev.seq;
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => panic!("receiver lagged by {n}"),
            }
        }
        assert_eq!(last_seq, 101);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let hub = hub();
        hub.publish("d1", EventLevel::Info, "open").await;
        let mut sub = hub.subscribe("d1").await.unwrap();
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            hub.publish("d1", EventLevel::Info, format!("e{i}")).await;
        }
        let mut rx = sub.live.take().unwrap();
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
    }
}
