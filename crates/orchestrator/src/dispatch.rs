//! Serialised event dispatch.
//!
//! Parallel task workers never invoke the caller's callback directly: all
//! events funnel through one channel and a single forwarding task, so
//! interleaved writers cannot corrupt the stream.

use std::time::Duration;

use tokio::sync::mpsc;

use av_domain::event::AgentEvent;
use av_domain::EventCallback;

pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<AgentEvent>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl EventDispatcher {
    /// Spawn the forwarding task. Must be called within a tokio runtime.
    pub fn new(callback: EventCallback) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        });
        Self { tx, forwarder }
    }

    /// A callback handle for workers. Cheap to clone into tasks.
    pub fn sink(&self) -> EventCallback {
        let tx = self.tx.clone();
        std::sync::Arc::new(move |event| {
            let _ = tx.send(event);
        })
    }

    /// Drain remaining events and stop the forwarder, bounded by
    /// `drain_timeout`.
    pub async fn close(self, drain_timeout: Duration) {
        drop(self.tx);
        if tokio::time::timeout(drain_timeout, self.forwarder).await.is_err() {
            tracing::warn!("event dispatcher drain timed out; consumer too slow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_store = seen.clone();
        let dispatcher = EventDispatcher::new(Arc::new(move |event: AgentEvent| {
            sink_store.lock().push(event.data);
        }));

        let sink = dispatcher.sink();
        for i in 0..100 {
            sink(AgentEvent::new("progress", i.to_string()));
        }
        dispatcher.close(Duration::from_secs(1)).await;

        let seen = seen.lock();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave_within_an_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_store = seen.clone();
        let dispatcher = EventDispatcher::new(Arc::new(move |event: AgentEvent| {
            sink_store.lock().push(event);
        }));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let sink = dispatcher.sink();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    sink(AgentEvent::json(
                        "progress",
                        &serde_json::json!({ "worker": worker, "i": i }),
                    ));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        dispatcher.close(Duration::from_secs(1)).await;

        // Every event is intact JSON; per-worker order is preserved.
        let events = seen.lock();
        assert_eq!(events.len(), 8 * 50);
        let mut last_per_worker = vec![-1i64; 8];
        for event in events.iter() {
            let value: serde_json::Value = serde_json::from_str(&event.data).unwrap();
            let worker = value["worker"].as_u64().unwrap() as usize;
            let i = value["i"].as_i64().unwrap();
            assert!(i > last_per_worker[worker]);
            last_per_worker[worker] = i;
        }
    }
}
