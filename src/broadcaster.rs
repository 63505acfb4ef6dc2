// 📡 Broadcaster - subscriber registry and best-effort fan-out
//
// Every connected client is a Subscriber holding a delivery function. The
// registry is the only owner of subscribers; a subscriber whose delivery
// fails is dropped and its heartbeat task aborted, without affecting the
// others.
//
// Delivery happens under the registry lock, so a given subscriber sees
// events in the order broadcast() was called. Delivery functions must not
// block (they push into the connection's own queue).

use crate::events::ChangeEvent;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Sends one event to the remote end of a subscriber's channel
pub type DeliverFn = Arc<dyn Fn(&ChangeEvent) -> Result<()> + Send + Sync>;

/// One resource's current view, as replayed to a new subscriber
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub name: String,
    pub data: Value,
    pub file: Option<PathBuf>,
}

/// Supplies the catch-up snapshot sent to every new subscriber
pub trait SnapshotSource: Send + Sync {
    fn snapshots(&self) -> Vec<ResourceSnapshot>;
}

/// No catch-up at all (tests, headless use)
pub struct NoSnapshots;

impl SnapshotSource for NoSnapshots {
    fn snapshots(&self) -> Vec<ResourceSnapshot> {
        Vec::new()
    }
}

// ============================================================================
// SUBSCRIBER
// ============================================================================

struct Subscriber {
    deliver: DeliverFn,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Subscriber {
    fn cancel(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

/// Read-only view of a subscriber for status reporting
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

// ============================================================================
// BROADCASTER
// ============================================================================

struct Inner {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    snapshots: Arc<dyn SnapshotSource>,
    heartbeat_interval: Duration,
}

/// Cheap to clone; all clones share one registry
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(heartbeat_interval: Duration, snapshots: Arc<dyn SnapshotSource>) -> Self {
        Broadcaster {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                snapshots,
                heartbeat_interval,
            }),
        }
    }

    /// Register a subscriber, replay the catch-up snapshot to it alone and
    /// start its heartbeat. Returns false when the catch-up delivery failed
    /// (the subscriber is then already gone).
    pub async fn subscribe(&self, id: &str, deliver: DeliverFn) -> bool {
        let mut subscribers = self.inner.subscribers.lock().await;

        if let Some(mut previous) = subscribers.remove(id) {
            warn!(client_id = %id, "Subscriber id reused, replacing previous channel");
            previous.cancel();
        }

        for snapshot in self.inner.snapshots.snapshots() {
            let event =
                ChangeEvent::data_changed(&snapshot.name, snapshot.data, snapshot.file.as_deref());
            if let Err(e) = deliver(&event) {
                warn!(client_id = %id, resource = %snapshot.name, error = %e, "Catch-up delivery failed, dropping subscriber");
                return false;
            }
        }

        let now = Utc::now();
        let heartbeat = self.spawn_heartbeat(id.to_string(), Arc::clone(&deliver));
        subscribers.insert(
            id.to_string(),
            Subscriber {
                deliver,
                connected_at: now,
                last_heartbeat: now,
                heartbeat: Some(heartbeat),
            },
        );

        info!(client_id = %id, total = subscribers.len(), "Subscriber added");
        true
    }

    /// Remove a subscriber and cancel its heartbeat. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = {
            let mut subscribers = self.inner.subscribers.lock().await;
            subscribers.remove(id).map(|mut subscriber| {
                subscriber.cancel();
                subscribers.len()
            })
        };

        match removed {
            Some(remaining) => {
                info!(client_id = %id, remaining, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every subscriber. Subscribers whose delivery fails
    /// are removed; the rest still receive the event. Returns the number of
    /// successful deliveries.
    pub async fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut subscribers = self.inner.subscribers.lock().await;
        debug!(
            kind = %event.kind,
            resource = event.resource.as_deref().unwrap_or("-"),
            clients = subscribers.len(),
            "Broadcasting event"
        );

        let mut failed = Vec::new();
        let mut delivered = 0;

        for (id, subscriber) in subscribers.iter() {
            match (subscriber.deliver)(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client_id = %id, error = %e, "Delivery failed, dropping subscriber");
                    failed.push(id.clone());
                }
            }
        }

        for id in failed {
            if let Some(mut subscriber) = subscribers.remove(&id) {
                subscriber.cancel();
            }
        }

        delivered
    }

    /// Operator trigger: tell every client to resynchronise now
    pub async fn force_broadcast(&self) -> usize {
        info!("Forced synchronisation requested");
        self.broadcast(&ChangeEvent::force_sync()).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().await.len()
    }

    pub async fn subscribers(&self) -> Vec<SubscriberInfo> {
        let subscribers = self.inner.subscribers.lock().await;
        let mut infos: Vec<SubscriberInfo> = subscribers
            .iter()
            .map(|(id, subscriber)| SubscriberInfo {
                id: id.clone(),
                connected_at: subscriber.connected_at,
                last_heartbeat: subscriber.last_heartbeat,
            })
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    /// Drop every subscriber and cancel all heartbeats
    pub async fn shutdown(&self) {
        let mut subscribers = self.inner.subscribers.lock().await;
        for (_, mut subscriber) in subscribers.drain() {
            subscriber.cancel();
        }
        info!("Broadcaster shut down");
    }

    fn spawn_heartbeat(&self, id: String, deliver: DeliverFn) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut subscribers = inner.subscribers.lock().await;

                match deliver(&ChangeEvent::heartbeat()) {
                    Ok(()) => {
                        if let Some(subscriber) = subscribers.get_mut(&id) {
                            subscriber.last_heartbeat = Utc::now();
                        }
                    }
                    Err(e) => {
                        warn!(client_id = %id, error = %e, "Heartbeat failed, dropping subscriber");
                        // Removing without cancel(): this task is the heartbeat and ends here
                        subscribers.remove(&id);
                        return;
                    }
                }
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedSnapshots(Vec<ResourceSnapshot>);

    impl SnapshotSource for FixedSnapshots {
        fn snapshots(&self) -> Vec<ResourceSnapshot> {
            self.0.clone()
        }
    }

    fn recorder() -> (DeliverFn, Arc<StdMutex<Vec<ChangeEvent>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let deliver: DeliverFn = Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        (deliver, log)
    }

    fn failing() -> DeliverFn {
        Arc::new(|_: &ChangeEvent| Err(anyhow!("channel closed")))
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Duration::from_secs(30), Arc::new(NoSnapshots))
    }

    #[tokio::test]
    async fn test_catch_up_before_live_events() {
        let snapshots = FixedSnapshots(vec![
            ResourceSnapshot {
                name: "products".to_string(),
                data: json!([{"id": "1"}]),
                file: None,
            },
            ResourceSnapshot {
                name: "sales".to_string(),
                data: json!([]),
                file: None,
            },
        ]);
        let broadcaster = Broadcaster::new(Duration::from_secs(30), Arc::new(snapshots));
        let (deliver, log) = recorder();

        assert!(broadcaster.subscribe("a", deliver).await);
        broadcaster
            .broadcast(&ChangeEvent::data_changed("products", json!([]), None))
            .await;

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].resource.as_deref(), Some("products"));
        assert_eq!(events[0].payload["data"], json!([{"id": "1"}]));
        assert_eq!(events[1].resource.as_deref(), Some("sales"));
        assert!(events.iter().all(|e| e.kind == EventKind::DataChanged));
        assert_eq!(events[2].payload["data"], json!([]));
    }

    #[tokio::test]
    async fn test_catch_up_only_to_new_subscriber() {
        let snapshots = FixedSnapshots(vec![ResourceSnapshot {
            name: "products".to_string(),
            data: json!([]),
            file: None,
        }]);
        let broadcaster = Broadcaster::new(Duration::from_secs(30), Arc::new(snapshots));
        let (first, first_log) = recorder();
        let (second, _) = recorder();

        broadcaster.subscribe("first", first).await;
        broadcaster.subscribe("second", second).await;

        assert_eq!(first_log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_isolation() {
        let broadcaster = broadcaster();
        let mut logs = Vec::new();
        for id in ["a", "b", "c"] {
            let (deliver, log) = recorder();
            broadcaster.subscribe(id, deliver).await;
            logs.push(log);
        }
        broadcaster.subscribe("broken", failing()).await;
        assert_eq!(broadcaster.subscriber_count().await, 4);

        let delivered = broadcaster
            .broadcast(&ChangeEvent::data_changed("products", json!([]), None))
            .await;

        assert_eq!(delivered, 3);
        assert_eq!(broadcaster.subscriber_count().await, 3);
        assert!(broadcaster.subscribers().await.iter().all(|info| info.id != "broken"));
        for log in logs {
            assert_eq!(log.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_catch_up_drops_subscriber() {
        let snapshots = FixedSnapshots(vec![ResourceSnapshot {
            name: "products".to_string(),
            data: json!([]),
            file: None,
        }]);
        let broadcaster = Broadcaster::new(Duration::from_secs(30), Arc::new(snapshots));

        assert!(!broadcaster.subscribe("broken", failing()).await);
        assert_eq!(broadcaster.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broadcaster = broadcaster();
        let (deliver, _) = recorder();
        broadcaster.subscribe("a", deliver).await;

        assert!(broadcaster.unsubscribe("a").await);
        assert!(!broadcaster.unsubscribe("a").await);
        assert!(!broadcaster.unsubscribe("never-seen").await);
        assert_eq!(broadcaster.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_force_broadcast() {
        let broadcaster = broadcaster();
        let (deliver, log) = recorder();
        broadcaster.subscribe("a", deliver).await;

        assert_eq!(broadcaster.force_broadcast().await, 1);

        let events = log.lock().unwrap();
        assert_eq!(events[0].kind, EventKind::ForceSync);
        assert_eq!(events[0].payload["source"], "manual");
    }

    #[tokio::test]
    async fn test_per_subscriber_order() {
        let broadcaster = broadcaster();
        let (deliver, log) = recorder();
        broadcaster.subscribe("a", deliver).await;

        for n in 0..5 {
            broadcaster
                .broadcast(&ChangeEvent::data_changed("products", json!(n), None))
                .await;
        }

        let seen: Vec<Value> = log
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload["data"].clone())
            .collect();
        assert_eq!(seen, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_heartbeat_delivered() {
        let broadcaster = Broadcaster::new(Duration::from_millis(20), Arc::new(NoSnapshots));
        let (deliver, log) = recorder();
        broadcaster.subscribe("a", deliver).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let heartbeats = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::Heartbeat)
            .count();
        assert!(heartbeats >= 2);
        let infos = broadcaster.subscribers().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "a");
        assert!(infos[0].last_heartbeat > infos[0].connected_at);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_removes_subscriber() {
        let broadcaster = Broadcaster::new(Duration::from_millis(20), Arc::new(NoSnapshots));
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let deliver: DeliverFn = Arc::new(move |_: &ChangeEvent| {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow!("client went away"))
            }
        });
        broadcaster.subscribe("a", deliver).await;

        alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(broadcaster.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let broadcaster = broadcaster();
        for id in ["a", "b"] {
            let (deliver, _) = recorder();
            broadcaster.subscribe(id, deliver).await;
        }

        broadcaster.shutdown().await;

        assert_eq!(broadcaster.subscriber_count().await, 0);
        assert!(broadcaster.subscribers().await.is_empty());
    }
}
