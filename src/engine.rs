// 🔄 Sync Engine - owns the watcher and the broadcaster
//
// One instance per process, created by the host and injected where needed.
// start() registers the configured resources, starts the signal source and
// forwards every confirmed ResourceChange to all subscribers as a
// `data-changed` event; stop() tears all of it down again.

use crate::broadcaster::{Broadcaster, ResourceSnapshot, SnapshotSource};
use crate::config::{SyncConfig, WatchStrategy};
use crate::events::ChangeEvent;
use crate::resources;
use crate::store::DataStore;
use crate::watcher::{ChangeReceiver, ChangeWatcher, WatchSource};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// ============================================================================
// CATCH-UP SNAPSHOTS FROM STORAGE
// ============================================================================

/// Reads the current materialized view of every configured resource
pub struct StoreSnapshots {
    store: Arc<dyn DataStore>,
    resources: Vec<String>,
}

impl StoreSnapshots {
    pub fn new(store: Arc<dyn DataStore>, resources: Vec<String>) -> Self {
        StoreSnapshots { store, resources }
    }
}

impl SnapshotSource for StoreSnapshots {
    fn snapshots(&self) -> Vec<ResourceSnapshot> {
        self.resources
            .iter()
            .filter(|name| self.store.exists(name))
            .filter_map(|name| match self.store.read(name) {
                Ok(raw) => Some(ResourceSnapshot {
                    name: name.clone(),
                    data: resources::materialize(name, raw),
                    file: Some(self.store.location(name)),
                }),
                Err(e) => {
                    error!(resource = %name, error = %e, "Failed to read resource for catch-up");
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub clients: usize,
    pub watchers: usize,
    /// Names of the resources currently watched
    pub resources: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub strategy: Option<WatchStrategy>,
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

struct Running {
    source: WatchSource,
    stop_tx: oneshot::Sender<()>,
    forwarder: JoinHandle<ChangeReceiver>,
}

pub struct SyncEngine {
    resources: Vec<String>,
    strategy: WatchStrategy,
    poll_interval: Duration,
    watcher: ChangeWatcher,
    broadcaster: Broadcaster,
    changes: Mutex<Option<ChangeReceiver>>,
    running: Mutex<Option<Running>>,
    last_sync: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, store: Arc<dyn DataStore>) -> Self {
        let (changes_tx, changes_rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = ChangeWatcher::new(Arc::clone(&store), config.settle_delay(), changes_tx);
        let snapshots = StoreSnapshots::new(store, config.resources.clone());
        let broadcaster = Broadcaster::new(config.heartbeat_interval(), Arc::new(snapshots));

        SyncEngine {
            resources: config.resources.clone(),
            strategy: config.watch_strategy,
            poll_interval: config.poll_interval(),
            watcher,
            broadcaster,
            changes: Mutex::new(Some(changes_rx)),
            running: Mutex::new(None),
            last_sync: Arc::new(Mutex::new(None)),
        }
    }

    /// Register resources, start the signal source and the change forwarder.
    /// Starting a running engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let Some(mut changes) = self.changes.lock().await.take() else {
            anyhow::bail!("Sync engine change channel unavailable");
        };

        for name in &self.resources {
            self.watcher.register_resource(name).await;
        }

        let source = match self.watcher.start(self.strategy, self.poll_interval).await {
            Ok(source) => source,
            Err(e) => {
                *self.changes.lock().await = Some(changes);
                self.watcher.clear().await;
                return Err(e);
            }
        };

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let broadcaster = self.broadcaster.clone();
        let last_sync = Arc::clone(&self.last_sync);
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    change = changes.recv() => {
                        let Some(change) = change else { break };
                        let event = ChangeEvent::data_changed(&change.name, change.data, Some(&change.file));
                        let delivered = broadcaster.broadcast(&event).await;
                        *last_sync.lock().await = Some(event.timestamp);
                        info!(resource = %change.name, delivered, "Change synchronised to clients");
                    }
                }
            }
            changes
        });

        info!(
            watchers = self.watcher.watcher_count().await,
            strategy = ?self.strategy,
            "Sync engine started"
        );
        *running = Some(Running {
            source,
            stop_tx,
            forwarder,
        });
        Ok(())
    }

    /// Stop watching, drop all subscribers. The engine can be started again.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.source.stop();
        let _ = running.stop_tx.send(());
        match running.forwarder.await {
            Ok(changes) => *self.changes.lock().await = Some(changes),
            Err(e) => warn!(error = %e, "Change forwarder ended abnormally"),
        }

        self.watcher.clear().await;
        self.broadcaster.shutdown().await;
        info!("Sync engine stopped");
    }

    /// Mutation signal from a route handler that just wrote `resource`
    pub async fn notify_change(&self, resource: &str) {
        self.watcher.signal(resource).await;
    }

    pub async fn force_sync(&self) -> usize {
        self.broadcaster.force_broadcast().await
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn watcher(&self) -> &ChangeWatcher {
        &self.watcher
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> SyncStatus {
        let strategy = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.source.strategy());

        let resources = self.watcher.watched().await;
        SyncStatus {
            clients: self.broadcaster.subscriber_count().await,
            watchers: resources.len(),
            resources,
            last_sync: *self.last_sync.lock().await,
            is_running: strategy.is_some(),
            strategy,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
