// 👀 Change Watcher - debounced, content-diffing resource observation
//
// A mutation signal (OS file event, poll tick or explicit signal from a route
// handler) schedules one settle task per resource. After the settle delay the
// resource is re-read only if its modification time is strictly newer than
// the last one seen; the materialized view is hashed and compared with the
// last snapshot. Only a different digest produces a ResourceChange.
//
// Read/parse failures are logged and count as "no change".

use crate::config::WatchStrategy;
use crate::resources;
use crate::store::{DataStore, JsonFileStore};
use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// A confirmed content change of one resource
#[derive(Debug, Clone)]
pub struct ResourceChange {
    pub name: String,
    /// Materialized view (month-filtered for sales)
    pub data: Value,
    pub file: PathBuf,
}

pub type ChangeSender = mpsc::UnboundedSender<ResourceChange>;
pub type ChangeReceiver = mpsc::UnboundedReceiver<ResourceChange>;

/// SHA-256 of the serialized view; equal digests ⇔ equal serialized forms
pub fn snapshot_digest(view: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(view.to_string());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// WATCHED RESOURCE
// ============================================================================

struct WatchedResource {
    file: PathBuf,
    snapshot: Option<String>,
    last_modified: Option<SystemTime>,
    pending: Option<JoinHandle<()>>,
}

// ============================================================================
// CHANGE WATCHER
// ============================================================================

struct Inner {
    store: Arc<dyn DataStore>,
    resources: Mutex<HashMap<String, WatchedResource>>,
    settle_delay: Duration,
    changes: ChangeSender,
}

#[derive(Clone)]
pub struct ChangeWatcher {
    inner: Arc<Inner>,
}

impl ChangeWatcher {
    pub fn new(store: Arc<dyn DataStore>, settle_delay: Duration, changes: ChangeSender) -> Self {
        ChangeWatcher {
            inner: Arc::new(Inner {
                store,
                resources: Mutex::new(HashMap::new()),
                settle_delay,
                changes,
            }),
        }
    }

    /// Begin observing a resource. A resource missing from storage is logged
    /// and skipped; it is not retried until the next start.
    pub async fn register_resource(&self, name: &str) -> bool {
        let mut resources = self.inner.resources.lock().await;
        if resources.contains_key(name) {
            return true;
        }

        let store = &self.inner.store;
        let file = store.location(name);
        if !store.exists(name) {
            warn!(resource = %name, file = %file.display(), "Resource not found, not watching");
            return false;
        }

        // Seed the snapshot so a content-identical touch right after startup is not broadcast
        let last_modified = store.modified(name).ok();
        let snapshot = match store.read(name) {
            Ok(raw) => Some(snapshot_digest(&resources::materialize(name, raw))),
            Err(e) => {
                warn!(resource = %name, error = %e, "Could not read initial snapshot");
                None
            }
        };

        info!(resource = %name, file = %file.display(), "Watching resource");
        resources.insert(
            name.to_string(),
            WatchedResource {
                file,
                snapshot,
                last_modified,
                pending: None,
            },
        );
        true
    }

    /// Stop observing a resource and cancel its pending settle task
    pub async fn unregister_resource(&self, name: &str) -> bool {
        let mut resources = self.inner.resources.lock().await;
        match resources.remove(name) {
            Some(mut resource) => {
                if let Some(pending) = resource.pending.take() {
                    pending.abort();
                }
                info!(resource = %name, "Stopped watching resource");
                true
            }
            None => false,
        }
    }

    /// Storage-mutation signal for `name`. Signals arriving while a settle
    /// task is pending are folded into it.
    pub async fn signal(&self, name: &str) {
        let mut resources = self.inner.resources.lock().await;
        let Some(resource) = resources.get_mut(name) else {
            trace!(resource = %name, "Signal for unwatched resource ignored");
            return;
        };

        if resource
            .pending
            .as_ref()
            .map_or(false, |pending| !pending.is_finished())
        {
            trace!(resource = %name, "Settle already pending, coalescing signal");
            return;
        }

        let watcher = self.clone();
        let name = name.to_string();
        let delay = self.inner.settle_delay;
        resource.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            watcher.check(&name).await;
        }));
    }

    /// Re-read, diff and emit. Runs under the registry lock so one
    /// resource's check/update/emit sequence never interleaves with another
    /// check of the same resource.
    async fn check(&self, name: &str) {
        let mut resources = self.inner.resources.lock().await;
        let Some(resource) = resources.get_mut(name) else {
            return;
        };
        resource.pending = None;

        let store = &self.inner.store;
        let modified = match store.modified(name) {
            Ok(modified) => modified,
            Err(e) => {
                error!(resource = %name, error = %e, "Failed to stat resource");
                return;
            }
        };

        if let Some(last) = resource.last_modified {
            if modified <= last {
                trace!(resource = %name, "Modification time not newer, skipping");
                return;
            }
        }
        resource.last_modified = Some(modified);

        let raw = match store.read(name) {
            Ok(raw) => raw,
            Err(e) => {
                error!(resource = %name, error = %e, "Failed to read resource after change");
                return;
            }
        };

        let view = resources::materialize(name, raw);
        let digest = snapshot_digest(&view);
        if resource.snapshot.as_deref() == Some(digest.as_str()) {
            debug!(resource = %name, "No real content change, not synchronising");
            return;
        }
        resource.snapshot = Some(digest);

        info!(resource = %name, "Content change detected");
        let change = ResourceChange {
            name: name.to_string(),
            data: view,
            file: resource.file.clone(),
        };
        if self.inner.changes.send(change).is_err() {
            debug!(resource = %name, "Change receiver dropped");
        }
    }

    /// Signal every watched resource whose file is newer than last seen
    pub async fn poll_once(&self) {
        let stale: Vec<String> = {
            let resources = self.inner.resources.lock().await;
            resources
                .iter()
                .filter(|(name, resource)| {
                    let pending = resource
                        .pending
                        .as_ref()
                        .map_or(false, |pending| !pending.is_finished());
                    !pending
                        && match self.inner.store.modified(name) {
                            Ok(modified) => resource.last_modified.map_or(true, |last| modified > last),
                            Err(_) => false,
                        }
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in stale {
            self.signal(&name).await;
        }
    }

    pub async fn watched(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.resources.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn watcher_count(&self) -> usize {
        self.inner.resources.lock().await.len()
    }

    /// Digest of the last confirmed view of `name`
    #[cfg(test)]
    async fn snapshot_of(&self, name: &str) -> Option<String> {
        self.inner
            .resources
            .lock()
            .await
            .get(name)
            .and_then(|resource| resource.snapshot.clone())
    }

    /// Cancel every pending settle task and forget all resources
    pub async fn clear(&self) {
        let mut resources = self.inner.resources.lock().await;
        for (_, mut resource) in resources.drain() {
            if let Some(pending) = resource.pending.take() {
                pending.abort();
            }
        }
    }

    /// Start the configured signal source. Exactly one source drives a
    /// watcher; the returned handle must be kept alive and stopped on shutdown.
    pub async fn start(&self, strategy: WatchStrategy, poll_interval: Duration) -> Result<WatchSource> {
        match strategy {
            WatchStrategy::Events => self.start_events().await,
            WatchStrategy::Poll => Ok(self.start_polling(poll_interval)),
        }
    }

    async fn start_events(&self) -> Result<WatchSource> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut fs_watcher = RecommendedWatcher::new(
            move |result| {
                if events_tx.send(result).is_err() {
                    error!("File event channel closed");
                }
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;

        // Watch directories, not files: rewrites that replace the inode keep being seen
        let dirs: HashSet<PathBuf> = {
            let resources = self.inner.resources.lock().await;
            resources
                .values()
                .filter_map(|resource| resource.file.parent().map(|dir| dir.to_path_buf()))
                .collect()
        };
        for dir in &dirs {
            fs_watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch directory {:?}", dir))?;
            info!(dir = %dir.display(), "File change notifications enabled");
        }

        let watcher = self.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = events_rx.recv().await {
                match result {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            if let Some(name) = JsonFileStore::resource_name(path) {
                                watcher.signal(&name).await;
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "File watcher error"),
                }
            }
        });

        Ok(WatchSource::Events {
            _watcher: fs_watcher,
            task,
        })
    }

    fn start_polling(&self, interval: Duration) -> WatchSource {
        let watcher = self.clone();
        info!(interval_ms = interval.as_millis() as u64, "Polling for resource changes");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                watcher.poll_once().await;
            }
        });

        WatchSource::Poll { task }
    }
}

// ============================================================================
// WATCH SOURCE
// ============================================================================

/// Running signal source feeding a ChangeWatcher
pub enum WatchSource {
    Events {
        _watcher: RecommendedWatcher,
        task: JoinHandle<()>,
    },
    Poll {
        task: JoinHandle<()>,
    },
}

impl WatchSource {
    pub fn strategy(&self) -> WatchStrategy {
        match self {
            WatchSource::Events { .. } => WatchStrategy::Events,
            WatchSource::Poll { .. } => WatchStrategy::Poll,
        }
    }

    pub fn stop(self) {
        match self {
            WatchSource::Events { _watcher, task } => {
                task.abort();
                drop(_watcher);
            }
            WatchSource::Poll { task } => task.abort(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Local};
    use serde_json::json;
    use std::fs::File;
    use tempfile::TempDir;

    const SETTLE: Duration = Duration::from_millis(10);

    struct Fixture {
        _dir: TempDir,
        store: Arc<JsonFileStore>,
        watcher: ChangeWatcher,
        changes: ChangeReceiver,
        bump: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
            let (tx, changes) = mpsc::unbounded_channel();
            let watcher = ChangeWatcher::new(store.clone(), SETTLE, tx);
            Fixture {
                _dir: dir,
                store,
                watcher,
                changes,
                bump: 0,
            }
        }

        /// Write a resource and push its mtime strictly forward, whatever the
        /// filesystem's timestamp granularity
        fn write(&mut self, name: &str, value: Value) {
            self.store.write(name, &value).unwrap();
            self.bump += 10;
            let file = File::options().write(true).open(self.store.location(name)).unwrap();
            file.set_modified(SystemTime::now() + Duration::from_secs(self.bump))
                .unwrap();
        }

        async fn next_change(&mut self) -> Option<ResourceChange> {
            tokio::time::timeout(Duration::from_millis(300), self.changes.recv())
                .await
                .ok()
                .flatten()
        }
    }

    #[tokio::test]
    async fn test_missing_resource_is_skipped() {
        let fixture = Fixture::new();

        assert!(!fixture.watcher.register_resource("products").await);
        assert_eq!(fixture.watcher.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_change_detected() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([{"id": "1", "quantity": 5}]));
        assert!(fixture.watcher.register_resource("products").await);

        fixture.write("products", json!([{"id": "1", "quantity": 4}]));
        fixture.watcher.signal("products").await;

        let change = fixture.next_change().await.expect("change expected");
        assert_eq!(change.name, "products");
        assert_eq!(change.data[0]["quantity"], 4);
        assert_eq!(change.file, fixture.store.location("products"));
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_not_a_change() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([{"id": "1"}]));
        fixture.watcher.register_resource("products").await;

        fixture.write("products", json!([{"id": "1"}]));
        fixture.watcher.signal("products").await;
        assert!(fixture.next_change().await.is_none());

        fixture.write("products", json!([{"id": "2"}]));
        fixture.watcher.signal("products").await;
        assert!(fixture.next_change().await.is_some());

        fixture.write("products", json!([{"id": "2"}]));
        fixture.watcher.signal("products").await;
        assert!(fixture.next_change().await.is_none());
    }

    #[tokio::test]
    async fn test_burst_of_signals_coalesces() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([]));
        fixture.watcher.register_resource("products").await;

        fixture.write("products", json!([{"id": "1"}]));
        for _ in 0..5 {
            fixture.watcher.signal("products").await;
        }

        assert!(fixture.next_change().await.is_some());
        assert!(fixture.next_change().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_cancels_pending_check() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([]));
        fixture.watcher.register_resource("products").await;

        fixture.write("products", json!([{"id": "1"}]));
        fixture.watcher.signal("products").await;
        assert!(fixture.watcher.unregister_resource("products").await);

        assert!(fixture.next_change().await.is_none());
        assert!(!fixture.watcher.unregister_resource("products").await);
    }

    #[tokio::test]
    async fn test_parse_failure_is_no_change() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([]));
        fixture.watcher.register_resource("products").await;
        let before = fixture.watcher.snapshot_of("products").await;

        std::fs::write(fixture.store.location("products"), "[{ truncated").unwrap();
        fixture.bump += 10;
        File::options()
            .write(true)
            .open(fixture.store.location("products"))
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(fixture.bump))
            .unwrap();
        fixture.watcher.signal("products").await;
        assert!(fixture.next_change().await.is_none());
        assert_eq!(fixture.watcher.snapshot_of("products").await, before);

        // Watcher still alive for the next genuine change
        fixture.write("products", json!([{"id": "1"}]));
        fixture.watcher.signal("products").await;
        assert!(fixture.next_change().await.is_some());
    }

    #[tokio::test]
    async fn test_sales_change_outside_current_month_is_ignored() {
        let mut fixture = Fixture::new();
        let today = Local::now().date_naive();
        let this_month = today.format("%Y-%m-%d").to_string();
        let last_year = today.with_year(today.year() - 1).unwrap_or(today - chrono::Duration::days(366));
        let old = last_year.format("%Y-%m-%d").to_string();

        fixture.write("sales", json!([{"id": "1", "date": this_month}]));
        fixture.watcher.register_resource("sales").await;

        // Only an old sale is added: the month view is unchanged
        fixture.write(
            "sales",
            json!([{"id": "1", "date": this_month}, {"id": "2", "date": old}]),
        );
        fixture.watcher.signal("sales").await;
        assert!(fixture.next_change().await.is_none());

        fixture.write(
            "sales",
            json!([
                {"id": "1", "date": this_month},
                {"id": "2", "date": old},
                {"id": "3", "date": this_month}
            ]),
        );
        fixture.watcher.signal("sales").await;
        let change = fixture.next_change().await.expect("change expected");
        let ids: Vec<&str> = change
            .data
            .as_array()
            .unwrap()
            .iter()
            .map(|sale| sale["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_poll_strategy_detects_change() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([]));
        fixture.watcher.register_resource("products").await;
        let source = fixture
            .watcher
            .start(WatchStrategy::Poll, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(source.strategy(), WatchStrategy::Poll);

        fixture.write("products", json!([{"id": "7"}]));

        let change = fixture.next_change().await.expect("change expected");
        assert_eq!(change.data[0]["id"], "7");
        source.stop();
    }

    #[tokio::test]
    async fn test_event_strategy_detects_change() {
        let mut fixture = Fixture::new();
        fixture.write("products", json!([]));
        fixture.watcher.register_resource("products").await;
        let source = fixture
            .watcher
            .start(WatchStrategy::Events, Duration::from_secs(1))
            .await
            .unwrap();

        fixture.write("products", json!([{"id": "8"}]));

        let change = tokio::time::timeout(Duration::from_secs(3), fixture.changes.recv())
            .await
            .ok()
            .flatten()
            .expect("change expected");
        assert_eq!(change.data[0]["id"], "8");
        source.stop();
    }

    #[test]
    fn test_snapshot_digest_stable() {
        assert_eq!(snapshot_digest(&json!([1, 2])), snapshot_digest(&json!([1, 2])));
        assert_ne!(snapshot_digest(&json!([1, 2])), snapshot_digest(&json!([2, 1])));
    }
}
