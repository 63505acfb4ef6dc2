// Back Office Sync - Core Library
// Exposes all modules for use in the maintenance CLI, the sync server and tests

pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod resources;   // Resource names + materialized views
pub mod events;      // Wire events pushed to clients
pub mod watcher;     // Change detection: debounce, mtime gate, snapshot diff
pub mod broadcaster; // Subscriber registry + heartbeats
pub mod engine;      // Watcher + broadcaster lifecycle
pub mod ledger;      // Running-balance ledger + fixed expense profile
pub mod inventory;   // Stock adjustment on sales

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::{SyncConfig, WatchStrategy, DEFAULT_RESOURCES};
pub use error::{InventoryError, LedgerError, StoreError};
pub use store::{DataStore, JsonFileStore};
pub use events::{ChangeEvent, EventKind};
pub use watcher::{snapshot_digest, ChangeWatcher, ResourceChange, WatchSource};
pub use broadcaster::{Broadcaster, DeliverFn, ResourceSnapshot, SnapshotSource, SubscriberInfo};
pub use engine::{StoreSnapshots, SyncEngine, SyncStatus};
pub use ledger::{
    EntryPatch, FixedExpenseProfile, LedgerEngine, LedgerEntry, Money,
    find_balance_violation, is_last_day_of_month, recompute_balances,
};
pub use inventory::{Inventory, KeywordExemption, NoExemptions, SaleLine, StockPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
