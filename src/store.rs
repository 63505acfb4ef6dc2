// 🗄️ Data Store - whole-record get/put over named resources
//
// The core never cares how resources are persisted; it reads and writes a
// complete JSON value per resource name. JsonFileStore keeps one pretty
// printed `<name>.json` file per resource inside a data directory, which is
// also what the change watcher observes.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// ============================================================================
// DATA STORE CONTRACT
// ============================================================================

pub trait DataStore: Send + Sync {
    /// Read the full current value of a resource
    fn read(&self, name: &str) -> Result<Value, StoreError>;

    /// Replace the full value of a resource
    fn write(&self, name: &str, value: &Value) -> Result<(), StoreError>;

    fn exists(&self, name: &str) -> bool;

    /// Last modification time of the resource
    fn modified(&self, name: &str) -> Result<SystemTime, StoreError>;

    /// Where the resource lives (used for logging and file watching)
    fn location(&self, name: &str) -> PathBuf;
}

/// Read a resource and deserialize it into `T`
pub fn load<T: DeserializeOwned>(store: &dyn DataStore, name: &str) -> Result<T, StoreError> {
    let value = store.read(name)?;
    serde_json::from_value(value).map_err(|source| StoreError::Parse {
        path: store.location(name),
        source,
    })
}

/// Read a resource, falling back to `T::default()` when it does not exist yet
pub fn load_or_default<T: DeserializeOwned + Default>(
    store: &dyn DataStore,
    name: &str,
) -> Result<T, StoreError> {
    if !store.exists(name) {
        return Ok(T::default());
    }
    load(store, name)
}

/// Serialize `value` and write it as the resource's full content
pub fn save<T: Serialize>(store: &dyn DataStore, name: &str, value: &T) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Parse {
        path: store.location(name),
        source,
    })?;
    store.write(name, &value)
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        JsonFileStore { dir: dir.into() }
    }

    /// Create the data directory if needed
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).map_err(|source| StoreError::Io {
            path: store.dir.clone(),
            source,
        })?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resource name for a file path (`db/products.json` → `products`)
    pub fn resource_name(path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return None;
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.to_string())
    }

    /// Write `value` only when the resource is missing (first-run seeding)
    pub fn seed(&self, name: &str, value: &Value) -> Result<bool, StoreError> {
        if self.exists(name) {
            return Ok(false);
        }
        self.write(name, value)?;
        Ok(true)
    }
}

impl DataStore for JsonFileStore {
    fn read(&self, name: &str) -> Result<Value, StoreError> {
        let path = self.location(name);
        let content = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::Missing(path.clone())
            } else {
                StoreError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        serde_json::from_str(&content).map_err(|source| StoreError::Parse { path, source })
    }

    fn write(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.location(name);
        let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;

        fs::write(&path, content).map_err(|source| StoreError::Io { path, source })
    }

    fn exists(&self, name: &str) -> bool {
        self.location(name).is_file()
    }

    fn modified(&self, name: &str) -> Result<SystemTime, StoreError> {
        let path = self.location(name);
        fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    StoreError::Missing(path.clone())
                } else {
                    StoreError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            })
    }

    fn location(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        store.write("products", &json!([{"id": "1", "quantity": 3}])).unwrap();

        assert!(store.exists("products"));
        assert_eq!(store.read("products").unwrap()[0]["quantity"], 3);
        assert!(store.modified("products").is_ok());
    }

    #[test]
    fn test_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        assert!(!store.exists("sales"));
        assert!(matches!(store.read("sales"), Err(StoreError::Missing(_))));
        assert!(matches!(store.modified("sales"), Err(StoreError::Missing(_))));

        let sales: Vec<Value> = load_or_default(&store, "sales").unwrap();
        assert!(sales.is_empty());
    }

    #[test]
    fn test_corrupt_resource_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        fs::write(store.location("products"), "{ not json").unwrap();

        assert!(matches!(store.read("products"), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn test_seed_only_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        assert!(store.seed("sales", &json!([])).unwrap());
        store.write("sales", &json!([{"id": "9"}])).unwrap();
        assert!(!store.seed("sales", &json!([])).unwrap());
        assert_eq!(store.read("sales").unwrap()[0]["id"], "9");
    }

    #[test]
    fn test_resource_name() {
        assert_eq!(
            JsonFileStore::resource_name(Path::new("/srv/db/products.json")),
            Some("products".to_string())
        );
        assert_eq!(JsonFileStore::resource_name(Path::new("/srv/db/products.json.tmp")), None);
        assert_eq!(JsonFileStore::resource_name(Path::new("/srv/db/README")), None);
    }
}
