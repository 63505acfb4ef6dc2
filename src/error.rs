// 🚨 Error Types - typed failures the core surfaces to callers
//
// Plumbing uses anyhow::Result with .context(); these enums exist where a
// caller needs to match on the failure (route layer mapping NotFound → 404).

use std::path::PathBuf;
use thiserror::Error;

/// Failures reading or writing a resource file
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource file not found: {0}")]
    Missing(PathBuf),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of ledger mutations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Update or delete targeted an identifier that is not in the sequence
    #[error("ledger entry not found: {0}")]
    NotFound(String),

    /// A running balance left the representable range at this entry
    #[error("running balance out of range at entry {0}")]
    BalanceOverflow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

/// Failures of stock adjustment
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("product not found: {0}")]
    ProductNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
