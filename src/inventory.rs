// 📦 Inventory - stock adjustment when sales are recorded or removed
//
// Whether a sale line touches stock is a business policy, injected as a
// StockPolicy. The adjustment itself is policy-free: it finds the product
// and moves its quantity by the sold amount. No sufficiency check is made
// here; that belongs to the caller's validation.

use crate::error::InventoryError;
use crate::resources::PRODUCTS;
use crate::store::{self, DataStore};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ============================================================================
// SALE LINE
// ============================================================================

/// The part of a sale that matters for stock
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    #[serde(deserialize_with = "deserialize_key")]
    pub product_id: String,

    /// Product description as shown on the sale
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub quantity_sold: i64,
}

fn deserialize_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid product id: {}", other))),
    }
}

// ============================================================================
// STOCK POLICY
// ============================================================================

pub trait StockPolicy: Send + Sync {
    /// True when the line must leave stock untouched (advances, services...)
    fn is_stock_exempt(&self, line: &SaleLine) -> bool;
}

/// Every line moves stock
pub struct NoExemptions;

impl StockPolicy for NoExemptions {
    fn is_stock_exempt(&self, _line: &SaleLine) -> bool {
        false
    }
}

/// Lines whose description contains a keyword (case-insensitive) are exempt
pub struct KeywordExemption {
    keyword: String,
}

impl KeywordExemption {
    pub fn new(keyword: &str) -> Self {
        KeywordExemption {
            keyword: keyword.to_lowercase(),
        }
    }
}

impl StockPolicy for KeywordExemption {
    fn is_stock_exempt(&self, line: &SaleLine) -> bool {
        !self.keyword.is_empty() && line.description.to_lowercase().contains(&self.keyword)
    }
}

// ============================================================================
// INVENTORY
// ============================================================================

pub struct Inventory {
    store: Arc<dyn DataStore>,
    policy: Arc<dyn StockPolicy>,
    write_lock: Mutex<()>,
}

impl Inventory {
    pub fn new(store: Arc<dyn DataStore>, policy: Arc<dyn StockPolicy>) -> Self {
        Inventory {
            store,
            policy,
            write_lock: Mutex::new(()),
        }
    }

    /// Take the sold quantity out of stock. Returns the new quantity, or
    /// None when the policy exempts the line.
    pub async fn apply_sale(&self, line: &SaleLine) -> Result<Option<i64>, InventoryError> {
        if self.policy.is_stock_exempt(line) {
            debug!(product_id = %line.product_id, "Sale line exempt from stock");
            return Ok(None);
        }
        self.adjust(&line.product_id, -line.quantity_sold).await.map(Some)
    }

    /// Put the sold quantity back (sale deleted)
    pub async fn revert_sale(&self, line: &SaleLine) -> Result<Option<i64>, InventoryError> {
        if self.policy.is_stock_exempt(line) {
            return Ok(None);
        }
        self.adjust(&line.product_id, line.quantity_sold).await.map(Some)
    }

    async fn adjust(&self, product_id: &str, delta: i64) -> Result<i64, InventoryError> {
        let _guard = self.write_lock.lock().await;
        let mut products: Vec<Value> = store::load_or_default(self.store.as_ref(), PRODUCTS)?;

        let product = products
            .iter_mut()
            .find(|product| id_matches(product, product_id))
            .ok_or_else(|| InventoryError::ProductNotFound(product_id.to_string()))?;

        let quantity = quantity_of(product) + delta;
        product["quantity"] = json!(quantity);

        store::save(self.store.as_ref(), PRODUCTS, &products)?;
        info!(product_id = %product_id, delta, quantity, "Stock adjusted");
        Ok(quantity)
    }
}

fn id_matches(product: &Value, product_id: &str) -> bool {
    match product.get("id") {
        Some(Value::String(id)) => id == product_id,
        Some(Value::Number(id)) => id.to_string() == product_id,
        _ => false,
    }
}

fn quantity_of(product: &Value) -> i64 {
    match product.get("quantity") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|q| q as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

// ============================================================================
// TESTS
// ============================================================================
