// 📒 Ledger Engine - running balances over the month's debit/credit movements
//
// Invariant (by position, not by id):
//   balance[0] = credit[0] - debit[0]
//   balance[i] = balance[i-1] + credit[i] - debit[i]
//
// The balance is derived, never set: any incoming value is ignored and every
// mutation recomputes the affected suffix before the whole sequence is
// written back in one piece.
//
// Amounts are fixed-point cents (Money). Inputs are rounded half away from
// zero to the cent when read; sums are exact from then on. Amounts beyond
// Money::MAX_CENTS are rejected when read, and a running balance that would
// leave the i64 range is a LedgerError.
//
// On disk an entry keeps the French keys clients read (`categorie`, `solde`).

use crate::error::LedgerError;
use crate::resources::{FIXED_EXPENSES, LEDGER};
use crate::store::{self, DataStore};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ============================================================================
// MONEY
// ============================================================================

/// Currency amount in integer cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Largest accepted single amount: ten trillion in currency units
    pub const MAX_CENTS: i64 = 1_000_000_000_000_000;

    pub fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Round to the nearest cent, halves away from zero. Non-finite → 0,
    /// `None` beyond ±MAX_CENTS.
    pub fn try_from_f64(amount: f64) -> Option<Self> {
        if !amount.is_finite() {
            return Some(Money::ZERO);
        }
        let cents = (amount * 100.0).round();
        if cents.abs() > Money::MAX_CENTS as f64 {
            return None;
        }
        Some(Money(cents as i64))
    }

    /// Like try_from_f64, clamped to ±MAX_CENTS
    pub fn from_f64(amount: f64) -> Self {
        Money::try_from_f64(amount).unwrap_or_else(|| {
            if amount.is_sign_negative() {
                Money(-Money::MAX_CENTS)
            } else {
                Money(Money::MAX_CENTS)
            }
        })
    }

    /// Lenient conversion used for every amount read from JSON: numbers and
    /// numeric strings parse, anything else (null, "abc") is 0. Returns
    /// `None` only for a numeric amount out of range.
    pub fn from_json(value: &Value) -> Option<Self> {
        let amount = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match amount {
            Some(amount) => Money::try_from_f64(amount),
            None => Some(Money::ZERO),
        }
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        f.pad(&format!("{}{}.{:02}", sign, abs / 100, abs % 100))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Money::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("amount out of range: {}", value)))
    }
}

/// A key that is present always counts, even as `null` (→ 0); only an
/// absent key leaves the field untouched.
fn deserialize_present_amount<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Money>, D::Error> {
    Money::deserialize(deserializer).map(Some)
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid entry id: {}", other))),
    }
}

// ============================================================================
// LEDGER ENTRY
// ============================================================================

/// One movement of the month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "categorie", alias = "category")]
    pub category: String,

    #[serde(default)]
    pub debit: Money,

    #[serde(default)]
    pub credit: Money,

    /// Derived running balance
    #[serde(default, rename = "solde", alias = "balance")]
    pub balance: Money,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Fields the core does not interpret, preserved as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LedgerEntry {
    /// credit - debit of this entry alone
    pub fn net(&self) -> Money {
        self.credit - self.debit
    }
}

/// Fields supplied when creating or editing an entry. Absent fields are left
/// untouched on update; `id` and `balance` are never taken from input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryPatch {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, rename = "categorie", alias = "category")]
    pub category: Option<String>,

    #[serde(default, deserialize_with = "deserialize_present_amount")]
    pub debit: Option<Money>,

    #[serde(default, deserialize_with = "deserialize_present_amount")]
    pub credit: Option<Money>,

    #[serde(default)]
    pub date: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const DERIVED_KEYS: [&str; 4] = ["id", "balance", "solde", "total"];

impl EntryPatch {
    pub fn movement(description: &str, category: &str, debit: f64, credit: f64) -> Self {
        EntryPatch {
            description: Some(description.to_string()),
            category: Some(category.to_string()),
            debit: Some(Money::from_f64(debit)),
            credit: Some(Money::from_f64(credit)),
            ..EntryPatch::default()
        }
    }

    fn apply_to(self, entry: &mut LedgerEntry) {
        if let Some(description) = self.description {
            entry.description = description;
        }
        if let Some(category) = self.category {
            entry.category = category;
        }
        if let Some(debit) = self.debit {
            entry.debit = debit;
        }
        if let Some(credit) = self.credit {
            entry.credit = credit;
        }
        if let Some(date) = self.date {
            entry.date = Some(date);
        }
        for (key, value) in self.extra {
            if !DERIVED_KEYS.contains(&key.as_str()) {
                entry.extra.insert(key, value);
            }
        }
    }
}

// ============================================================================
// BALANCE RECOMPUTATION
// ============================================================================

fn running_balance(previous: Money, entry: &LedgerEntry) -> Result<Money, LedgerError> {
    previous
        .checked_add(entry.net())
        .ok_or_else(|| LedgerError::BalanceOverflow(entry.id.clone()))
}

/// Re-derive balances from position `from` to the end. Nothing is written
/// back to `entries` when a balance would overflow.
pub fn recompute_balances(entries: &mut [LedgerEntry], from: usize) -> Result<(), LedgerError> {
    let mut previous = match from {
        0 => Money::ZERO,
        _ => entries[from - 1].balance,
    };
    let mut balances = Vec::with_capacity(entries.len().saturating_sub(from));
    for entry in &entries[from..] {
        previous = running_balance(previous, entry)?;
        balances.push(previous);
    }

    for (entry, balance) in entries[from..].iter_mut().zip(balances) {
        entry.balance = balance;
    }
    Ok(())
}

/// Position of the first entry breaking the running-balance invariant
pub fn find_balance_violation(entries: &[LedgerEntry]) -> Option<usize> {
    let mut previous = Money::ZERO;
    for (i, entry) in entries.iter().enumerate() {
        if previous.checked_add(entry.net()) != Some(entry.balance) {
            return Some(i);
        }
        previous = entry.balance;
    }
    None
}

/// Max numeric id + 1, or "1" for an empty (or all non-numeric) sequence
pub fn next_id(entries: &[LedgerEntry]) -> String {
    entries
        .iter()
        .filter_map(|entry| entry.id.trim().parse::<u64>().ok())
        .max()
        .map_or(1, |max| max + 1)
        .to_string()
}

// ============================================================================
// FIXED EXPENSE PROFILE
// ============================================================================

/// Recurring monthly costs with a derived total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedExpenseProfile {
    #[serde(default)]
    pub free: Money,

    #[serde(default)]
    pub internet_zeop: Money,

    #[serde(default)]
    pub assurance_voiture: Money,

    #[serde(default)]
    pub autre_depense: Money,

    #[serde(default)]
    pub assurance_vie: Money,

    /// Derived: sum of the named fields
    #[serde(default)]
    pub total: Money,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FixedExpenseProfile {
    pub fn recompute_total(&mut self) {
        self.total = self.free
            + self.internet_zeop
            + self.assurance_voiture
            + self.autre_depense
            + self.assurance_vie;
        self.extra.remove("total");
    }
}

impl Default for FixedExpenseProfile {
    fn default() -> Self {
        let mut profile = FixedExpenseProfile {
            free: Money::from_cents(1999),
            internet_zeop: Money::from_cents(3999),
            assurance_voiture: Money::from_cents(8500),
            autre_depense: Money::from_cents(4500),
            assurance_vie: Money::from_cents(12000),
            total: Money::ZERO,
            extra: Map::new(),
        };
        profile.recompute_total();
        profile
    }
}

// ============================================================================
// LEDGER ENGINE
// ============================================================================

/// Every mutation reads the full sequence, recomputes, and writes it back
/// while holding `write_lock`, so two mutations never interleave.
pub struct LedgerEngine {
    store: Arc<dyn DataStore>,
    write_lock: Mutex<()>,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        LedgerEngine {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.load()
    }

    pub async fn get(&self, id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.load()?.into_iter().find(|entry| entry.id == id))
    }

    /// Append a movement at the end of the sequence
    pub async fn append(&self, draft: EntryPatch) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;

        let mut entry = LedgerEntry {
            id: next_id(&entries),
            description: String::new(),
            category: String::new(),
            debit: Money::ZERO,
            credit: Money::ZERO,
            balance: Money::ZERO,
            date: None,
            extra: Map::new(),
        };
        draft.apply_to(&mut entry);

        let previous = entries.last().map_or(Money::ZERO, |last| last.balance);
        entry.balance = running_balance(previous, &entry)?;
        entries.push(entry.clone());

        self.persist(&entries)?;
        info!(id = %entry.id, balance = %entry.balance, "Ledger entry appended");
        Ok(entry)
    }

    /// Merge `patch` into entry `id` and recompute from its position onward
    pub async fn update(&self, id: &str, patch: EntryPatch) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;

        let index = entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        patch.apply_to(&mut entries[index]);
        recompute_balances(&mut entries, index)?;

        self.persist(&entries)?;
        info!(id = %id, recomputed = entries.len() - index, "Ledger entry updated");
        Ok(entries[index].clone())
    }

    /// Remove entry `id` and recompute the whole remaining sequence
    pub async fn delete(&self, id: &str) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;

        let index = entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        let removed = entries.remove(index);
        recompute_balances(&mut entries, 0)?;

        self.persist(&entries)?;
        info!(id = %id, remaining = entries.len(), "Ledger entry deleted");
        Ok(removed)
    }

    /// Month-end rollover: empty the sequence. The fixed profile is kept.
    pub async fn reset_all(&self) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        self.persist(&[])?;
        info!("Ledger reset");
        Ok(())
    }

    /// Reset only when `today` is the last day of its month
    pub async fn reset_if_month_end(&self, today: NaiveDate) -> Result<bool, LedgerError> {
        if !is_last_day_of_month(today) {
            return Ok(false);
        }
        self.reset_all().await?;
        Ok(true)
    }

    /// Rewrite every balance from scratch (repair for hand-edited files).
    /// Returns whether anything changed.
    pub async fn repair(&self) -> Result<bool, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;

        let Some(first_bad) = find_balance_violation(&entries) else {
            return Ok(false);
        };
        warn!(position = first_bad, "Ledger balances inconsistent, recomputing");
        recompute_balances(&mut entries, 0)?;
        self.persist(&entries)?;
        Ok(true)
    }

    /// Current fixed profile; the default one is written on first access
    pub async fn fixed_expenses(&self) -> Result<FixedExpenseProfile, LedgerError> {
        if !self.store.exists(FIXED_EXPENSES) {
            let _guard = self.write_lock.lock().await;
            let profile = FixedExpenseProfile::default();
            store::save(self.store.as_ref(), FIXED_EXPENSES, &profile)?;
            info!("Fixed expense profile initialised with defaults");
            return Ok(profile);
        }
        Ok(store::load(self.store.as_ref(), FIXED_EXPENSES)?)
    }

    pub async fn update_fixed_expenses(
        &self,
        mut profile: FixedExpenseProfile,
    ) -> Result<FixedExpenseProfile, LedgerError> {
        let _guard = self.write_lock.lock().await;
        profile.recompute_total();
        store::save(self.store.as_ref(), FIXED_EXPENSES, &profile)?;
        info!(total = %profile.total, "Fixed expense profile updated");
        Ok(profile)
    }

    fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(store::load_or_default(self.store.as_ref(), LEDGER)?)
    }

    fn persist(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        if let Some(position) = find_balance_violation(entries) {
            warn!(position, "Persisting ledger with broken balance invariant");
        } else {
            debug!(entries = entries.len(), "Ledger invariant holds");
        }
        store::save(self.store.as_ref(), LEDGER, &entries)?;
        Ok(())
    }
}

pub fn is_last_day_of_month(day: NaiveDate) -> bool {
    day.succ_opt().map_or(true, |next| next.month() != day.month())
}

// ============================================================================
// TESTS
// ============================================================================
