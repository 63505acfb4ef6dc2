// 🧭 Resource Views - per-resource transformation before diffing/broadcast
//
// Clients only ever see the materialized view of a resource. For every
// resource that view is the stored value itself, except `sales`, which is
// narrowed to the entries dated in the current calendar month.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime};
use serde_json::Value;

pub const SALES: &str = "sales";
pub const PRODUCTS: &str = "products";
pub const LEDGER: &str = "depensedumois";
pub const FIXED_EXPENSES: &str = "depensefixe";

/// Materialized view of a resource, evaluated against today's local date
pub fn materialize(name: &str, value: Value) -> Value {
    materialize_at(name, value, Local::now().date_naive())
}

/// Materialized view of a resource, evaluated against `today`
pub fn materialize_at(name: &str, value: Value, today: NaiveDate) -> Value {
    match name {
        SALES => filter_month(value, today.year(), today.month()),
        _ => value,
    }
}

/// Keep only the array entries whose `date` falls in `month`/`year`.
/// Entries without a parseable date are dropped; non-array values pass through.
pub fn filter_month(value: Value, year: i32, month: u32) -> Value {
    match value {
        Value::Array(entries) => Value::Array(
            entries
                .into_iter()
                .filter(|entry| {
                    entry
                        .get("date")
                        .and_then(Value::as_str)
                        .and_then(parse_entry_date)
                        .map_or(false, |date| date.year() == year && date.month() == month)
                })
                .collect(),
        ),
        other => other,
    }
}

/// Parse the date formats clients send: RFC 3339 timestamps (converted to
/// local time), naive `YYYY-MM-DDTHH:MM:SS[.fff]` and plain `YYYY-MM-DD`.
pub fn parse_entry_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Local).date_naive());
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.date());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sales_filtered_to_current_month() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let sales = json!([
            {"id": "1", "date": "2025-01-10"},
            {"id": "2", "date": "2025-03-02T09:15:00"},
            {"id": "3", "date": "2025-02-27"},
            {"id": "4", "date": "2025-03-20"},
            {"id": "5", "date": "2024-03-20"},
        ]);

        let view = materialize_at(SALES, sales, today);
        let ids: Vec<&str> = view
            .as_array()
            .unwrap()
            .iter()
            .map(|sale| sale["id"].as_str().unwrap())
            .collect();

        assert_eq!(ids, vec!["2", "4"]);
    }

    #[test]
    fn test_other_resources_unchanged() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let products = json!([{"id": "1", "date": "2020-01-01"}]);

        assert_eq!(materialize_at(PRODUCTS, products.clone(), today), products);
    }

    #[test]
    fn test_undated_sales_dropped() {
        let view = filter_month(json!([{"id": "1"}, {"id": "2", "date": "garbage"}]), 2025, 3);
        assert_eq!(view, json!([]));
    }

    #[test]
    fn test_non_array_passes_through() {
        assert_eq!(filter_month(json!({"total": 1}), 2025, 3), json!({"total": 1}));
    }

    #[test]
    fn test_parse_entry_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();

        assert_eq!(parse_entry_date("2025-06-15"), Some(expected));
        assert_eq!(parse_entry_date("2025-06-15T12:30:00.000"), Some(expected));
        assert!(parse_entry_date("2025-06-15T12:00:00Z").is_some());
        assert_eq!(parse_entry_date("15/06/2025"), None);
    }
}
