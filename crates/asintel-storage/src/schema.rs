//! Stored row schema: the legacy column alias table and per-field coercion
//! applied once when rows are read back from disk.

use asintel_core::coerce;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

/// `(legacy name, current name)`. A legacy value is only used when the current
/// field is absent from the row.
pub const REVIEW_FIELD_ALIASES: &[(&str, &str)] = &[
    ("review_rating", "rating"),
    ("review_text", "text"),
    ("review_helpful_votes", "helpful_votes"),
    ("review_author", "author"),
    ("review_sentiment", "sentiment"),
];

pub const SNAPSHOT_FIELD_ALIASES: &[(&str, &str)] = &[
    ("avg_rating", "rating"),
    ("bsr_rank", "bsr"),
    ("best_sellers_rank", "bsr"),
    ("review_count", "total_reviews"),
    ("snapshot_ts", "captured_at"),
    ("price_text", "price_raw"),
];

pub(crate) struct TableSchema {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub aliases: &'static [(&'static str, &'static str)],
    pub coerce: fn(&mut Map<String, Value>),
}

pub(crate) const REVIEWS: TableSchema = TableSchema {
    name: "reviews",
    fields: &[
        "asin",
        "review_id",
        "review_date",
        "rating",
        "text",
        "helpful_votes",
        "author",
        "sentiment",
        "captured_at",
    ],
    aliases: REVIEW_FIELD_ALIASES,
    coerce: coerce_review,
};

pub(crate) const SNAPSHOTS: TableSchema = TableSchema {
    name: "snapshots",
    fields: &[
        "asin",
        "captured_at",
        "price_raw",
        "price",
        "price_hidden",
        "rating",
        "total_reviews",
        "new_reviews",
        "duplicates_skipped",
        "bsr",
        "category_path",
        "title",
        "pages_visited",
        "stopped_reason",
    ],
    aliases: SNAPSHOT_FIELD_ALIASES,
    coerce: coerce_snapshot,
};

/// Maps aliases, drops unknown columns, coerces legacy value types, then
/// decodes. The error string becomes the quarantine reason.
pub(crate) fn decode_row<T: DeserializeOwned>(
    mut row: Map<String, Value>,
    table: &TableSchema,
) -> Result<T, String> {
    for (legacy, current) in table.aliases {
        if let Some(value) = row.remove(*legacy) {
            row.entry(current.to_string()).or_insert(value);
        }
    }

    let unknown: Vec<String> = row
        .keys()
        .filter(|k| !table.fields.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        debug!(table = table.name, columns = ?unknown, "dropping unknown columns");
        for key in &unknown {
            row.remove(key);
        }
    }

    (table.coerce)(&mut row);
    serde_json::from_value(Value::Object(row)).map_err(|e| e.to_string())
}

fn coerce_review(row: &mut Map<String, Value>) {
    if let Some(Value::Number(n)) = row.get("review_id") {
        let id = n.to_string();
        row.insert("review_id".into(), Value::String(id));
    }
    let stars = match row.get("rating") {
        Some(Value::Number(n)) => Some(n.as_f64().and_then(coerce::review_stars)),
        Some(Value::String(s)) => Some(coerce::parse_star_rating(s).and_then(coerce::review_stars)),
        _ => None,
    };
    if let Some(stars) = stars {
        row.insert("rating".into(), stars.map(Value::from).unwrap_or(Value::Null));
    }
    if let Some(Value::String(s)) = row.get("review_date") {
        let date = coerce::parse_review_date(s);
        row.insert(
            "review_date".into(),
            date.map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
        );
    }
    if matches!(row.get("text"), Some(Value::Null)) {
        row.insert("text".into(), Value::String(String::new()));
    }
    coerce_count(row, "helpful_votes", true);
    coerce_float(row, "sentiment", |s| s.trim().parse::<f64>().ok());
    coerce_timestamp(row, "captured_at");
}

fn coerce_snapshot(row: &mut Map<String, Value>) {
    coerce_timestamp(row, "captured_at");

    if let Some(Value::String(text)) = row.get("price") {
        let text = text.clone();
        let parsed = coerce::parse_price(&text);
        row.entry("price_raw".to_string())
            .or_insert_with(|| Value::String(text.clone()));
        row.insert("price".into(), parsed.map(Value::from).unwrap_or(Value::Null));
    }
    if matches!(row.get("price_hidden"), None | Some(Value::Null)) {
        let missing = matches!(row.get("price"), None | Some(Value::Null));
        row.insert("price_hidden".into(), Value::Bool(missing));
    }

    coerce_float(row, "rating", coerce::parse_star_rating);
    for key in ["total_reviews", "bsr", "pages_visited"] {
        coerce_count(row, key, false);
    }
    for key in ["new_reviews", "duplicates_skipped"] {
        coerce_count(row, key, true);
    }
    if matches!(row.get("stopped_reason"), Some(Value::Null)) {
        row.remove("stopped_reason");
    }
}

/// Text or float counts become integers. Unreadable values become null, or are
/// removed so the field default applies when `defaulted` is set.
fn coerce_count(row: &mut Map<String, Value>, key: &str, defaulted: bool) {
    let parsed = match row.get(key) {
        Some(Value::String(s)) => coerce::parse_count(s),
        Some(Value::Number(n)) if n.is_u64() => return,
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u64),
        Some(Value::Null) => None,
        _ => return,
    };
    match (parsed, defaulted) {
        (Some(v), _) => {
            row.insert(key.into(), Value::from(v));
        }
        (None, true) => {
            row.remove(key);
        }
        (None, false) => {
            row.insert(key.into(), Value::Null);
        }
    }
}

fn coerce_float(row: &mut Map<String, Value>, key: &str, parse: fn(&str) -> Option<f64>) {
    if let Some(Value::String(s)) = row.get(key) {
        let parsed = parse(s);
        row.insert(key.into(), parsed.map(Value::from).unwrap_or(Value::Null));
    }
}

/// Unparseable timestamps are left untouched so decoding fails and the row is
/// quarantined.
fn coerce_timestamp(row: &mut Map<String, Value>, key: &str) {
    if let Some(Value::String(s)) = row.get(key) {
        if let Some(ts) = coerce::parse_timestamp(s) {
            row.insert(key.into(), Value::String(ts.to_rfc3339()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asintel_core::{ReviewRecord, SnapshotRecord};
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn current_field_wins_over_its_alias() {
        let row = object(json!({
            "asin": "B001",
            "captured_at": "2025-01-01T00:00:00Z",
            "rating": 4.0,
            "avg_rating": 1.0,
        }));
        let snap: SnapshotRecord = decode_row(row, &SNAPSHOTS).unwrap();
        assert_eq!(snap.rating, Some(4.0));
    }

    #[test]
    fn fractional_review_ratings_decode_as_missing() {
        let row = object(json!({
            "asin": "B001",
            "review_id": 77,
            "review_rating": 4.5,
            "captured_at": "2025-01-01T00:00:00Z",
        }));
        let review: ReviewRecord = decode_row(row, &REVIEWS).unwrap();
        assert_eq!(review.review_id, "77");
        assert_eq!(review.rating, None);
    }

    #[test]
    fn missing_price_hidden_follows_the_price() {
        let null_flag = object(json!({
            "asin": "B001",
            "captured_at": "2025-01-01T00:00:00Z",
            "price": null,
            "price_hidden": null,
        }));
        let snap: SnapshotRecord = decode_row(null_flag, &SNAPSHOTS).unwrap();
        assert!(snap.price_hidden);

        let no_price = object(json!({"asin": "B001", "captured_at": "2025-01-01T00:00:00Z"}));
        let snap: SnapshotRecord = decode_row(no_price, &SNAPSHOTS).unwrap();
        assert!(snap.price_hidden);

        let priced = object(json!({
            "asin": "B001",
            "captured_at": "2025-01-01T00:00:00Z",
            "price": 12.5,
        }));
        let snap: SnapshotRecord = decode_row(priced, &SNAPSHOTS).unwrap();
        assert!(!snap.price_hidden);

        let explicit = object(json!({
            "asin": "B001",
            "captured_at": "2025-01-01T00:00:00Z",
            "price": "$9.99",
            "price_hidden": true,
        }));
        let snap: SnapshotRecord = decode_row(explicit, &SNAPSHOTS).unwrap();
        assert!(snap.price_hidden);
    }

    #[test]
    fn bad_timestamps_fail_decoding() {
        let row = object(json!({"asin": "B001", "captured_at": "later"}));
        assert!(decode_row::<SnapshotRecord>(row, &SNAPSHOTS).is_err());
    }
}
