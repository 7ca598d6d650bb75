//! Scrape batch contract: one JSON file per ASIN crawl, dropped into an inbox
//! directory by the browser layer and sanitized into typed records here.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use asintel_core::{coerce, normalize_asin, AsinMeta, ReviewRecord, SnapshotRecord, StopReason};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of identifiers synthesized for reviews scraped without one.
pub const SYNTHETIC_ID_PREFIX: &str = "anon-";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a valid scrape batch: {reason}")]
    Malformed { path: String, reason: String },
    #[error("{path} has no asin")]
    MissingAsin { path: String },
    #[error("{path} has an unreadable captured_at {value:?}")]
    BadTimestamp { path: String, value: String },
}

/// A scalar the scraper may deliver as a number or as site text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScalar {
    Number(f64),
    Text(String),
}

impl RawScalar {
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    fn count(&self) -> Option<u64> {
        match self {
            Self::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as u64),
            Self::Number(_) => None,
            Self::Text(s) => coerce::parse_count(s),
        }
    }

    fn star_rating(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n).filter(|r| (0.0..=5.0).contains(r)),
            Self::Text(s) => coerce::parse_star_rating(s),
        }
    }

    fn price(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n).filter(|p| p.is_finite() && *p >= 0.0),
            Self::Text(s) => coerce::parse_price(s),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReview {
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub review_id: Option<RawScalar>,
    #[serde(default)]
    pub review_date: Option<String>,
    #[serde(default)]
    pub rating: Option<RawScalar>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub helpful_votes: Option<RawScalar>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    #[serde(default)]
    pub price: Option<RawScalar>,
    #[serde(default)]
    pub rating: Option<RawScalar>,
    #[serde(default)]
    pub total_reviews: Option<RawScalar>,
    #[serde(default)]
    pub bsr: Option<RawScalar>,
    #[serde(default)]
    pub category_path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pages_visited: Option<RawScalar>,
    #[serde(default)]
    pub stopped_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub marketplace: Option<String>,
    pub captured_at: String,
    #[serde(default)]
    pub reviews: Vec<RawReview>,
    #[serde(default)]
    pub snapshot: RawSnapshot,
}

/// Typed rows for one ASIN crawl, ready for the merger.
///
/// `new_reviews`/`duplicates_skipped` on the snapshot and every review's
/// sentiment are left for the merger to fill.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeBatch {
    pub asin: String,
    pub marketplace: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub reviews: Vec<ReviewRecord>,
    pub snapshot: SnapshotRecord,
}

impl ScrapeBatch {
    pub fn asin_meta(&self) -> AsinMeta {
        AsinMeta {
            asin: self.asin.clone(),
            title: self.snapshot.title.clone(),
            category_path: self.snapshot.category_path.clone(),
            country: self.marketplace.clone(),
        }
    }
}

/// One inbox file: its sanitized batch plus the exact bytes for archiving.
#[derive(Debug, Clone)]
pub struct InboxBatch {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub batch: ScrapeBatch,
}

#[derive(Debug, Default)]
pub struct InboxScan {
    pub batches: Vec<InboxBatch>,
    pub rejected: Vec<(PathBuf, IntakeError)>,
}

/// Reads every `*.json` file in `dir` in file-name order. Files that are not
/// valid batches are reported in `rejected` and do not stop the scan.
pub fn load_inbox(dir: &Path) -> Result<InboxScan> {
    let mut scan = InboxScan::default();
    if !dir.exists() {
        debug!(inbox = %dir.display(), "inbox directory does not exist");
        return Ok(scan);
    }

    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading inbox {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing inbox {}", dir.display()))?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"));
    paths.sort();

    for path in paths {
        match load_batch_file(&path) {
            Ok(batch) => scan.batches.push(batch),
            Err(err) => {
                warn!(file = %path.display(), error = %err, "rejecting scrape batch");
                scan.rejected.push((path, err));
            }
        }
    }
    Ok(scan)
}

pub fn load_batch_file(path: &Path) -> Result<InboxBatch, IntakeError> {
    let bytes = fs::read(path).map_err(|source| IntakeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let batch = parse_batch(&bytes, &path.display().to_string())?;
    Ok(InboxBatch {
        path: path.to_path_buf(),
        bytes,
        batch,
    })
}

/// `origin` only labels errors.
pub fn parse_batch(bytes: &[u8], origin: &str) -> Result<ScrapeBatch, IntakeError> {
    let raw: RawBatch = serde_json::from_slice(bytes).map_err(|e| IntakeError::Malformed {
        path: origin.to_string(),
        reason: e.to_string(),
    })?;
    sanitize_batch(raw, origin)
}

pub fn sanitize_batch(raw: RawBatch, origin: &str) -> Result<ScrapeBatch, IntakeError> {
    let asin = raw.asin.as_deref().map(normalize_asin).unwrap_or_default();
    if asin.is_empty() {
        return Err(IntakeError::MissingAsin {
            path: origin.to_string(),
        });
    }
    let captured_at =
        coerce::parse_timestamp(&raw.captured_at).ok_or_else(|| IntakeError::BadTimestamp {
            path: origin.to_string(),
            value: raw.captured_at.clone(),
        })?;

    let reviews = raw
        .reviews
        .into_iter()
        .map(|review| sanitize_review(review, &asin, captured_at))
        .collect();
    let snapshot = sanitize_snapshot(raw.snapshot, &asin, captured_at);

    Ok(ScrapeBatch {
        asin,
        marketplace: non_empty(raw.marketplace),
        captured_at,
        reviews,
        snapshot,
    })
}

fn sanitize_review(raw: RawReview, batch_asin: &str, captured_at: DateTime<Utc>) -> ReviewRecord {
    let asin = raw
        .asin
        .as_deref()
        .map(normalize_asin)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| batch_asin.to_string());
    let review_date = raw.review_date.as_deref().and_then(coerce::parse_review_date);
    let rating = raw
        .rating
        .as_ref()
        .and_then(RawScalar::star_rating)
        .and_then(coerce::review_stars);
    let text = raw.text.unwrap_or_default();
    let review_id = raw
        .review_id
        .map(|id| id.as_text().trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthesize_review_id(&asin, review_date, rating, &text));

    ReviewRecord {
        asin,
        review_id,
        review_date,
        rating,
        text,
        helpful_votes: raw
            .helpful_votes
            .as_ref()
            .and_then(RawScalar::count)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0),
        author: non_empty(raw.author),
        sentiment: None,
        captured_at,
    }
}

fn sanitize_snapshot(raw: RawSnapshot, asin: &str, captured_at: DateTime<Utc>) -> SnapshotRecord {
    let price = raw.price.as_ref().and_then(RawScalar::price);
    SnapshotRecord {
        asin: asin.to_string(),
        captured_at,
        price_raw: raw.price.as_ref().map(RawScalar::as_text),
        price,
        price_hidden: price.is_none(),
        rating: raw.rating.as_ref().and_then(RawScalar::star_rating),
        total_reviews: raw.total_reviews.as_ref().and_then(RawScalar::count),
        new_reviews: 0,
        duplicates_skipped: 0,
        bsr: raw.bsr.as_ref().and_then(RawScalar::count),
        category_path: non_empty(raw.category_path),
        title: non_empty(raw.title),
        pages_visited: raw
            .pages_visited
            .as_ref()
            .and_then(RawScalar::count)
            .and_then(|v| u32::try_from(v).ok()),
        stopped_reason: raw
            .stopped_reason
            .map(StopReason::from)
            .unwrap_or_default(),
    }
}

/// Deterministic id from review content: `anon-` + 16 hex chars of
/// sha256(`asin|date|rating|text`).
pub fn synthesize_review_id(
    asin: &str,
    review_date: Option<NaiveDate>,
    rating: Option<u8>,
    text: &str,
) -> String {
    let date = review_date.map(|d| d.to_string()).unwrap_or_default();
    let rating = rating.map(|r| r.to_string()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(format!("{asin}|{date}|{rating}|{}", text.trim()).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{SYNTHETIC_ID_PREFIX}{}", &digest[..16])
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SITE_TEXT_BATCH: &str = r##"{
        "asin": " b001example ",
        "marketplace": "US",
        "captured_at": "2025-01-03T09:30:00Z",
        "reviews": [
            {"review_id": "R1", "review_date": "Reviewed in the United States on January 2, 2025",
             "rating": "5.0 out of 5 stars", "text": "Great blender", "helpful_votes": "12 people found this helpful"},
            {"review_date": "2025-01-01", "rating": 2, "text": "Broke after a week", "author": "  "}
        ],
        "snapshot": {"price": "Click to see price", "rating": "4.4 out of 5 stars",
                     "total_reviews": "1,234 global ratings", "bsr": "#52 in Kitchen & Dining",
                     "title": "Blender", "pages_visited": 2, "stopped_reason": "date_cut"}
    }"##;

    #[test]
    fn site_text_is_coerced_into_typed_records() {
        let batch = parse_batch(SITE_TEXT_BATCH.as_bytes(), "inline").expect("batch");
        assert_eq!(batch.asin, "B001EXAMPLE");

        let first = &batch.reviews[0];
        assert_eq!(first.review_date, NaiveDate::from_ymd_opt(2025, 1, 2));
        assert_eq!(first.rating, Some(5));
        assert_eq!(first.helpful_votes, 12);

        let snap = &batch.snapshot;
        assert_eq!(snap.price, None);
        assert!(snap.price_hidden);
        assert_eq!(snap.price_raw.as_deref(), Some("Click to see price"));
        assert_eq!(snap.rating, Some(4.4));
        assert_eq!(snap.total_reviews, Some(1234));
        assert_eq!(snap.bsr, Some(52));
        assert_eq!(snap.pages_visited, Some(2));
        assert_eq!(snap.stopped_reason, StopReason::DateCut);
        assert_eq!(batch.asin_meta().country.as_deref(), Some("US"));
    }

    #[test]
    fn reviews_without_ids_get_stable_content_ids() {
        let a = parse_batch(SITE_TEXT_BATCH.as_bytes(), "a").expect("batch");
        let b = parse_batch(SITE_TEXT_BATCH.as_bytes(), "b").expect("batch");
        let id = &a.reviews[1].review_id;
        assert!(id.starts_with(SYNTHETIC_ID_PREFIX));
        assert_eq!(id.len(), SYNTHETIC_ID_PREFIX.len() + 16);
        assert_eq!(id, &b.reviews[1].review_id);
        assert_eq!(a.reviews[1].author, None);
    }

    #[test]
    fn unparseable_numeric_price_is_missing_not_fatal() {
        let batch = parse_batch(
            br#"{"asin":"B1","captured_at":"2025-01-01 08:00:00","snapshot":{"price":"$--"}}"#,
            "inline",
        )
        .expect("batch");
        assert_eq!(batch.snapshot.price, None);
        assert!(batch.snapshot.price_hidden);
        assert!(batch.reviews.is_empty());
    }

    #[test]
    fn batches_need_an_asin_and_a_timestamp() {
        assert!(matches!(
            parse_batch(br#"{"captured_at":"2025-01-01T00:00:00Z"}"#, "x"),
            Err(IntakeError::MissingAsin { .. })
        ));
        assert!(matches!(
            parse_batch(br#"{"asin":"B1","captured_at":"soon"}"#, "x"),
            Err(IntakeError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn inbox_scan_orders_files_and_reports_rejects() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("02_b.json"),
            r#"{"asin":"B2","captured_at":"2025-01-02T00:00:00Z"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("01_a.json"),
            r#"{"asin":"B1","captured_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("03_bad.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scan = load_inbox(dir.path()).expect("scan");
        let asins: Vec<_> = scan.batches.iter().map(|b| b.batch.asin.as_str()).collect();
        assert_eq!(asins, ["B1", "B2"]);
        assert_eq!(scan.rejected.len(), 1);
        assert!(!scan.batches[0].bytes.is_empty());
    }

    #[test]
    fn missing_inbox_is_empty() {
        let dir = tempdir().expect("tempdir");
        let scan = load_inbox(&dir.path().join("nope")).expect("scan");
        assert!(scan.batches.is_empty());
    }
}
