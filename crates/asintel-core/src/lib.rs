//! Core domain records for tracked ASIN collections, reviews and snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod coerce;
pub mod sentiment;

pub use sentiment::{LexiconScorer, ScoreError, SentimentScorer};

/// Product metadata carried by a tracked collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsinMeta {
    pub asin: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category_path: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl AsinMeta {
    pub fn new(asin: &str) -> Self {
        Self {
            asin: normalize_asin(asin),
            title: None,
            category_path: None,
            country: None,
        }
    }
}

/// Named, persistent grouping of ASINs under analysis.
///
/// ASINs are only ever appended. Metadata for an already tracked ASIN is
/// filled in when previously unknown but never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedCollection {
    pub collection_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub asins: Vec<AsinMeta>,
}

impl TrackedCollection {
    pub fn new(name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            collection_id: sanitize_collection_id(name),
            created_at,
            asins: Vec::new(),
        }
    }

    pub fn contains(&self, asin: &str) -> bool {
        self.asins.iter().any(|a| a.asin == asin)
    }

    pub fn get(&self, asin: &str) -> Option<&AsinMeta> {
        self.asins.iter().find(|a| a.asin == asin)
    }

    /// Returns the number of ASINs that were not tracked before.
    pub fn append_asins(&mut self, metas: impl IntoIterator<Item = AsinMeta>) -> usize {
        let mut added = 0;
        for meta in metas {
            if meta.asin.is_empty() {
                continue;
            }
            match self.asins.iter_mut().find(|a| a.asin == meta.asin) {
                Some(existing) => {
                    if existing.title.is_none() {
                        existing.title = meta.title;
                    }
                    if existing.category_path.is_none() {
                        existing.category_path = meta.category_path;
                    }
                    if existing.country.is_none() {
                        existing.country = meta.country;
                    }
                }
                None => {
                    self.asins.push(meta);
                    added += 1;
                }
            }
        }
        added
    }
}

/// One stored customer review. `(asin, review_id)` is unique in the row store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub asin: String,
    pub review_id: String,
    #[serde(default)]
    pub review_date: Option<NaiveDate>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub helpful_votes: u32,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub sentiment: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl ReviewRecord {
    /// Character count of the trimmed review text.
    pub fn text_length(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// Point-in-time observation of a product page. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub asin: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub price_raw: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub price_hidden: bool,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub total_reviews: Option<u64>,
    #[serde(default)]
    pub new_reviews: u32,
    #[serde(default)]
    pub duplicates_skipped: u32,
    #[serde(default)]
    pub bsr: Option<u64>,
    #[serde(default)]
    pub category_path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pages_visited: Option<u32>,
    #[serde(default)]
    pub stopped_reason: StopReason,
}

impl SnapshotRecord {
    pub fn capture_date(&self) -> NaiveDate {
        self.captured_at.date_naive()
    }
}

/// Why a review crawl stopped paginating.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    NoNewOnPage,
    DateCut,
    MaxReviews,
    MaxPages,
    EndPagination,
    #[default]
    Done,
    Other(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoNewOnPage => "no_new_on_page",
            Self::DateCut => "date_cut",
            Self::MaxReviews => "max_reviews",
            Self::MaxPages => "max_pages",
            Self::EndPagination => "end_pagination",
            Self::Done => "done",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for StopReason {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "no_new_on_page" => Self::NoNewOnPage,
            "date_cut" => Self::DateCut,
            "max_reviews" => Self::MaxReviews,
            "max_pages" => Self::MaxPages,
            "end_pagination" => Self::EndPagination,
            "" | "done" => Self::Done,
            _ => Self::Other(value),
        }
    }
}

impl From<StopReason> for String {
    fn from(value: StopReason) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn normalize_asin(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Collection ids are used as directory names: whitespace becomes `_` and
/// anything outside `[A-Za-z0-9_-]` is dropped.
pub fn sanitize_collection_id(name: &str) -> String {
    let cid = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect::<String>();
    if cid.is_empty() {
        "collection".to_string()
    } else {
        cid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn collection_ids_are_directory_safe() {
        assert_eq!(sanitize_collection_id("  headphones us "), "headphones_us");
        assert_eq!(sanitize_collection_id("kitchen/knives!"), "kitchenknives");
        assert_eq!(sanitize_collection_id("***"), "collection");
    }

    #[test]
    fn appending_asins_never_removes_or_overwrites() {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        let mut collection = TrackedCollection::new("test", created);
        let mut first = AsinMeta::new("b001example");
        first.title = Some("Original".into());
        assert_eq!(collection.append_asins([first]), 1);

        let mut again = AsinMeta::new("B001EXAMPLE");
        again.title = Some("Renamed".into());
        again.country = Some("US".into());
        assert_eq!(collection.append_asins([again, AsinMeta::new("B002")]), 1);

        assert_eq!(collection.asins.len(), 2);
        let meta = collection.get("B001EXAMPLE").unwrap();
        assert_eq!(meta.title.as_deref(), Some("Original"));
        assert_eq!(meta.country.as_deref(), Some("US"));
    }

    #[test]
    fn stop_reason_round_trips_through_strings() {
        assert_eq!(String::from(StopReason::DateCut), "date_cut");
        assert_eq!(StopReason::from("MAX_PAGES".to_string()), StopReason::MaxPages);
        assert_eq!(
            StopReason::from("captcha".to_string()),
            StopReason::Other("captcha".into())
        );
        assert_eq!(StopReason::from(String::new()), StopReason::Done);
    }
}
