//! Reconciles scraped batches with the row store.
//!
//! A merge is staged per ASIN and only committed to the tables once every batch
//! for that ASIN merged cleanly, so a failing ASIN leaves its stored rows alone.

use std::collections::BTreeSet;

use asintel_core::{ReviewRecord, SentimentScorer, SnapshotRecord, StopReason};
use asintel_intake::ScrapeBatch;
use asintel_storage::{KnownReviews, RowTables};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("stored rows for {asin} cannot be merged into: {reason}")]
    CorruptStore { asin: String, reason: String },
    #[error("batch for {expected} carries review {review_id} for {found}")]
    AsinMismatch {
        expected: String,
        found: String,
        review_id: String,
    },
}

/// What one batch contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub new_reviews: u32,
    pub duplicates_skipped: u32,
    pub snapshot_written: bool,
    pub pages_visited: Option<u32>,
    pub stopped_reason: StopReason,
}

/// Pending rows for one ASIN, not yet visible in the tables.
#[derive(Debug, Clone)]
pub struct AsinMerge {
    asin: String,
    known: KnownReviews,
    captured: BTreeSet<DateTime<Utc>>,
    reviews: Vec<ReviewRecord>,
    snapshots: Vec<SnapshotRecord>,
}

impl AsinMerge {
    pub fn asin(&self) -> &str {
        &self.asin
    }

    pub fn pending_reviews(&self) -> &[ReviewRecord] {
        &self.reviews
    }

    pub fn commit(self, tables: &mut RowTables) {
        debug!(
            asin = %self.asin,
            reviews = self.reviews.len(),
            snapshots = self.snapshots.len(),
            "committing merge"
        );
        tables.reviews.extend(self.reviews);
        tables.snapshots.extend(self.snapshots);
    }
}

pub struct CollectionMerger<'a> {
    scorer: &'a dyn SentimentScorer,
}

impl<'a> CollectionMerger<'a> {
    pub fn new(scorer: &'a dyn SentimentScorer) -> Self {
        Self { scorer }
    }

    pub fn begin(&self, tables: &RowTables, asin: &str) -> Result<AsinMerge, MergeError> {
        if let Some(reason) = tables.integrity_issue(asin) {
            return Err(MergeError::CorruptStore {
                asin: asin.to_string(),
                reason,
            });
        }
        Ok(AsinMerge {
            asin: asin.to_string(),
            known: tables.known_reviews(asin),
            captured: tables
                .snapshots
                .iter()
                .filter(|s| s.asin == asin)
                .map(|s| s.captured_at)
                .collect(),
            reviews: Vec::new(),
            snapshots: Vec::new(),
        })
    }

    /// Adds the batch's unseen reviews and its snapshot to `merge`. A snapshot
    /// whose capture time is already stored is not written again, so replaying
    /// a batch changes nothing.
    pub fn merge_batch(
        &self,
        merge: &mut AsinMerge,
        batch: &ScrapeBatch,
    ) -> Result<BatchOutcome, MergeError> {
        let foreign = std::iter::once((batch.asin.as_str(), "-"))
            .chain(
                batch
                    .reviews
                    .iter()
                    .map(|r| (r.asin.as_str(), r.review_id.as_str())),
            )
            .find(|(asin, _)| *asin != merge.asin);
        if let Some((found, review_id)) = foreign {
            return Err(MergeError::AsinMismatch {
                expected: merge.asin.clone(),
                found: found.to_string(),
                review_id: review_id.to_string(),
            });
        }

        let mut new_reviews = 0u32;
        let mut duplicates_skipped = 0u32;
        for review in &batch.reviews {
            if !merge.known.remember(&review.review_id, review.review_date) {
                duplicates_skipped += 1;
                continue;
            }
            let mut review = review.clone();
            review.sentiment = self.score(&review);
            merge.reviews.push(review);
            new_reviews += 1;
        }

        let snapshot_written = merge.captured.insert(batch.snapshot.captured_at);
        if snapshot_written {
            let mut snapshot = batch.snapshot.clone();
            snapshot.new_reviews = new_reviews;
            snapshot.duplicates_skipped = duplicates_skipped;
            merge.snapshots.push(snapshot);
        } else {
            debug!(asin = %merge.asin, captured_at = %batch.captured_at, "snapshot already stored");
        }

        Ok(BatchOutcome {
            new_reviews,
            duplicates_skipped,
            snapshot_written,
            pages_visited: batch.snapshot.pages_visited,
            stopped_reason: batch.snapshot.stopped_reason.clone(),
        })
    }

    /// Scores stored reviews of `asin` that still lack a sentiment.
    pub fn backfill_sentiment(&self, tables: &mut RowTables, asin: &str) -> usize {
        let mut filled = 0;
        for review in tables
            .reviews
            .iter_mut()
            .filter(|r| r.asin == asin && r.sentiment.is_none())
        {
            review.sentiment = self.score(review);
            if review.sentiment.is_some() {
                filled += 1;
            }
        }
        filled
    }

    fn score(&self, review: &ReviewRecord) -> Option<f64> {
        match self.scorer.score(&review.text) {
            Ok(score) if score.is_finite() => Some(score.clamp(-1.0, 1.0)),
            Ok(score) => {
                warn!(asin = %review.asin, review_id = %review.review_id, score, "scorer returned a non-finite score");
                None
            }
            Err(err) => {
                warn!(asin = %review.asin, review_id = %review.review_id, error = %err, "sentiment scoring failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asintel_core::{LexiconScorer, ScoreError};
    use asintel_intake::parse_batch;

    struct FailingScorer;

    impl SentimentScorer for FailingScorer {
        fn score(&self, _text: &str) -> Result<f64, ScoreError> {
            Err(ScoreError::Unavailable("offline".into()))
        }
    }

    fn batch(captured_at: &str, ids: &[&str]) -> ScrapeBatch {
        let reviews: Vec<_> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "review_id": id, "review_date": "2025-01-02", "rating": 5, "text": "great"
                })
            })
            .collect();
        let json = serde_json::json!({
            "asin": "B001EXAMPLE",
            "captured_at": captured_at,
            "reviews": reviews,
            "snapshot": {"price": "$10.00", "pages_visited": 1, "stopped_reason": "no_new_on_page"}
        });
        parse_batch(json.to_string().as_bytes(), "test").unwrap()
    }

    fn merge_all(tables: &mut RowTables, merger: &CollectionMerger, b: &ScrapeBatch) -> BatchOutcome {
        let mut merge = merger.begin(tables, &b.asin).unwrap();
        let outcome = merger.merge_batch(&mut merge, b).unwrap();
        merge.commit(tables);
        outcome
    }

    #[test]
    fn second_run_skips_known_reviews() {
        let merger = CollectionMerger::new(&LexiconScorer);
        let mut tables = RowTables::default();

        let first = merge_all(&mut tables, &merger, &batch("2025-01-02T10:00:00Z", &["R1", "R2"]));
        assert_eq!((first.new_reviews, first.duplicates_skipped), (2, 0));

        let second = merge_all(&mut tables, &merger, &batch("2025-01-03T10:00:00Z", &["R2", "R3"]));
        assert_eq!((second.new_reviews, second.duplicates_skipped), (1, 1));

        let ids: Vec<_> = tables.reviews.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(ids, ["R1", "R2", "R3"]);
        assert_eq!(tables.snapshots[1].new_reviews, 1);
        assert_eq!(tables.snapshots[1].duplicates_skipped, 1);
        assert!(tables.reviews.iter().all(|r| r.sentiment.is_some()));
    }

    #[test]
    fn replaying_a_batch_is_idempotent() {
        let merger = CollectionMerger::new(&LexiconScorer);
        let mut tables = RowTables::default();
        let b = batch("2025-01-02T10:00:00Z", &["R1", "R1", "R2"]);

        let first = merge_all(&mut tables, &merger, &b);
        assert_eq!(first.duplicates_skipped, 1);
        let (reviews, snapshots) = (tables.reviews.clone(), tables.snapshots.clone());

        let again = merge_all(&mut tables, &merger, &b);
        assert!(!again.snapshot_written);
        assert_eq!(again.new_reviews, 0);
        assert_eq!(tables.reviews, reviews);
        assert_eq!(tables.snapshots, snapshots);
    }

    #[test]
    fn scorer_failure_keeps_the_review() {
        let merger = CollectionMerger::new(&FailingScorer);
        let mut tables = RowTables::default();
        merge_all(&mut tables, &merger, &batch("2025-01-02T10:00:00Z", &["R1"]));
        assert_eq!(tables.reviews.len(), 1);
        assert_eq!(tables.reviews[0].sentiment, None);

        let healthy = CollectionMerger::new(&LexiconScorer);
        assert_eq!(healthy.backfill_sentiment(&mut tables, "B001EXAMPLE"), 1);
        assert!(tables.reviews[0].sentiment.is_some());
    }

    #[test]
    fn mismatched_review_asin_rejects_the_batch() {
        let merger = CollectionMerger::new(&LexiconScorer);
        let tables = RowTables::default();
        let mut b = batch("2025-01-02T10:00:00Z", &["R1", "R2"]);
        b.reviews[1].asin = "B999".into();

        let mut merge = merger.begin(&tables, "B001EXAMPLE").unwrap();
        let err = merger.merge_batch(&mut merge, &b).unwrap_err();
        assert!(matches!(err, MergeError::AsinMismatch { .. }));
        assert!(merge.pending_reviews().is_empty());
    }

    #[test]
    fn corrupt_store_blocks_only_that_asin() {
        let merger = CollectionMerger::new(&LexiconScorer);
        let mut tables = RowTables::default();
        merge_all(&mut tables, &merger, &batch("2025-01-02T10:00:00Z", &["R1"]));
        let dup = tables.reviews[0].clone();
        tables.reviews.push(dup);

        assert!(matches!(
            merger.begin(&tables, "B001EXAMPLE"),
            Err(MergeError::CorruptStore { .. })
        ));
        assert!(merger.begin(&tables, "B002OTHER").is_ok());
    }
}
