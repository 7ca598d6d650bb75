//! Expands sparse snapshots and reviews onto one row per ASIN per calendar day.

use std::collections::BTreeMap;

use asintel_core::{ReviewRecord, SnapshotRecord};
use chrono::NaiveDate;
use serde::Serialize;

use crate::policy::SentimentPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetric {
    pub asin: String,
    pub date: NaiveDate,
    pub price: Option<f64>,
    /// `None` on days before the first snapshot.
    pub price_hidden: Option<bool>,
    pub rating: Option<f64>,
    pub total_reviews: Option<u64>,
    pub bsr: Option<u64>,
    pub new_reviews: u32,
    pub review_count: u32,
    pub avg_sentiment: Option<f64>,
    pub pos_cnt: u32,
    pub neut_cnt: u32,
    pub neg_cnt: u32,
    pub price_3d: Option<f64>,
    pub rating_3d: Option<f64>,
    pub bsr_3d: Option<f64>,
    pub review_count_3d: Option<f64>,
    pub avg_sentiment_3d: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentDaily {
    pub asin: String,
    pub date: NaiveDate,
    pub review_count: u32,
    pub avg_sentiment: Option<f64>,
    pub pos_cnt: u32,
    pub neut_cnt: u32,
    pub neg_cnt: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct DayReviews {
    count: u32,
    scored: u32,
    sum: f64,
    pos: u32,
    neut: u32,
    neg: u32,
}

impl DayReviews {
    fn avg(&self) -> Option<f64> {
        (self.scored > 0).then(|| self.sum / f64::from(self.scored))
    }
}

/// Inclusive calendar span.
pub fn date_span(first: NaiveDate, last: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    first.iter_days().take_while(move |d| *d <= last)
}

/// Sparse per-day sentiment: only dates that have at least one review.
pub fn sentiment_daily(
    asin: &str,
    reviews: &[ReviewRecord],
    policy: &SentimentPolicy,
) -> Vec<SentimentDaily> {
    reviews_by_day(reviews, policy)
        .into_iter()
        .map(|(date, day)| SentimentDaily {
            asin: asin.to_string(),
            date,
            review_count: day.count,
            avg_sentiment: day.avg(),
            pos_cnt: day.pos,
            neut_cnt: day.neut,
            neg_cnt: day.neg,
        })
        .collect()
}

/// One row per date from the earliest to the latest snapshot or review date.
/// Snapshot fields carry forward from the latest snapshot at or before the
/// date and stay empty before the first one. Smoothed `*_3d` columns are left
/// empty.
pub fn densify(
    asin: &str,
    reviews: &[ReviewRecord],
    snapshots: &[SnapshotRecord],
    policy: &SentimentPolicy,
) -> Vec<DailyMetric> {
    let mut snapshots: Vec<&SnapshotRecord> = snapshots.iter().collect();
    snapshots.sort_by_key(|s| s.captured_at);

    let by_day = reviews_by_day(reviews, policy);
    let dates = snapshots
        .iter()
        .map(|s| s.capture_date())
        .chain(by_day.keys().copied());
    let span = dates.fold(None::<(NaiveDate, NaiveDate)>, |span, d| match span {
        Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
        None => Some((d, d)),
    });
    let Some((first, last)) = span else {
        return Vec::new();
    };

    let mut new_reviews: BTreeMap<NaiveDate, u32> = BTreeMap::new();
    for snap in &snapshots {
        *new_reviews.entry(snap.capture_date()).or_default() += snap.new_reviews;
    }

    let mut rows = Vec::new();
    let mut next = 0;
    let mut current: Option<&SnapshotRecord> = None;
    for date in date_span(first, last) {
        while next < snapshots.len() && snapshots[next].capture_date() <= date {
            current = Some(snapshots[next]);
            next += 1;
        }
        let day = by_day.get(&date).copied().unwrap_or_default();
        rows.push(DailyMetric {
            asin: asin.to_string(),
            date,
            price: current.and_then(|s| s.price),
            price_hidden: current.map(|s| s.price_hidden),
            rating: current.and_then(|s| s.rating),
            total_reviews: current.and_then(|s| s.total_reviews),
            bsr: current.and_then(|s| s.bsr),
            new_reviews: new_reviews.get(&date).copied().unwrap_or(0),
            review_count: day.count,
            avg_sentiment: day.avg(),
            pos_cnt: day.pos,
            neut_cnt: day.neut,
            neg_cnt: day.neg,
            price_3d: None,
            rating_3d: None,
            bsr_3d: None,
            review_count_3d: None,
            avg_sentiment_3d: None,
        });
    }
    rows
}

fn reviews_by_day(
    reviews: &[ReviewRecord],
    policy: &SentimentPolicy,
) -> BTreeMap<NaiveDate, DayReviews> {
    let cut = policy.label_threshold;
    let mut by_day: BTreeMap<NaiveDate, DayReviews> = BTreeMap::new();
    for review in reviews {
        let Some(date) = review.review_date else {
            continue;
        };
        let day = by_day.entry(date).or_default();
        day.count += 1;
        if let Some(score) = review.sentiment {
            day.scored += 1;
            day.sum += score;
            if score >= cut {
                day.pos += 1;
            } else if score <= -cut {
                day.neg += 1;
            } else {
                day.neut += 1;
            }
        }
    }
    by_day
}
