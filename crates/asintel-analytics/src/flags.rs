//! Heuristic authenticity flags, computed per ASIN over that ASIN's reviews only.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use asintel_core::ReviewRecord;
use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::policy::AuthenticityPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlag {
    Short,
    Long,
    Duplicate,
    VolumeSpike,
    HyperactiveAuthor,
}

impl AuthFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
            Self::Duplicate => "duplicate",
            Self::VolumeSpike => "volume_spike",
            Self::HyperactiveAuthor => "hyperactive_author",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagRow {
    pub asin: String,
    pub review_id: String,
    pub review_date: Option<NaiveDate>,
    pub text_length: usize,
    pub flag: AuthFlag,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlagSummary {
    pub asin: String,
    pub n_reviews: usize,
    pub flagged_reviews: usize,
    pub short: usize,
    pub long: usize,
    pub duplicate: usize,
    pub volume_spike: usize,
    pub hyperactive_author: usize,
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

fn normalized_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn flag_reviews(
    asin: &str,
    reviews: &[ReviewRecord],
    policy: &AuthenticityPolicy,
) -> (Vec<FlagRow>, FlagSummary) {
    let lengths: Vec<usize> = reviews.iter().map(ReviewRecord::text_length).collect();
    let mut nonzero: Vec<f64> = lengths.iter().filter(|l| **l > 0).map(|l| *l as f64).collect();
    nonzero.sort_by(f64::total_cmp);
    let short_cut = percentile(&nonzero, policy.short_percentile)
        .unwrap_or(policy.fallback_short_len as f64);
    let long_cut =
        percentile(&nonzero, policy.long_percentile).unwrap_or(policy.fallback_long_len as f64);

    let mut text_counts: HashMap<String, usize> = HashMap::new();
    for review in reviews {
        let key = normalized_text(&review.text);
        if !key.is_empty() {
            *text_counts.entry(key).or_default() += 1;
        }
    }

    let spike_days = volume_spike_days(reviews, policy);
    let hyperactive = hyperactive_reviews(reviews, policy);

    let mut rows = Vec::new();
    let mut summary = FlagSummary {
        asin: asin.to_string(),
        n_reviews: reviews.len(),
        ..Default::default()
    };
    for (idx, review) in reviews.iter().enumerate() {
        let length = lengths[idx];
        let mut flags = Vec::new();
        if (length as f64) < short_cut {
            flags.push(AuthFlag::Short);
        }
        if (length as f64) > long_cut {
            flags.push(AuthFlag::Long);
        }
        let key = normalized_text(&review.text);
        if !key.is_empty() && text_counts.get(&key).copied().unwrap_or(0) > 1 {
            flags.push(AuthFlag::Duplicate);
        }
        if review.review_date.is_some_and(|d| spike_days.contains(&d)) {
            flags.push(AuthFlag::VolumeSpike);
        }
        if hyperactive.contains(&idx) {
            flags.push(AuthFlag::HyperactiveAuthor);
        }

        if !flags.is_empty() {
            summary.flagged_reviews += 1;
        }
        for flag in flags {
            match flag {
                AuthFlag::Short => summary.short += 1,
                AuthFlag::Long => summary.long += 1,
                AuthFlag::Duplicate => summary.duplicate += 1,
                AuthFlag::VolumeSpike => summary.volume_spike += 1,
                AuthFlag::HyperactiveAuthor => summary.hyperactive_author += 1,
            }
            rows.push(FlagRow {
                asin: asin.to_string(),
                review_id: review.review_id.clone(),
                review_date: review.review_date,
                text_length: length,
                flag,
            });
        }
    }
    (rows, summary)
}

/// Days whose review count reaches the minimum and exceeds the multiplier times
/// the mean daily count of the preceding baseline days. Baseline days before the
/// ASIN's first review date do not exist; a day with no baseline is never a spike.
fn volume_spike_days(reviews: &[ReviewRecord], policy: &AuthenticityPolicy) -> BTreeSet<NaiveDate> {
    let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for date in reviews.iter().filter_map(|r| r.review_date) {
        *per_day.entry(date).or_default() += 1;
    }
    let Some(first) = per_day.keys().next().copied() else {
        return BTreeSet::new();
    };

    per_day
        .iter()
        .filter(|(date, count)| {
            if **count < policy.volume_spike_min_reviews {
                return false;
            }
            let start = (**date - Duration::days(policy.volume_baseline_days)).max(first);
            let baseline_days = (**date - start).num_days();
            if baseline_days <= 0 {
                return false;
            }
            let baseline: usize = per_day.range(start..**date).map(|(_, c)| *c).sum();
            let mean = baseline as f64 / baseline_days as f64;
            **count as f64 > policy.volume_spike_multiplier * mean
        })
        .map(|(date, _)| *date)
        .collect()
}

/// Indices of reviews whose author wrote more than the allowed number of reviews
/// on this ASIN within the window around the review's date.
fn hyperactive_reviews(reviews: &[ReviewRecord], policy: &AuthenticityPolicy) -> BTreeSet<usize> {
    let mut by_author: HashMap<&str, Vec<(usize, NaiveDate)>> = HashMap::new();
    for (idx, review) in reviews.iter().enumerate() {
        if let (Some(author), Some(date)) = (review.author.as_deref(), review.review_date) {
            by_author.entry(author).or_default().push((idx, date));
        }
    }

    let span = policy.hyperactive_window_days.max(1);
    let mut flagged = BTreeSet::new();
    for entries in by_author.values() {
        for (idx, date) in entries {
            let nearby = entries
                .iter()
                .filter(|(_, other)| (*other - *date).num_days().abs() < span)
                .count();
            if nearby > policy.hyperactive_max_reviews {
                flagged.insert(*idx);
            }
        }
    }
    flagged
}
