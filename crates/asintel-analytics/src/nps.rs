//! Net promoter score from review stars: 5 promotes, 4 is passive, 1-3 detract.

use std::collections::BTreeMap;

use asintel_core::ReviewRecord;
use chrono::NaiveDate;
use serde::Serialize;

use crate::policy::NpsPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NpsSummary {
    pub asin: String,
    pub n_reviews: usize,
    pub promoter_pct: Option<f64>,
    pub passive_pct: Option<f64>,
    pub detractor_pct: Option<f64>,
    pub nps: Option<f64>,
    /// Latest review date that went into the score.
    pub date_captured: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NpsDaily {
    pub asin: String,
    pub date: NaiveDate,
    pub promoter_cnt: u32,
    pub passive_cnt: u32,
    pub detractor_cnt: u32,
    pub n_reviews: u32,
    pub nps_daily: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NpsRolling {
    pub asin: String,
    pub date: NaiveDate,
    pub nps_7d: Option<f64>,
    pub nps_28d: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    promoters: u32,
    passives: u32,
    detractors: u32,
}

impl Counts {
    fn add(&mut self, stars: u8) {
        match stars {
            5 => self.promoters += 1,
            4 => self.passives += 1,
            1..=3 => self.detractors += 1,
            _ => {}
        }
    }

    fn total(&self) -> u32 {
        self.promoters + self.passives + self.detractors
    }

    fn score(&self) -> Option<f64> {
        let n = self.total();
        (n > 0).then(|| (f64::from(self.promoters) - f64::from(self.detractors)) * 100.0 / f64::from(n))
    }
}

fn pct(part: u32, total: u32) -> f64 {
    f64::from(part) * 100.0 / f64::from(total)
}

/// Scores stay empty below the policy's minimum number of rated reviews.
pub fn nps_summary(asin: &str, reviews: &[ReviewRecord], policy: &NpsPolicy) -> NpsSummary {
    let mut counts = Counts::default();
    let mut latest = None;
    for review in reviews {
        if let Some(stars) = review.rating {
            counts.add(stars);
            latest = latest.max(review.review_date);
        }
    }
    let n = counts.total();
    let enough = n > 0 && n as usize >= policy.min_reviews;
    NpsSummary {
        asin: asin.to_string(),
        n_reviews: n as usize,
        promoter_pct: enough.then(|| pct(counts.promoters, n)),
        passive_pct: enough.then(|| pct(counts.passives, n)),
        detractor_pct: enough.then(|| pct(counts.detractors, n)),
        nps: if enough { counts.score() } else { None },
        date_captured: latest,
    }
}

/// One row per grid date.
pub fn nps_daily(asin: &str, reviews: &[ReviewRecord], grid: &[NaiveDate]) -> Vec<NpsDaily> {
    let mut by_day: BTreeMap<NaiveDate, Counts> = BTreeMap::new();
    for review in reviews {
        if let (Some(date), Some(stars)) = (review.review_date, review.rating) {
            by_day.entry(date).or_default().add(stars);
        }
    }
    grid.iter()
        .map(|date| {
            let c = by_day.get(date).copied().unwrap_or_default();
            NpsDaily {
                asin: asin.to_string(),
                date: *date,
                promoter_cnt: c.promoters,
                passive_cnt: c.passives,
                detractor_cnt: c.detractors,
                n_reviews: c.total(),
                nps_daily: c.score(),
            }
        })
        .collect()
}

/// Trailing sums over the dense daily rows; a window needs `min_days` days of
/// history and at least one rated review.
pub fn nps_rolling(daily: &[NpsDaily], policy: &NpsPolicy) -> Vec<NpsRolling> {
    let window_score = |idx: usize, window: usize, min_days: usize| {
        let start = (idx + 1).saturating_sub(window);
        let days = &daily[start..=idx];
        if days.len() < min_days {
            return None;
        }
        let counts = days.iter().fold(Counts::default(), |mut acc, d| {
            acc.promoters += d.promoter_cnt;
            acc.passives += d.passive_cnt;
            acc.detractors += d.detractor_cnt;
            acc
        });
        counts.score()
    };
    daily
        .iter()
        .enumerate()
        .map(|(idx, row)| NpsRolling {
            asin: row.asin.clone(),
            date: row.date,
            nps_7d: window_score(idx, 7, policy.rolling_7d_min_days),
            nps_28d: window_score(idx, 28, policy.rolling_28d_min_days),
        })
        .collect()
}
