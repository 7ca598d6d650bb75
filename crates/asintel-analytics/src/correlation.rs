//! Windowed Spearman correlations between sentiment/rating and price/rank,
//! with half-window stability and 7-day alerts.

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::densify::DailyMetric;
use crate::policy::{AlertPolicy, CorrelationPolicy};
use crate::stats::{spearman, SignificanceTest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Smoothing {
    Raw,
    Sm3d,
}

impl Smoothing {
    pub const ALL: [Smoothing; 2] = [Smoothing::Raw, Smoothing::Sm3d];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Sm3d => "sm3d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricPair {
    SentimentPrice,
    SentimentRank,
    RatingPrice,
    RatingRank,
}

impl MetricPair {
    pub const ALL: [MetricPair; 4] = [
        MetricPair::SentimentPrice,
        MetricPair::SentimentRank,
        MetricPair::RatingPrice,
        MetricPair::RatingRank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SentimentPrice => "sentiment_price",
            Self::SentimentRank => "sentiment_rank",
            Self::RatingPrice => "rating_price",
            Self::RatingRank => "rating_rank",
        }
    }

    /// Rank is `-bsr`, so a positive coefficient means a better rank.
    fn values(&self, row: &DailyMetric, smoothing: Smoothing) -> (Option<f64>, Option<f64>) {
        let (sentiment, rating, price, bsr) = match smoothing {
            Smoothing::Raw => (
                row.avg_sentiment,
                row.rating,
                row.price,
                row.bsr.map(|b| b as f64),
            ),
            Smoothing::Sm3d => (
                row.avg_sentiment_3d,
                row.rating_3d,
                row.price_3d,
                row.bsr_3d,
            ),
        };
        let rank = bsr.map(|b| -b);
        match self {
            Self::SentimentPrice => (sentiment, price),
            Self::SentimentRank => (sentiment, rank),
            Self::RatingPrice => (rating, price),
            Self::RatingRank => (rating, rank),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationRow {
    pub asin: String,
    pub smoothing: Smoothing,
    pub window_days: i64,
    pub pair: MetricPair,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub n_obs: usize,
    pub r: Option<f64>,
    pub p: Option<f64>,
    pub first_half_r: Option<f64>,
    pub second_half_r: Option<f64>,
    pub stable: bool,
    pub sig: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationAlert {
    pub asin: String,
    pub date: NaiveDate,
    pub smoothing: Smoothing,
    pub pair: MetricPair,
    pub r: f64,
    pub p: f64,
    pub n_obs: usize,
    pub stable: bool,
    pub severity: f64,
    pub tier: String,
}

pub struct CorrelationEngine<'a> {
    policy: &'a CorrelationPolicy,
    test: &'a dyn SignificanceTest,
}

impl<'a> CorrelationEngine<'a> {
    pub fn new(policy: &'a CorrelationPolicy, test: &'a dyn SignificanceTest) -> Self {
        Self { policy, test }
    }

    /// Rows for every smoothing × window × pair. `daily` is one ASIN's dense grid.
    pub fn correlate(&self, asin: &str, daily: &[DailyMetric]) -> Vec<CorrelationRow> {
        let mut rows = Vec::new();
        for smoothing in Smoothing::ALL {
            for window in &self.policy.windows {
                for pair in MetricPair::ALL {
                    if let Some(row) = self.window_row(asin, daily, smoothing, *window, pair) {
                        rows.push(row);
                    }
                }
            }
        }
        rows
    }

    pub fn alerts(&self, asin: &str, daily: &[DailyMetric]) -> Vec<CorrelationAlert> {
        let alerts = &self.policy.alerts;
        let mut out = Vec::new();
        for smoothing in Smoothing::ALL {
            for pair in MetricPair::ALL {
                let Some(row) = self.window_row(asin, daily, smoothing, alerts.window_days, pair)
                else {
                    continue;
                };
                if let Some(alert) = alert_for(&row, alerts) {
                    out.push(alert);
                }
            }
        }
        out
    }

    fn window_row(
        &self,
        asin: &str,
        daily: &[DailyMetric],
        smoothing: Smoothing,
        window: i64,
        pair: MetricPair,
    ) -> Option<CorrelationRow> {
        let window_end = daily.iter().map(|d| d.date).max()?;
        let window_start = window_end - Duration::days(window.max(1) - 1);

        let mut samples: Vec<(NaiveDate, f64, f64)> = daily
            .iter()
            .filter(|d| d.date >= window_start && d.date <= window_end)
            .filter_map(|d| match pair.values(d, smoothing) {
                (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some((d.date, x, y)),
                _ => None,
            })
            .collect();
        samples.sort_by_key(|s| s.0);

        let n_obs = samples.len();
        let mut row = CorrelationRow {
            asin: asin.to_string(),
            smoothing,
            window_days: window,
            pair,
            window_start,
            window_end,
            n_obs,
            r: None,
            p: None,
            first_half_r: None,
            second_half_r: None,
            stable: false,
            sig: false,
        };
        if n_obs < self.policy.min_obs {
            return Some(row);
        }

        row.r = coefficient(&samples);
        row.p = row.r.and_then(|r| self.test.two_sided_p(r, n_obs));
        row.sig = row.p.is_some_and(|p| p < self.policy.significance_level);

        let (earlier, later) = samples.split_at(n_obs / 2);
        let half_r = |half: &[(NaiveDate, f64, f64)]| {
            (half.len() >= self.policy.min_half_obs)
                .then(|| coefficient(half))
                .flatten()
        };
        row.first_half_r = half_r(earlier);
        row.second_half_r = half_r(later);
        row.stable = is_stable(
            row.first_half_r,
            row.second_half_r,
            self.policy.stability_min_abs_r,
        );
        Some(row)
    }
}

fn coefficient(samples: &[(NaiveDate, f64, f64)]) -> Option<f64> {
    let x: Vec<f64> = samples.iter().map(|s| s.1).collect();
    let y: Vec<f64> = samples.iter().map(|s| s.2).collect();
    spearman(&x, &y)
}

/// Both halves exist, share a sign, and each reaches the minimum magnitude.
pub fn is_stable(first: Option<f64>, second: Option<f64>, min_abs_r: f64) -> bool {
    match (first, second) {
        (Some(a), Some(b)) => {
            a.signum() == b.signum() && a != 0.0 && a.abs() >= min_abs_r && b.abs() >= min_abs_r
        }
        _ => false,
    }
}

/// Severity is `|r| * (1 - p)`; a row without a p-value never alerts.
fn alert_for(row: &CorrelationRow, policy: &AlertPolicy) -> Option<CorrelationAlert> {
    let r = row.r?;
    let p = row.p?;
    if r.abs() < policy.min_abs_r || p >= policy.max_p || row.n_obs < policy.min_obs || !row.stable
    {
        return None;
    }
    Some(CorrelationAlert {
        asin: row.asin.clone(),
        date: row.window_end,
        smoothing: row.smoothing,
        pair: row.pair,
        r,
        p,
        n_obs: row.n_obs,
        stable: row.stable,
        severity: r.abs() * (1.0 - p),
        tier: policy.tier_for(r.abs(), p).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NoPValue;

    fn grid(prices: &[Option<f64>], sentiments: &[Option<f64>]) -> Vec<DailyMetric> {
        let start = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        prices
            .iter()
            .zip(sentiments)
            .enumerate()
            .map(|(i, (price, sentiment))| DailyMetric {
                asin: "B1".into(),
                date: start + Duration::days(i as i64),
                price: *price,
                price_hidden: Some(price.is_none()),
                rating: Some(4.0),
                total_reviews: None,
                bsr: Some(100 + i as u64),
                new_reviews: 0,
                review_count: u32::from(sentiment.is_some()),
                avg_sentiment: *sentiment,
                pos_cnt: 0,
                neut_cnt: 0,
                neg_cnt: 0,
                price_3d: *price,
                rating_3d: Some(4.0),
                bsr_3d: Some(100.0 + i as f64),
                review_count_3d: None,
                avg_sentiment_3d: *sentiment,
            })
            .collect()
    }

    fn find(rows: &[CorrelationRow], window: i64, pair: MetricPair) -> &CorrelationRow {
        rows.iter()
            .find(|r| r.window_days == window && r.pair == pair && r.smoothing == Smoothing::Raw)
            .unwrap()
    }

    #[test]
    fn constant_series_yield_missing_coefficients() {
        let prices: Vec<_> = (0..10).map(|i| Some(10.0 + i as f64)).collect();
        let sentiments: Vec<_> = (0..10).map(|i| Some(0.1 * i as f64)).collect();
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        let rows = CorrelationEngine::new(&policy, &NoPValue).correlate("B1", &daily);

        assert_eq!(rows.len(), 2 * 3 * 4);
        let rating_price = find(&rows, 28, MetricPair::RatingPrice);
        assert_eq!(rating_price.n_obs, 10);
        assert_eq!(rating_price.r, None);
        let sentiment_price = find(&rows, 28, MetricPair::SentimentPrice);
        assert_eq!(sentiment_price.r, Some(1.0));
        assert_eq!(sentiment_price.p, None);
        assert!(sentiment_price.stable);
    }

    #[test]
    fn too_few_pairs_leave_the_row_empty() {
        let prices = [Some(1.0), None, Some(3.0), None, Some(5.0), Some(6.0)];
        let sentiments = [Some(0.1), Some(0.2), Some(0.3), Some(0.4), None, Some(0.6)];
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        let rows = CorrelationEngine::new(&policy, &NoPValue).correlate("B1", &daily);
        let row = find(&rows, 7, MetricPair::SentimentPrice);
        assert_eq!(row.n_obs, 3);
        assert_eq!(row.r, None);
        assert!(!row.stable);
        assert_eq!(row.window_start, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    }

    #[test]
    fn windows_end_on_the_last_grid_date() {
        let prices: Vec<_> = (0..40).map(|i| Some(i as f64)).collect();
        let sentiments = vec![Some(0.5); 40];
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        let rows = CorrelationEngine::new(&policy, &NoPValue).correlate("B1", &daily);
        let row = find(&rows, 7, MetricPair::RatingRank);
        assert_eq!(row.window_end, NaiveDate::from_ymd_opt(2025, 4, 9).unwrap());
        assert_eq!(row.window_start, NaiveDate::from_ymd_opt(2025, 4, 3).unwrap());
        assert_eq!(row.n_obs, 7);
        assert_eq!(find(&rows, 90, MetricPair::RatingRank).n_obs, 40);
    }

    #[test]
    fn opposite_halves_are_not_stable() {
        assert!(!is_stable(Some(0.8), Some(-0.8), 0.4));
        assert!(is_stable(Some(0.8), Some(0.5), 0.4));
        assert!(!is_stable(Some(0.8), Some(0.3), 0.4));
        assert!(!is_stable(Some(0.8), None, 0.4));
    }

    #[test]
    fn sign_flip_between_halves_marks_row_unstable() {
        let prices: Vec<_> = (1..=10).map(|i| Some(i as f64)).collect();
        let sentiments: Vec<_> = [0.1, 0.2, 0.3, 0.4, 0.5, 0.9, 0.8, 0.7, 0.6, 0.55]
            .into_iter()
            .map(Some)
            .collect();
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        let rows = CorrelationEngine::new(&policy, &NoPValue).correlate("B1", &daily);

        let row = find(&rows, 28, MetricPair::SentimentPrice);
        assert_eq!(row.n_obs, 10);
        assert!(row.first_half_r.unwrap() > 0.99);
        assert!(row.second_half_r.unwrap() < -0.99);
        assert!(!row.stable);
    }

    #[test]
    fn alerts_need_a_p_value() {
        let prices: Vec<_> = (0..7).map(|i| Some(10.0 + i as f64)).collect();
        let sentiments: Vec<_> = (0..7).map(|i| Some(0.1 * i as f64)).collect();
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        assert!(CorrelationEngine::new(&policy, &NoPValue)
            .alerts("B1", &daily)
            .is_empty());
    }

    #[cfg(feature = "exact-stats")]
    #[test]
    fn strong_stable_weekly_signal_alerts() {
        use crate::stats::StudentT;

        let prices: Vec<_> = (0..7).map(|i| Some(10.0 + i as f64)).collect();
        let sentiments: Vec<_> = (0..7).map(|i| Some(0.1 * i as f64)).collect();
        let daily = grid(&prices, &sentiments);
        let policy = CorrelationPolicy::default();
        let alerts = CorrelationEngine::new(&policy, &StudentT).alerts("B1", &daily);

        let alert = alerts
            .iter()
            .find(|a| a.pair == MetricPair::SentimentPrice && a.smoothing == Smoothing::Raw)
            .expect("sentiment/price alert");
        assert_eq!(alert.r, 1.0);
        assert_eq!(alert.p, 0.0);
        assert_eq!(alert.severity, 1.0);
        assert_eq!(alert.tier, "high");
        assert_eq!(alert.date, NaiveDate::from_ymd_opt(2025, 3, 7).unwrap());
    }
}
