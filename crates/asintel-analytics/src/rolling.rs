//! Trailing calendar-window means over the dense daily grid.

use chrono::NaiveDate;
use serde::Serialize;

use crate::densify::DailyMetric;

pub const SMOOTHING_DAYS: usize = 3;
pub const ROLLING_WINDOWS: [usize; 2] = [7, 28];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingMetric {
    pub asin: String,
    pub date: NaiveDate,
    pub window_days: usize,
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub bsr: Option<f64>,
    pub review_count: Option<f64>,
    pub avg_sentiment: Option<f64>,
}

/// Mean of the present values among the `window` entries ending at `idx`.
/// Partial windows at the start use what exists.
pub fn trailing_mean(values: &[Option<f64>], idx: usize, window: usize) -> Option<f64> {
    if window == 0 || idx >= values.len() {
        return None;
    }
    let start = (idx + 1).saturating_sub(window);
    let (sum, n) = values[start..=idx]
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

struct Columns {
    price: Vec<Option<f64>>,
    rating: Vec<Option<f64>>,
    bsr: Vec<Option<f64>>,
    review_count: Vec<Option<f64>>,
    avg_sentiment: Vec<Option<f64>>,
}

impl Columns {
    fn of(daily: &[DailyMetric]) -> Self {
        Self {
            price: daily.iter().map(|d| d.price).collect(),
            rating: daily.iter().map(|d| d.rating).collect(),
            bsr: daily.iter().map(|d| d.bsr.map(|b| b as f64)).collect(),
            review_count: daily.iter().map(|d| Some(f64::from(d.review_count))).collect(),
            avg_sentiment: daily.iter().map(|d| d.avg_sentiment).collect(),
        }
    }
}

/// Fills the `*_3d` columns. `daily` must be one ASIN's dense, date-ordered grid.
pub fn apply_smoothing(daily: &mut [DailyMetric]) {
    let cols = Columns::of(daily);
    for (idx, row) in daily.iter_mut().enumerate() {
        row.price_3d = trailing_mean(&cols.price, idx, SMOOTHING_DAYS);
        row.rating_3d = trailing_mean(&cols.rating, idx, SMOOTHING_DAYS);
        row.bsr_3d = trailing_mean(&cols.bsr, idx, SMOOTHING_DAYS);
        row.review_count_3d = trailing_mean(&cols.review_count, idx, SMOOTHING_DAYS);
        row.avg_sentiment_3d = trailing_mean(&cols.avg_sentiment, idx, SMOOTHING_DAYS);
    }
}

pub fn rolling(daily: &[DailyMetric], window: usize) -> Vec<RollingMetric> {
    let cols = Columns::of(daily);
    daily
        .iter()
        .enumerate()
        .map(|(idx, row)| RollingMetric {
            asin: row.asin.clone(),
            date: row.date,
            window_days: window,
            price: trailing_mean(&cols.price, idx, window),
            rating: trailing_mean(&cols.rating, idx, window),
            bsr: trailing_mean(&cols.bsr, idx, window),
            review_count: trailing_mean(&cols.review_count, idx, window),
            avg_sentiment: trailing_mean(&cols.avg_sentiment, idx, window),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(d: u32, price: Option<f64>, sentiment: Option<f64>) -> DailyMetric {
        DailyMetric {
            asin: "B1".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, d).unwrap(),
            price,
            price_hidden: Some(price.is_none()),
            rating: None,
            total_reviews: None,
            bsr: Some(u64::from(d) * 10),
            new_reviews: 0,
            review_count: u32::from(sentiment.is_some()),
            avg_sentiment: sentiment,
            pos_cnt: 0,
            neut_cnt: 0,
            neg_cnt: 0,
            price_3d: None,
            rating_3d: None,
            bsr_3d: None,
            review_count_3d: None,
            avg_sentiment_3d: None,
        }
    }

    #[test]
    fn partial_windows_average_available_days() {
        let values = [Some(2.0), Some(4.0), Some(6.0), Some(8.0)];
        assert_eq!(trailing_mean(&values, 0, 7), Some(2.0));
        assert_eq!(trailing_mean(&values, 1, 7), Some(3.0));
        assert_eq!(trailing_mean(&values, 3, 3), Some(6.0));
    }

    #[test]
    fn missing_values_are_excluded_not_zeroed() {
        let values = [Some(2.0), None, Some(4.0)];
        assert_eq!(trailing_mean(&values, 2, 3), Some(3.0));
        assert_eq!(trailing_mean(&[None, None], 1, 3), None);
    }

    #[test]
    fn smoothing_fills_three_day_columns() {
        let mut daily = vec![
            row(1, Some(10.0), Some(0.3)),
            row(2, None, None),
            row(3, Some(13.0), Some(-0.3)),
            row(4, Some(16.0), None),
        ];
        apply_smoothing(&mut daily);
        assert_eq!(daily[0].price_3d, Some(10.0));
        assert_eq!(daily[1].price_3d, Some(10.0));
        assert_eq!(daily[2].price_3d, Some(11.5));
        assert_eq!(daily[3].price_3d, Some(14.5));
        assert_eq!(daily[1].avg_sentiment_3d, Some(0.3));
        assert_eq!(daily[3].avg_sentiment_3d, Some(-0.3));
        assert_eq!(daily[2].bsr_3d, Some(20.0));
        assert_eq!(daily[1].review_count_3d, Some(0.5));
    }

    #[test]
    fn rolling_rows_match_grid_and_stay_in_bounds() {
        let daily: Vec<_> = (1..=10).map(|d| row(d, Some(f64::from(d)), None)).collect();
        let rows = rolling(&daily, 7);
        assert_eq!(rows.len(), daily.len());
        assert_eq!(rows[0].price, Some(1.0));
        assert_eq!(rows[6].price, Some(4.0));
        assert_eq!(rows[9].price, Some(7.0));
        assert!(rows.iter().all(|r| r.avg_sentiment.is_none()));
        assert!(rows.iter().all(|r| r.window_days == 7));
    }
}
