//! Time-series analytics over a collection's stored reviews and snapshots.
//!
//! Everything here is pure: each ASIN's tables are derived from that ASIN's
//! rows alone and regenerated in full on every run.

use asintel_core::{ReviewRecord, SnapshotRecord};
use tracing::debug;

pub mod correlation;
pub mod densify;
pub mod flags;
pub mod nps;
pub mod policy;
pub mod rolling;
pub mod stats;

pub use correlation::{CorrelationAlert, CorrelationEngine, CorrelationRow, MetricPair, Smoothing};
pub use densify::{DailyMetric, SentimentDaily};
pub use flags::{AuthFlag, FlagRow, FlagSummary};
pub use nps::{NpsDaily, NpsRolling, NpsSummary};
pub use policy::AnalyticsPolicy;
pub use rolling::RollingMetric;
pub use stats::{default_significance, NoPValue, SignificanceTest};

#[cfg(feature = "exact-stats")]
pub use stats::StudentT;

/// Every derived table for one ASIN, or for a whole collection once merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsTables {
    pub sentiment_daily: Vec<SentimentDaily>,
    pub metrics_daily: Vec<DailyMetric>,
    pub rolling_7d: Vec<RollingMetric>,
    pub rolling_28d: Vec<RollingMetric>,
    pub flags_detail: Vec<FlagRow>,
    pub flags_summary: Vec<FlagSummary>,
    pub nps_by_asin: Vec<NpsSummary>,
    pub nps_daily: Vec<NpsDaily>,
    pub nps_rolling: Vec<NpsRolling>,
    pub correlations: Vec<CorrelationRow>,
    pub alerts: Vec<CorrelationAlert>,
}

impl AnalyticsTables {
    pub fn extend(&mut self, other: AnalyticsTables) {
        self.sentiment_daily.extend(other.sentiment_daily);
        self.metrics_daily.extend(other.metrics_daily);
        self.rolling_7d.extend(other.rolling_7d);
        self.rolling_28d.extend(other.rolling_28d);
        self.flags_detail.extend(other.flags_detail);
        self.flags_summary.extend(other.flags_summary);
        self.nps_by_asin.extend(other.nps_by_asin);
        self.nps_daily.extend(other.nps_daily);
        self.nps_rolling.extend(other.nps_rolling);
        self.correlations.extend(other.correlations);
        self.alerts.extend(other.alerts);
    }

    /// Deterministic order regardless of which worker finished first.
    pub fn sort(&mut self) {
        self.sentiment_daily
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.metrics_daily
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.rolling_7d
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.rolling_28d
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.flags_detail.sort_by(|a, b| {
            (&a.asin, &a.review_id, a.flag).cmp(&(&b.asin, &b.review_id, b.flag))
        });
        self.flags_summary.sort_by(|a, b| a.asin.cmp(&b.asin));
        self.nps_by_asin.sort_by(|a, b| a.asin.cmp(&b.asin));
        self.nps_daily
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.nps_rolling
            .sort_by(|a, b| (&a.asin, a.date).cmp(&(&b.asin, b.date)));
        self.correlations.sort_by(|a, b| {
            (&a.asin, a.smoothing, a.window_days, a.pair)
                .cmp(&(&b.asin, b.smoothing, b.window_days, b.pair))
        });
        self.alerts.sort_by(|a, b| {
            (&a.asin, a.smoothing, a.pair).cmp(&(&b.asin, b.smoothing, b.pair))
        });
    }
}

/// Derives every table for a single ASIN. `reviews` and `snapshots` must
/// already be filtered to that ASIN.
pub fn analyze_asin(
    asin: &str,
    reviews: &[ReviewRecord],
    snapshots: &[SnapshotRecord],
    policy: &AnalyticsPolicy,
    significance: &dyn SignificanceTest,
) -> AnalyticsTables {
    let mut daily = densify::densify(asin, reviews, snapshots, &policy.sentiment);
    rolling::apply_smoothing(&mut daily);

    let grid: Vec<_> = daily.iter().map(|d| d.date).collect();
    let nps_daily = nps::nps_daily(asin, reviews, &grid);
    let nps_rolling = nps::nps_rolling(&nps_daily, &policy.nps);
    let (flags_detail, flag_summary) = flags::flag_reviews(asin, reviews, &policy.authenticity);

    let engine = CorrelationEngine::new(&policy.correlation, significance);
    let correlations = engine.correlate(asin, &daily);
    let alerts = engine.alerts(asin, &daily);

    debug!(
        asin,
        days = daily.len(),
        flags = flags_detail.len(),
        alerts = alerts.len(),
        test = significance.name(),
        "asin analytics derived"
    );

    let [w7, w28] = rolling::ROLLING_WINDOWS;
    AnalyticsTables {
        sentiment_daily: densify::sentiment_daily(asin, reviews, &policy.sentiment),
        rolling_7d: rolling::rolling(&daily, w7),
        rolling_28d: rolling::rolling(&daily, w28),
        flags_detail,
        flags_summary: vec![flag_summary],
        nps_by_asin: vec![nps::nps_summary(asin, reviews, &policy.nps)],
        nps_daily,
        nps_rolling,
        correlations,
        alerts,
        metrics_daily: daily,
    }
}
