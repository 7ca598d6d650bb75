//! Analytics thresholds, loaded from an optional YAML policy file.
//!
//! Every field has a default, so a partial file only overrides what it names.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsPolicy {
    pub sentiment: SentimentPolicy,
    pub authenticity: AuthenticityPolicy,
    pub nps: NpsPolicy,
    pub correlation: CorrelationPolicy,
}

impl AnalyticsPolicy {
    /// A missing file yields the defaults; a present but invalid file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(policy = %path.display(), "no policy file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentPolicy {
    /// Scores `>= +cut` are positive, `<= -cut` negative, the rest neutral.
    pub label_threshold: f64,
}

impl Default for SentimentPolicy {
    fn default() -> Self {
        Self {
            label_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticityPolicy {
    pub short_percentile: f64,
    pub long_percentile: f64,
    /// Used when an ASIN has no non-empty review text to take percentiles from.
    pub fallback_short_len: usize,
    pub fallback_long_len: usize,
    pub volume_spike_min_reviews: usize,
    pub volume_spike_multiplier: f64,
    pub volume_baseline_days: i64,
    pub hyperactive_max_reviews: usize,
    pub hyperactive_window_days: i64,
}

impl Default for AuthenticityPolicy {
    fn default() -> Self {
        Self {
            short_percentile: 10.0,
            long_percentile: 90.0,
            fallback_short_len: 20,
            fallback_long_len: 1000,
            volume_spike_min_reviews: 3,
            volume_spike_multiplier: 3.0,
            volume_baseline_days: 7,
            hyperactive_max_reviews: 3,
            hyperactive_window_days: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpsPolicy {
    /// Below this many rated reviews `nps_by_asin` leaves the score empty.
    pub min_reviews: usize,
    pub rolling_7d_min_days: usize,
    pub rolling_28d_min_days: usize,
}

impl Default for NpsPolicy {
    fn default() -> Self {
        Self {
            min_reviews: 10,
            rolling_7d_min_days: 3,
            rolling_28d_min_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationPolicy {
    pub windows: Vec<i64>,
    pub min_obs: usize,
    pub min_half_obs: usize,
    pub stability_min_abs_r: f64,
    /// `sig` in `correlations_by_asin` is `p < significance_level`.
    pub significance_level: f64,
    pub alerts: AlertPolicy,
}

impl Default for CorrelationPolicy {
    fn default() -> Self {
        Self {
            windows: vec![7, 28, 90],
            min_obs: 5,
            min_half_obs: 3,
            stability_min_abs_r: 0.4,
            significance_level: 0.05,
            alerts: AlertPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    pub window_days: i64,
    pub min_abs_r: f64,
    pub max_p: f64,
    pub min_obs: usize,
    /// Checked in order; the first tier an alert satisfies names it.
    pub tiers: Vec<AlertTier>,
    pub fallback_tier: String,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_abs_r: 0.6,
            max_p: 0.1,
            min_obs: 5,
            tiers: vec![
                AlertTier {
                    label: "high".into(),
                    min_abs_r: 0.8,
                    max_p: 0.01,
                },
                AlertTier {
                    label: "medium".into(),
                    min_abs_r: 0.7,
                    max_p: 0.05,
                },
            ],
            fallback_tier: "low".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTier {
    pub label: String,
    pub min_abs_r: f64,
    pub max_p: f64,
}

impl AlertPolicy {
    pub fn tier_for(&self, abs_r: f64, p: f64) -> &str {
        self.tiers
            .iter()
            .find(|t| abs_r >= t.min_abs_r && p < t.max_p)
            .map(|t| t.label.as_str())
            .unwrap_or(&self.fallback_tier)
    }
}
