//! Rank correlation and its significance test.

/// 1-based ranks; tied values share the mean of the ranks they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in &order[i..=j] {
            ranks[*k] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// `None` for mismatched or too-short inputs and for a constant series.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    pearson(&average_ranks(x), &average_ranks(y))
}

/// Two-sided p-value for a correlation coefficient. Chosen once per run.
pub trait SignificanceTest: Send + Sync {
    fn name(&self) -> &'static str;
    fn two_sided_p(&self, r: f64, n: usize) -> Option<f64>;
}

/// Student-t approximation: `t = r * sqrt((n - 2) / (1 - r^2))` on `n - 2`
/// degrees of freedom.
#[cfg(feature = "exact-stats")]
#[derive(Debug, Clone, Copy, Default)]
pub struct StudentT;

#[cfg(feature = "exact-stats")]
impl SignificanceTest for StudentT {
    fn name(&self) -> &'static str {
        "student_t"
    }

    fn two_sided_p(&self, r: f64, n: usize) -> Option<f64> {
        use statrs::distribution::{ContinuousCDF, StudentsT};

        if n < 3 || !r.is_finite() {
            return None;
        }
        if r.abs() >= 1.0 {
            return Some(0.0);
        }
        let df = (n - 2) as f64;
        let t = r * (df / (1.0 - r * r)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, df).ok()?;
        Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
    }
}

/// Coefficients only; every p-value is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPValue;

impl SignificanceTest for NoPValue {
    fn name(&self) -> &'static str {
        "none"
    }

    fn two_sided_p(&self, _r: f64, _n: usize) -> Option<f64> {
        None
    }
}

/// The best test this build supports.
pub fn default_significance() -> Box<dyn SignificanceTest> {
    #[cfg(feature = "exact-stats")]
    {
        Box::new(StudentT)
    }
    #[cfg(not(feature = "exact-stats"))]
    {
        Box::new(NoPValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_share_average_rank() {
        assert_eq!(average_ranks(&[10.0, 20.0, 10.0, 30.0]), vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn monotonic_series_correlate_perfectly() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 4.0, 9.0, 16.0, 25.0];
        assert_eq!(spearman(&x, &y), Some(1.0));
        let rev: Vec<f64> = y.iter().map(|v| -v).collect();
        assert_eq!(spearman(&x, &rev), Some(-1.0));
    }

    #[test]
    fn constant_series_has_no_coefficient() {
        assert_eq!(spearman(&[1.0, 2.0, 3.0, 4.0, 5.0], &[7.0; 5]), None);
        assert_eq!(pearson(&[1.0], &[2.0]), None);
    }

    #[test]
    fn no_p_value_strategy_is_silent() {
        assert_eq!(NoPValue.two_sided_p(0.9, 30), None);
    }

    #[cfg(feature = "exact-stats")]
    #[test]
    fn student_t_p_values_are_sane() {
        let strong = StudentT.two_sided_p(0.9, 10).unwrap();
        let weak = StudentT.two_sided_p(0.1, 10).unwrap();
        assert!(strong < 0.001, "p = {strong}");
        assert!(weak > 0.5, "p = {weak}");
        assert_eq!(StudentT.two_sided_p(1.0, 5), Some(0.0));
        assert_eq!(StudentT.two_sided_p(0.5, 2), None);
        assert!((StudentT.two_sided_p(0.0, 12).unwrap() - 1.0).abs() < 1e-9);
    }
}
