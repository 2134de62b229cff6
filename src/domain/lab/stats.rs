//! Small statistical helpers shared by the Monte-Carlo resampler (C10), the walk-forward
//! controller (C9) and the regime detector (C11).

use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryStats {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p95: f64,
    pub p10: f64,
    pub p90: f64,
}

pub fn summarize(values: &[f64]) -> SummaryStats {
    if values.is_empty() {
        return SummaryStats {
            mean: 0.0,
            median: 0.0,
            std_dev: 0.0,
            min: 0.0,
            max: 0.0,
            p5: 0.0,
            p95: 0.0,
            p10: 0.0,
            p90: 0.0,
        };
    }
    let mut data = Data::new(values.to_vec());
    SummaryStats {
        mean: data.mean().unwrap_or(0.0),
        median: data.median(),
        std_dev: data.std_dev().unwrap_or(0.0),
        min: data.min(),
        max: data.max(),
        p5: data.percentile(5),
        p95: data.percentile(95),
        p10: data.percentile(10),
        p90: data.percentile(90),
    }
}

/// Sample variance (Bessel-corrected) of a slice of `f64`.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_basic() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let s = summarize(&values);
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
    }

    #[test]
    fn variance_of_constant_is_zero() {
        assert_eq!(variance(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let s = summarize(&[]);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.p95, 0.0);
    }
}
