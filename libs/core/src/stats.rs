//! Usage statistics for the dispersion gate.

/// Population mean and standard deviation of `values`.
///
/// Empty input yields `(0.0, 0.0)`.
pub fn mean_and_deviation(values: &[u64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let count = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / count;
    let sum_of_squares = values
        .iter()
        .map(|&v| {
            let delta = v as f64 - mean;
            delta * delta
        })
        .sum::<f64>();

    (mean, (sum_of_squares / count).sqrt())
}

/// Coefficient of variation (deviation over mean), zero when the mean is zero.
pub fn dispersion(values: &[u64]) -> f64 {
    let (mean, deviation) = mean_and_deviation(values);
    if mean == 0.0 {
        return 0.0;
    }
    deviation / mean
}
