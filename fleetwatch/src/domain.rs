//! Y-axis range for percentage charts. Zooms in on narrow bands so small variations stay
//! visible, with a minimum span of 10 units inside `[0, 100]`.

const MIN_SPAN: f64 = 10.0;

pub fn domain(values: &[f64]) -> (f64, f64) {
    let values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return (0.0, 100.0);
    }
    let n = values.len() as f64;
    let avg = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let margin = (stddev * 2.0).max(MIN_SPAN);
    let size = (max - min).max(MIN_SPAN);
    let low = (min - margin).min(avg - size).clamp(0.0, 100.0);
    let high = (max + margin).max(avg + size).clamp(0.0, 100.0);
    (low, high)
}
