use anyhow::{Result, anyhow};
use std::cmp::Ordering;

/// Apply Benjamini-Hochberg (BH) procedure for controlling false discovery rate
///
/// The BH procedure controls the false discovery rate (FDR), which is the expected
/// proportion of false positives among all rejected null hypotheses. Adjusted values
/// are returned in the order of the input.
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
///
/// # Returns
/// * `Result<Vec<f64>>` - Vector of adjusted p-values
pub fn benjamini_hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    let n = p_values.len();
    if n == 0 {
        return Err(anyhow!("Empty p-value array"));
    }

    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }

    let mut indexed_p_values: Vec<(usize, f64)> =
        p_values.iter().enumerate().map(|(i, &p)| (i, p)).collect();
    indexed_p_values.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    // Walk from the largest p-value down, carrying the running minimum so the
    // adjusted values stay monotone in the raw ones.
    let mut adjusted_p_values = vec![0.0; n];
    let mut current_min = 1.0;
    for i in (0..n).rev() {
        let (orig_idx, p_val) = indexed_p_values[i];
        let rank = i + 1;

        let adjustment = (p_val * n as f64 / rank as f64).min(1.0);
        current_min = adjustment.min(current_min);
        adjusted_p_values[orig_idx] = current_min;
    }

    Ok(adjusted_p_values)
}
