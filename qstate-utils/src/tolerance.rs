//! Numeric tolerance contracts.
//!
//! Quantized optimizer state is lossy, so divergence from a full precision
//! reference is reported as a verification failure against an explicit
//! `(atol, rtol)` pair rather than as a runtime error. An element is close
//! when `|actual - expected| <= atol + rtol * |expected|`.

use anyhow::{anyhow, Result};

pub fn is_close(actual: f32, expected: f32, atol: f32, rtol: f32) -> bool {
    if actual == expected {
        return true;
    }
    (actual - expected).abs() <= atol + rtol * expected.abs()
}

/// Number of positions that fall outside the tolerance. Slices of different
/// length count every unmatched position as not close.
pub fn count_not_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> usize {
    let mismatched = actual.len().abs_diff(expected.len());
    mismatched
        + actual
            .iter()
            .zip(expected)
            .filter(|(a, e)| !is_close(**a, **e, atol, rtol))
            .count()
}

pub fn allclose(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> bool {
    count_not_close(actual, expected, atol, rtol) == 0
}

pub fn mean_abs_error(actual: &[f32], expected: &[f32]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (*a as f64 - *e as f64).abs())
        .sum::<f64>()
        / actual.len() as f64
}

/// Like [`allclose`] but reports the worst offending element.
pub fn assert_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> Result<()> {
    if actual.len() != expected.len() {
        return Err(anyhow!(
            "Length mismatch. Expected: '{}', Actual: '{}'",
            expected.len(),
            actual.len()
        ));
    }
    let mut worst: Option<(usize, f32)> = None;
    let mut num_not_close = 0;
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        if !is_close(*a, *e, atol, rtol) {
            num_not_close += 1;
            let err = (a - e).abs();
            if worst.map_or(true, |(_, w)| err > w || err.is_nan()) {
                worst = Some((i, err));
            }
        }
    }
    match worst {
        None => Ok(()),
        Some((i, err)) => Err(anyhow!(
            "{} of {} elements not close (atol={:e}, rtol={:e}). Worst at index {}: actual {:e}, expected {:e}, error {:e}",
            num_not_close,
            actual.len(),
            atol,
            rtol,
            i,
            actual[i],
            expected[i],
            err
        )),
    }
}
