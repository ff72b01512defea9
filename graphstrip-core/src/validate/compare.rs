//! Numeric comparison of two runtimes' outputs.

use crate::error::StripError;
use crate::tensor::Tensor;

/// Largest elementwise relative error between `a` and `b`.
///
/// Each element contributes `|a - b| / max(max(a, b), 1)`. Clamping the
/// denominator at 1 keeps near-zero values from blowing the ratio up, at
/// the price of treating small-magnitude elements as absolute errors.
/// Returns 0 for empty slices and NaN when any contribution is NaN.
pub fn max_relative_error(a: &[f32], b: &[f32]) -> Result<f32, StripError> {
    if a.len() != b.len() {
        return Err(StripError::shape(format!(
            "cannot compare {} elements against {}",
            a.len(),
            b.len()
        )));
    }
    let mut worst = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        let denom = x.max(y).max(1.0);
        let rel = (x - y).abs() / denom;
        if rel.is_nan() || x.is_nan() || y.is_nan() {
            return Ok(f32::NAN);
        }
        worst = worst.max(rel);
    }
    Ok(worst)
}

/// [`max_relative_error`] over two tensors of identical shape.
pub fn tensor_max_relative_error(a: &Tensor, b: &Tensor) -> Result<f32, StripError> {
    if a.shape() != b.shape() {
        return Err(StripError::shape(format!(
            "shape mismatch: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    max_relative_error(a.data(), b.data())
}
