//! The reversible-transform contract and shared index utilities.

use burn::prelude::*;

/// Errors raised by transform construction and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Input lies outside the transform's invertible domain (for example a
    /// batch whose feature dimension does not match the transform).
    #[error("input outside invertible domain: {0}")]
    NumericalDomain(String),

    /// A data-driven transform was fit from too few reference samples.
    #[error("reference batch too small: need more than {needed} frames, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// A transform stack was requested with contradictory dimensions.
    #[error("invalid transform configuration: {0}")]
    Config(String),
}

/// A unit bijection on a batch of fixed-length vectors.
///
/// `forward` and `inverse` are exact algebraic inverses on the transform's
/// documented domain: `inverse(forward(x)) == x` and the returned
/// log-determinants negate each other, up to floating-point tolerance. The
/// second tensor of each pair holds one log |det J| scalar per batch element.
pub trait Bijection<B: Backend> {
    /// Map a batch to its image plus the per-sample forward log-determinant.
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError>;

    /// Exact inverse of [`Bijection::forward`], with the log-determinant of
    /// the inverse map (the negation of the forward one at the preimage).
    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError>;
}

/// Build an integer index tensor from a slice of feature positions.
pub(crate) fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

/// Check that a batch has the expected feature dimension.
pub(crate) fn check_dim<B: Backend>(x: &Tensor<B, 2>, expected: usize) -> Result<(), FlowError> {
    let [_, features] = x.dims();
    if features != expected {
        return Err(FlowError::NumericalDomain(format!(
            "expected {expected} features, got {features}"
        )));
    }
    Ok(())
}

/// Inverse of a position mapping: `out[order[k]] = k`.
///
/// Used to scatter `[passive ++ active]` (or `[backbone ++ rest]`)
/// concatenations back into the original feature ordering with a single
/// `select`.
pub(crate) fn unscramble_order(order: &[usize]) -> Vec<usize> {
    let mut out = vec![0usize; order.len()];
    for (k, &pos) in order.iter().enumerate() {
        out[pos] = k;
    }
    out
}
