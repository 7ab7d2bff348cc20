use burn::prelude::*;
use thiserror::Error;

/// Errors surfaced by energy evaluation.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The evaluated batch contained NaN energies before regularization.
    #[error("{count} of {batch} energies are NaN")]
    NonFinite { count: usize, batch: usize },
    /// The backing evaluator failed.
    #[error("energy evaluation failed: {0}")]
    Evaluation(String),
}

/// Reduced potential energy of conformation batches.
///
/// `coords` is `(batch, 3 * n_atoms)` in the same flattened layout the flow
/// network decodes into. Implementations return `U(x) / kT` per sample and
/// must build the result out of differentiable tensor ops so that energy
/// gradients reach the generator on autodiff backends.
pub trait EnergyOracle<B: Backend> {
    fn evaluate(&self, coords: Tensor<B, 2>, temperature: f64) -> Result<Tensor<B, 1>, OracleError>;
}

/// Fail on NaN energies; infinities pass through to the regularizer.
pub fn reject_nan<B: Backend>(energies: Tensor<B, 1>) -> Result<Tensor<B, 1>, OracleError> {
    let [batch] = energies.dims();
    let count: i64 = energies
        .clone()
        .is_nan()
        .int()
        .sum()
        .into_scalar()
        .elem();
    if count > 0 {
        tracing::warn!(count, batch, "rejecting energy batch with NaN entries");
        return Err(OracleError::NonFinite {
            count: count as usize,
            batch,
        });
    }
    Ok(energies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_reject_nan_counts_offenders() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::from_floats([1.0, f32::NAN, 3.0, f32::NAN], &device);
        match reject_nan(e) {
            Err(OracleError::NonFinite { count, batch }) => {
                assert_eq!(count, 2);
                assert_eq!(batch, 4);
            }
            other => panic!("expected NonFinite, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_nan_passes_infinities() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::from_floats([1.0, f32::INFINITY, -2.0], &device);
        let out = reject_nan(e).unwrap();
        assert_eq!(out.dims(), [3]);
    }
}
