use burn::prelude::*;

/// Negative log-likelihood of encoded frames under a standard normal base,
/// up to the constant `D/2 ln(2 pi)`.
///
/// `z` is the encoded batch, `logdet` the per-sample forward
/// log-determinant. Lower is better.
pub fn example_loss<B: Backend>(z: Tensor<B, 2>, logdet: Tensor<B, 1>) -> Tensor<B, 1> {
    let quadratic = z
        .powf_scalar(2.0)
        .sum_dim(1)
        .squeeze::<1>(1)
        .mean()
        .mul_scalar(0.5);
    quadratic - logdet.mean()
}

/// Mean regularized energy of decoded samples, corrected by the decoder's
/// per-sample log-determinant. This is the reverse KL to the Boltzmann
/// distribution up to an additive constant.
pub fn energy_loss<B: Backend>(
    regularized_energy: Tensor<B, 1>,
    logdet: Tensor<B, 1>,
) -> Tensor<B, 1> {
    regularized_energy.mean() - logdet.mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_example_loss_value() {
        let device = Default::default();
        // Two samples: |z|^2 = 1+4 = 5 and 0+9 = 9, logdets 1 and 3.
        let z = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [0.0, 3.0]], &device);
        let logdet = Tensor::<TestBackend, 1>::from_floats([1.0, 3.0], &device);
        let loss: f32 = example_loss(z, logdet).into_scalar().elem();
        // 0.5 * mean(5, 9) - mean(1, 3) = 3.5 - 2 = 1.5
        assert!((loss - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_energy_loss_value() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::from_floats([2.0, 4.0], &device);
        let logdet = Tensor::<TestBackend, 1>::from_floats([0.5, 1.5], &device);
        let loss: f32 = energy_loss(e, logdet).into_scalar().elem();
        assert!((loss - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_example_loss_prefers_standard_normal_scale() {
        let device = Default::default();
        let unit = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0]], &device);
        let wide = Tensor::<TestBackend, 2>::from_floats([[3.0, -3.0]], &device);
        let zero_ld = Tensor::<TestBackend, 1>::from_floats([0.0], &device);
        let l_unit: f32 = example_loss(unit, zero_ld.clone()).into_scalar().elem();
        let l_wide: f32 = example_loss(wide, zero_ld).into_scalar().elem();
        assert!(l_unit < l_wide);
    }
}
