//! Affine coupling transforms and mask utilities.

use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use crate::conditioner::{Conditioner, ConditionerConfig};
use crate::transform::{check_dim, index_tensor, unscramble_order, Bijection, FlowError};

/// Minimum multiplicative scale of the affine map. Keeps the inverse and the
/// log-determinant bounded even for saturated conditioner outputs.
const MIN_SCALE: f64 = 1e-3;

/// Alternating boolean mask over `features` dimensions.
///
/// `true` marks an active (transformed) dimension. With `even` set, the even
/// positions are active; the complementary mask transforms the odd positions,
/// so a pair of couplings with `even`/`!even` masks updates every dimension.
pub fn alternating_mask(features: usize, even: bool) -> Vec<bool> {
    (0..features).map(|i| (i % 2 == 0) == even).collect()
}

/// Split a mask into `(passive, active)` feature index lists.
pub fn partition_mask(mask: &[bool]) -> (Vec<usize>, Vec<usize>) {
    let passive = mask
        .iter()
        .enumerate()
        .filter(|(_, &active)| !active)
        .map(|(i, _)| i)
        .collect();
    let active = mask
        .iter()
        .enumerate()
        .filter(|(_, &active)| active)
        .map(|(i, _)| i)
        .collect();
    (passive, active)
}

/// Affine coupling transform.
///
/// The passive half passes through unchanged; each active dimension is mapped
/// as `y = x * scale + shift` where `(scale, shift)` are predicted from the
/// passive half by a [`Conditioner`]. The scale is parameterized as
/// `sigmoid(raw + 2) + MIN_SCALE`, which keeps it in
/// `(MIN_SCALE, 1 + MIN_SCALE)` and close to 1 at initialization.
/// Log-determinant is the sum of `ln scale` over active dimensions.
#[derive(Module, Debug)]
pub struct AffineCoupling<B: Backend> {
    conditioner: Conditioner<B>,
    passive: Vec<usize>,
    active: Vec<usize>,
    /// Scatters `[passive ++ active]` back into feature order.
    unscramble: Vec<usize>,
    features: usize,
}

impl<B: Backend> AffineCoupling<B> {
    /// Build an affine coupling from a boolean mask (`true` = active) and a
    /// conditioner configuration template (hidden width/depth/dropout; the
    /// input/output dimensions are derived from the mask).
    pub fn new(
        mask: &[bool],
        hidden_features: usize,
        hidden_layers: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        let (passive, active) = partition_mask(mask);
        if passive.is_empty() || active.is_empty() {
            return Err(FlowError::Config(format!(
                "coupling mask must leave both halves non-empty (passive {}, active {})",
                passive.len(),
                active.len()
            )));
        }
        let conditioner = ConditionerConfig::new(passive.len(), 2 * active.len())
            .with_hidden_features(hidden_features)
            .with_hidden_layers(hidden_layers)
            .with_dropout(dropout)
            .init(device);
        let order: Vec<usize> = passive.iter().chain(active.iter()).copied().collect();
        Ok(Self {
            conditioner,
            unscramble: unscramble_order(&order),
            features: mask.len(),
            passive,
            active,
        })
    }

    /// Per-active-dimension `(scale, shift)` predicted from the passive half.
    fn parameters(&self, passive: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let n_active = self.active.len();
        let raw = self.conditioner.forward(passive);
        let shift = raw.clone().narrow(1, 0, n_active);
        let scale = sigmoid(raw.narrow(1, n_active, n_active) + 2.0) + MIN_SCALE;
        (scale, shift)
    }

    fn split(&self, x: &Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let device = x.device();
        let xp = x.clone().select(1, index_tensor::<B>(&self.passive, &device));
        let xa = x.clone().select(1, index_tensor::<B>(&self.active, &device));
        (xp, xa)
    }

    fn merge(&self, passive: Tensor<B, 2>, active: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = passive.device();
        Tensor::cat(vec![passive, active], 1)
            .select(1, index_tensor::<B>(&self.unscramble, &device))
    }
}

impl<B: Backend> Bijection<B> for AffineCoupling<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        check_dim(&x, self.features)?;
        let (xp, xa) = self.split(&x);
        let (scale, shift) = self.parameters(xp.clone());
        let ya = xa * scale.clone() + shift;
        let logdet = scale.log().sum_dim(1).squeeze::<1>(1);
        Ok((self.merge(xp, ya), logdet))
    }

    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        check_dim(&y, self.features)?;
        let (yp, ya) = self.split(&y);
        let (scale, shift) = self.parameters(yp.clone());
        let xa = (ya - shift) / scale.clone();
        let logdet = scale.log().sum_dim(1).squeeze::<1>(1).neg();
        Ok((self.merge(yp, xa), logdet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn coupling(features: usize, even: bool) -> AffineCoupling<TestBackend> {
        let mask = alternating_mask(features, even);
        AffineCoupling::new(&mask, 16, 2, 0.0, &Default::default()).unwrap()
    }

    #[test]
    fn test_alternating_mask() {
        assert_eq!(alternating_mask(5, true), vec![true, false, true, false, true]);
        assert_eq!(alternating_mask(4, false), vec![false, true, false, true]);
    }

    #[test]
    fn test_passive_half_unchanged() {
        let device = Default::default();
        let t = coupling(6, true);
        let x = Tensor::<TestBackend, 2>::random([4, 6], Distribution::Normal(0.0, 1.0), &device);
        let (y, _) = t.forward(x.clone()).unwrap();
        // Odd positions are passive under the even mask.
        for &i in &[1usize, 3, 5] {
            let xi: Vec<f32> = x.clone().narrow(1, i, 1).into_data().to_vec().unwrap();
            let yi: Vec<f32> = y.clone().narrow(1, i, 1).into_data().to_vec().unwrap();
            assert_eq!(xi, yi, "passive dim {i} must pass through");
        }
    }

    #[test]
    fn test_invertibility_and_logdet() {
        let device = Default::default();
        for even in [true, false] {
            let t = coupling(7, even);
            let x =
                Tensor::<TestBackend, 2>::random([8, 7], Distribution::Normal(0.0, 2.0), &device);
            let (y, ld_fwd) = t.forward(x.clone()).unwrap();
            let (x_back, ld_inv) = t.inverse(y).unwrap();

            let err: f32 = (x_back - x).abs().max().into_scalar().elem();
            assert!(err < 1e-4, "roundtrip error {err}");

            let ld_err: f32 = (ld_fwd + ld_inv).abs().max().into_scalar().elem();
            assert!(ld_err < 1e-4, "logdet mismatch {ld_err}");
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let device = Default::default();
        let t = coupling(6, true);
        let x = Tensor::<TestBackend, 2>::random([2, 5], Distribution::Normal(0.0, 1.0), &device);
        assert!(matches!(t.forward(x), Err(FlowError::NumericalDomain(_))));
    }

    #[test]
    fn test_degenerate_mask_rejected() {
        let mask = vec![true, true, true];
        let err = AffineCoupling::<TestBackend>::new(&mask, 8, 1, 0.0, &Default::default());
        assert!(matches!(err, Err(FlowError::Config(_))));
    }
}
