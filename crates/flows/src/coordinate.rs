//! Coordinate transform: Cartesian conformations to reduced internal
//! coordinates via frozen PCA whitening of the backbone subspace.

use burn::module::Param;
use burn::prelude::*;
use nalgebra::{DMatrix, DVector};

use crate::transform::{check_dim, index_tensor, unscramble_order, Bijection, FlowError};

/// Number of rigid-body degrees of freedom removed from the backbone
/// subspace (3 translational + 3 rotational).
pub const RIGID_BODY_DOF: usize = 6;

/// Retained eigenvalues below this are treated as rank deficiency.
const MIN_EIGENVALUE: f64 = 1e-10;

/// Linear reduction of a conformation batch into internal coordinates.
///
/// Fit once from a reference batch of already-superposed conformations: the
/// backbone coordinate subspace is mean-centered and PCA-whitened, dropping
/// the `RIGID_BODY_DOF` smallest-variance modes (the rigid-body modes of
/// superposed data); non-backbone coordinates are centered and passed
/// through. The statistics are frozen (`no_grad`) and stored as recorded
/// parameters, so a saved model round-trips the fit exactly instead of
/// re-deriving it.
///
/// Domain: `forward` accepts any batch, but only conformations lying in the
/// retained subspace (superposed data, as produced by `inverse`) round-trip
/// exactly; the dropped modes are reinserted as zero on the way back. The
/// forward log-determinant is the constant log-volume of the retained
/// whitening map, `-0.5 Σ ln λ`.
#[derive(Module, Debug)]
pub struct CoordinateTransform<B: Backend> {
    /// Backbone coordinate means, `(d_backbone,)`.
    mean_backbone: Param<Tensor<B, 1>>,
    /// Non-backbone coordinate means, `(d_other,)`.
    mean_other: Param<Tensor<B, 1>>,
    /// Retained principal axes, `(d_backbone, d_backbone - 6)`, columns
    /// ordered by decreasing eigenvalue.
    components: Param<Tensor<B, 2>>,
    /// `sqrt(λ)` per retained component.
    std: Param<Tensor<B, 1>>,
    /// `1 / sqrt(λ)` per retained component.
    inv_std: Param<Tensor<B, 1>>,
    /// Forward log-determinant, `(1,)`.
    logdet: Param<Tensor<B, 1>>,
    /// Backbone coordinate dimensions in the full vector.
    backbone: Vec<usize>,
    /// Remaining coordinate dimensions.
    other: Vec<usize>,
    /// Scatters `[backbone ++ other]` back into full coordinate order.
    unscramble: Vec<usize>,
    dim: usize,
}

impl<B: Backend> CoordinateTransform<B> {
    /// Fit the transform from a reference batch.
    ///
    /// `reference` is `(n_frames, 3 * n_atoms)` flattened Cartesian
    /// coordinates, already superposed; `backbone_atoms` selects the atoms
    /// whose subspace is reduced. Fails with
    /// [`FlowError::InsufficientData`] when the reference has no more frames
    /// than backbone dimensions, or when a retained eigenvalue is not
    /// positive (rank-deficient reference).
    pub fn fit(
        reference: Tensor<B, 2>,
        backbone_atoms: &[usize],
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        let [n_frames, dim] = reference.dims();
        let n_atoms = dim / 3;
        if dim % 3 != 0 {
            return Err(FlowError::Config(format!(
                "conformation dimension {dim} is not a multiple of 3"
            )));
        }
        if backbone_atoms.is_empty() {
            return Err(FlowError::Config("backbone selection is empty".into()));
        }
        if backbone_atoms.iter().any(|&a| a >= n_atoms) {
            return Err(FlowError::Config(format!(
                "backbone atom index out of range (n_atoms = {n_atoms})"
            )));
        }

        let backbone: Vec<usize> = backbone_atoms
            .iter()
            .flat_map(|&a| [3 * a, 3 * a + 1, 3 * a + 2])
            .collect();
        let d_bb = backbone.len();
        if d_bb <= RIGID_BODY_DOF {
            return Err(FlowError::Config(format!(
                "backbone subspace of {d_bb} dims cannot lose {RIGID_BODY_DOF} rigid-body dofs"
            )));
        }
        if n_frames <= d_bb {
            return Err(FlowError::InsufficientData {
                needed: d_bb,
                got: n_frames,
            });
        }

        let in_backbone: Vec<bool> = {
            let mut flags = vec![false; dim];
            for &i in &backbone {
                flags[i] = true;
            }
            flags
        };
        let other: Vec<usize> = (0..dim).filter(|&i| !in_backbone[i]).collect();

        // One-shot host-side fit; training never touches this path again.
        let flat: Vec<f32> = reference
            .into_data()
            .to_vec()
            .map_err(|e| FlowError::NumericalDomain(format!("reference readback: {e:?}")))?;

        let mut mean = vec![0.0f64; dim];
        for frame in flat.chunks_exact(dim) {
            for (m, &v) in mean.iter_mut().zip(frame) {
                *m += v as f64;
            }
        }
        for m in &mut mean {
            *m /= n_frames as f64;
        }

        // Centered backbone data matrix, (n_frames, d_bb).
        let centered = DMatrix::<f64>::from_fn(n_frames, d_bb, |r, c| {
            let col = backbone[c];
            flat[r * dim + col] as f64 - mean[col]
        });
        let covariance = centered.transpose() * &centered / (n_frames as f64 - 1.0);
        let eigen = covariance.symmetric_eigen();

        // Sort eigenpairs by decreasing eigenvalue, keep all but the 6
        // rigid-body modes.
        let mut order: Vec<usize> = (0..d_bb).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
        let kept = d_bb - RIGID_BODY_DOF;
        let eigenvalues: Vec<f64> = order[..kept].iter().map(|&i| eigen.eigenvalues[i]).collect();
        if eigenvalues.iter().any(|&l| l <= MIN_EIGENVALUE) {
            return Err(FlowError::InsufficientData {
                needed: d_bb,
                got: n_frames,
            });
        }

        let mut components = vec![0.0f32; d_bb * kept];
        for (c, &i) in order[..kept].iter().enumerate() {
            let column: DVector<f64> = eigen.eigenvectors.column(i).into();
            for r in 0..d_bb {
                components[r * kept + c] = column[r] as f32;
            }
        }
        let std: Vec<f32> = eigenvalues.iter().map(|&l| l.sqrt() as f32).collect();
        let inv_std: Vec<f32> = eigenvalues.iter().map(|&l| (1.0 / l.sqrt()) as f32).collect();
        let logdet: f32 = eigenvalues.iter().map(|&l| -0.5 * l.ln()).sum::<f64>() as f32;

        tracing::debug!(
            d_bb,
            kept,
            lambda_max = eigenvalues.first().copied().unwrap_or_default(),
            lambda_min = eigenvalues.last().copied().unwrap_or_default(),
            "Fitted coordinate transform"
        );

        let mean_backbone: Vec<f32> = backbone.iter().map(|&i| mean[i] as f32).collect();
        let mean_other: Vec<f32> = other.iter().map(|&i| mean[i] as f32).collect();
        let order_full: Vec<usize> = backbone.iter().chain(other.iter()).copied().collect();

        let transform = Self {
            mean_backbone: Param::from_tensor(Tensor::from_data(
                TensorData::new(mean_backbone, [d_bb]),
                device,
            )),
            mean_other: Param::from_tensor(Tensor::from_data(
                TensorData::new(mean_other, [other.len()]),
                device,
            )),
            components: Param::from_tensor(Tensor::from_data(
                TensorData::new(components, [d_bb, kept]),
                device,
            )),
            std: Param::from_tensor(Tensor::from_data(TensorData::new(std, [kept]), device)),
            inv_std: Param::from_tensor(Tensor::from_data(
                TensorData::new(inv_std, [kept]),
                device,
            )),
            logdet: Param::from_tensor(Tensor::from_data(
                TensorData::new(vec![logdet], [1]),
                device,
            )),
            unscramble: unscramble_order(&order_full),
            backbone,
            other,
            dim,
        };
        // The fit is frozen: exact round-trips, no optimizer updates.
        Ok(transform.no_grad())
    }

    /// Full conformation dimension `D`.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Reduced dimension `D - 6`.
    pub fn reduced_dim(&self) -> usize {
        self.dim - RIGID_BODY_DOF
    }

    fn kept(&self) -> usize {
        self.backbone.len() - RIGID_BODY_DOF
    }

    fn batch_logdet(&self, batch: usize, negate: bool) -> Tensor<B, 1> {
        let ld = self.logdet.val().repeat_dim(0, batch);
        if negate {
            ld.neg()
        } else {
            ld
        }
    }
}

impl<B: Backend> Bijection<B> for CoordinateTransform<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        check_dim(&x, self.dim)?;
        let [batch, _] = x.dims();
        let device = x.device();

        let xb = x.clone().select(1, index_tensor::<B>(&self.backbone, &device));
        let centered = xb - self.mean_backbone.val().unsqueeze_dim::<2>(0);
        let yb = centered.matmul(self.components.val()) * self.inv_std.val().unsqueeze_dim::<2>(0);

        let y = if self.other.is_empty() {
            yb
        } else {
            let xo = x.select(1, index_tensor::<B>(&self.other, &device));
            let yo = xo - self.mean_other.val().unsqueeze_dim::<2>(0);
            Tensor::cat(vec![yb, yo], 1)
        };
        Ok((y, self.batch_logdet(batch, false)))
    }

    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        check_dim(&y, self.reduced_dim())?;
        let [batch, _] = y.dims();
        let device = y.device();
        let kept = self.kept();

        let yb = y.clone().narrow(1, 0, kept);
        // Dropped rigid-body modes come back as zero: the canonical frame.
        let xb = (yb * self.std.val().unsqueeze_dim::<2>(0))
            .matmul(self.components.val().transpose())
            + self.mean_backbone.val().unsqueeze_dim::<2>(0);

        let x = if self.other.is_empty() {
            xb
        } else {
            let yo = y.narrow(1, kept, self.other.len());
            let xo = yo + self.mean_other.val().unsqueeze_dim::<2>(0);
            Tensor::cat(vec![xb, xo], 1)
        };
        let x = x.select(1, index_tensor::<B>(&self.unscramble, &device));
        Ok((x, self.batch_logdet(batch, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    /// Reference batch: 4 atoms, 40 frames of noisy tetrahedron coordinates.
    fn reference(n_frames: usize) -> Tensor<TestBackend, 2> {
        let device = Default::default();
        let base = [
            0.0f32, 0.0, 0.0, 1.5, 0.0, 0.0, 0.75, 1.3, 0.0, 0.75, 0.4, 1.2,
        ];
        let noise = Tensor::<TestBackend, 2>::random(
            [n_frames, 12],
            Distribution::Normal(0.0, 0.3),
            &device,
        );
        let base = Tensor::<TestBackend, 1>::from_floats(base, &device).unsqueeze_dim::<2>(0);
        noise + base
    }

    #[test]
    fn test_reduced_dimension() {
        let device = Default::default();
        let t = CoordinateTransform::fit(reference(40), &[0, 1, 2, 3], &device).unwrap();
        assert_eq!(t.dim(), 12);
        assert_eq!(t.reduced_dim(), 6);
        let x = reference(5);
        let (y, ld) = t.forward(x).unwrap();
        assert_eq!(y.dims(), [5, 6]);
        assert_eq!(ld.dims(), [5]);
    }

    #[test]
    fn test_latent_roundtrip() {
        let device = Default::default();
        let t = CoordinateTransform::fit(reference(40), &[0, 1, 2, 3], &device).unwrap();
        let z = Tensor::<TestBackend, 2>::random([8, 6], Distribution::Normal(0.0, 1.0), &device);
        let (x, ld_inv) = t.inverse(z.clone()).unwrap();
        let (z_back, ld_fwd) = t.forward(x).unwrap();

        let err: f32 = (z_back - z).abs().max().into_scalar().elem();
        assert!(err < 1e-3, "latent roundtrip error {err}");

        let ld_err: f32 = (ld_inv + ld_fwd).abs().max().into_scalar().elem();
        assert!(ld_err < 1e-4, "logdet mismatch {ld_err}");
    }

    #[test]
    fn test_projection_idempotent() {
        // forward ∘ inverse ∘ forward == forward: decoded conformations lie
        // in the transform's invertible domain.
        let device = Default::default();
        let t = CoordinateTransform::fit(reference(40), &[0, 1, 2, 3], &device).unwrap();
        let x = reference(6);
        let (y1, _) = t.forward(x).unwrap();
        let (x1, _) = t.inverse(y1.clone()).unwrap();
        let (y2, _) = t.forward(x1).unwrap();
        let err: f32 = (y2 - y1).abs().max().into_scalar().elem();
        assert!(err < 1e-3, "projection not idempotent: {err}");
    }

    #[test]
    fn test_partial_backbone_passthrough() {
        // Atoms 3..6 are not backbone: their coordinates only get centered.
        let device = Default::default();
        let n_frames = 60;
        let noise = Tensor::<TestBackend, 2>::random(
            [n_frames, 18],
            Distribution::Normal(0.0, 0.5),
            &device,
        );
        let t = CoordinateTransform::fit(noise.clone(), &[0, 1, 2], &device).unwrap();
        assert_eq!(t.reduced_dim(), 12);
        let (y, _) = t.forward(noise.clone()).unwrap();
        assert_eq!(y.dims(), [n_frames, 12]);
        let (x_back, _) = t.inverse(y).unwrap();
        // Non-backbone coordinates round-trip exactly through centering.
        let tail_in: Vec<f32> = noise.narrow(1, 9, 9).into_data().to_vec().unwrap();
        let tail_out: Vec<f32> = x_back.narrow(1, 9, 9).into_data().to_vec().unwrap();
        for (a, b) in tail_in.iter().zip(&tail_out) {
            assert!((a - b).abs() < 1e-4, "passthrough mismatch {a} vs {b}");
        }
    }

    #[test]
    fn test_insufficient_reference_rejected() {
        let device = Default::default();
        let err = CoordinateTransform::<TestBackend>::fit(reference(10), &[0, 1, 2, 3], &device);
        assert!(matches!(err, Err(FlowError::InsufficientData { .. })));
    }

    #[test]
    fn test_tiny_backbone_rejected() {
        let device = Default::default();
        // 2 backbone atoms = 6 dims, cannot lose 6 rigid-body dofs.
        let err = CoordinateTransform::<TestBackend>::fit(reference(40), &[0, 1], &device);
        assert!(matches!(err, Err(FlowError::Config(_))));
    }
}
