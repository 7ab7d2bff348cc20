//! Monotonic rational-quadratic spline coupling with linear tails.

use burn::prelude::*;
use burn::tensor::activation::{softmax, softplus};

use crate::conditioner::{Conditioner, ConditionerConfig};
use crate::coupling::partition_mask;
use crate::transform::{check_dim, index_tensor, unscramble_order, Bijection, FlowError};

/// Lower bounds keeping bins and knot derivatives away from degeneracy.
/// Degenerate or backwards knot ordering cannot occur by construction.
const MIN_BIN_WIDTH: f64 = 1e-3;
const MIN_BIN_HEIGHT: f64 = 1e-3;
const MIN_DERIVATIVE: f64 = 1e-3;

/// Rational-quadratic spline coupling transform.
///
/// Each active dimension is mapped by a monotonic piecewise
/// rational-quadratic spline on `[-tail_bound, tail_bound]`, parameterized by
/// the passive half: `n_bins` widths and heights plus `n_bins - 1` interior
/// knot derivatives per dimension. Outside the tail bound the map is the
/// identity with zero log-determinant contribution, so the transform stays
/// invertible on all of R. Boundary knot derivatives are fixed to 1 to match
/// the linear tails.
///
/// Both directions are closed-form: the inverse solves a quadratic per
/// segment.
#[derive(Module, Debug)]
pub struct SplineCoupling<B: Backend> {
    conditioner: Conditioner<B>,
    passive: Vec<usize>,
    active: Vec<usize>,
    unscramble: Vec<usize>,
    features: usize,
    n_bins: usize,
    tail_bound: f64,
}

impl<B: Backend> SplineCoupling<B> {
    /// Build a spline coupling from a boolean mask (`true` = active).
    pub fn new(
        mask: &[bool],
        n_bins: usize,
        tail_bound: f64,
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
        if n_bins < 2 {
            return Err(FlowError::Config(format!(
                "spline needs at least 2 bins, got {n_bins}"
            )));
        }
        if tail_bound <= 0.0 {
            return Err(FlowError::Config(format!(
                "tail bound must be positive, got {tail_bound}"
            )));
        }
        let conditioner = ConditionerConfig::new(passive.len(), active.len() * (3 * n_bins - 1))
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
            n_bins,
            tail_bound,
        })
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

    /// Raw spline parameters per active dimension, shaped `(batch, active, ·)`.
    fn parameters(&self, passive: Tensor<B, 2>) -> SplineParams<B> {
        let a = self.active.len();
        let k = self.n_bins;
        let [batch, _] = passive.dims();
        let raw = self.conditioner.forward(passive);
        SplineParams {
            widths: raw.clone().narrow(1, 0, a * k).reshape([batch, a, k]),
            heights: raw.clone().narrow(1, a * k, a * k).reshape([batch, a, k]),
            derivatives: raw.narrow(1, 2 * a * k, a * (k - 1)).reshape([batch, a, k - 1]),
        }
    }

    /// Full knot derivative tensor `(batch, active, n_bins + 1)` for a given
    /// passive half. All entries are strictly positive by construction;
    /// exposed so tests can assert the monotonicity invariant.
    pub fn knot_derivatives(&self, passive: Tensor<B, 2>) -> Tensor<B, 3> {
        let params = self.parameters(passive);
        pad_derivatives(params.derivatives)
    }

    fn apply(
        &self,
        x: Tensor<B, 2>,
        invert: bool,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        check_dim(&x, self.features)?;
        let (xp, xa) = self.split(&x);
        let params = self.parameters(xp.clone());
        let (ya, logdet_elems) = rational_quadratic(xa, params, self.tail_bound, invert);
        let logdet = logdet_elems.sum_dim(1).squeeze::<1>(1);
        Ok((self.merge(xp, ya), logdet))
    }
}

impl<B: Backend> Bijection<B> for SplineCoupling<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        self.apply(x, false)
    }

    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        self.apply(y, true)
    }
}

/// Raw conditioner outputs split into spline parameter blocks.
struct SplineParams<B: Backend> {
    widths: Tensor<B, 3>,
    heights: Tensor<B, 3>,
    derivatives: Tensor<B, 3>,
}

/// Cumulative sum along the last dimension of a rank-3 tensor.
///
/// The bin count is small (spline bins), so a slice-accumulate loop is fine.
fn cumsum_last<B: Backend>(t: Tensor<B, 3>) -> Tensor<B, 3> {
    let k = t.dims()[2];
    let mut acc = t.clone().narrow(2, 0, 1);
    let mut parts = vec![acc.clone()];
    for i in 1..k {
        acc = acc + t.clone().narrow(2, i, 1);
        parts.push(acc.clone());
    }
    Tensor::cat(parts, 2)
}

/// Knot positions on `[-bound, bound]` from raw bin parameters.
///
/// Softmax fractions with a minimum bin size; the first and last knots are
/// pinned exactly to the interval edges.
fn knot_positions<B: Backend>(raw: Tensor<B, 3>, min_bin: f64, bound: f64) -> Tensor<B, 3> {
    let [batch, d, k] = raw.dims();
    let device = raw.device();
    let fractions = softmax(raw, 2) * (1.0 - min_bin * k as f64) + min_bin;
    let inner = cumsum_last(fractions).narrow(2, 0, k - 1) * (2.0 * bound) - bound;
    let lo = Tensor::full([batch, d, 1], -bound, &device);
    let hi = Tensor::full([batch, d, 1], bound, &device);
    Tensor::cat(vec![lo, inner, hi], 2)
}

/// Interior derivatives through softplus, boundary derivatives pinned to 1
/// for the linear tails. Result shape `(batch, d, k + 1)`.
fn pad_derivatives<B: Backend>(raw: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, d, _] = raw.dims();
    let device = raw.device();
    let interior = softplus(raw, 1.0) + MIN_DERIVATIVE;
    let edge = Tensor::ones([batch, d, 1], &device);
    Tensor::cat(vec![edge.clone(), interior, edge], 2)
}

/// Bin index of each input among the first `k` knots, shape `(batch, d, 1)`.
fn bucketize<B: Backend>(x: &Tensor<B, 2>, knots: &Tensor<B, 3>, k: usize) -> Tensor<B, 3, Int> {
    let lower_edges = knots.clone().narrow(2, 0, k);
    let ge = x.clone().unsqueeze_dim::<3>(2).greater_equal(lower_edges);
    (ge.int().sum_dim(2) - 1).clamp(0i64, (k - 1) as i64)
}

/// Gather the per-element bin quantity selected by `idx`, shape `(batch, d)`.
fn take_bin<B: Backend>(t: &Tensor<B, 3>, idx: &Tensor<B, 3, Int>) -> Tensor<B, 2> {
    t.clone().gather(2, idx.clone()).squeeze::<2>(2)
}

/// Evaluate the monotonic rational-quadratic spline element-wise.
///
/// Forward maps x-knots to y-knots; with `invert` set the inputs are treated
/// as y-values and the closed-form per-segment quadratic solution is used.
/// Inputs beyond the tail bound pass through unchanged with zero
/// log-determinant. Returns `(outputs, per-element logdet)`, both
/// `(batch, d)`; in the inverse direction the log-determinant of the inverse
/// map is returned directly.
fn rational_quadratic<B: Backend>(
    inputs: Tensor<B, 2>,
    params: SplineParams<B>,
    bound: f64,
    invert: bool,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let k = params.widths.dims()[2];

    let x_knots = knot_positions(params.widths, MIN_BIN_WIDTH, bound);
    let y_knots = knot_positions(params.heights, MIN_BIN_HEIGHT, bound);
    let derivs = pad_derivatives(params.derivatives);

    let bin_w = x_knots.clone().narrow(2, 1, k) - x_knots.clone().narrow(2, 0, k);
    let bin_h = y_knots.clone().narrow(2, 1, k) - y_knots.clone().narrow(2, 0, k);

    let outside = inputs.clone().abs().greater_elem(bound);
    let clamped = inputs.clone().clamp(-bound, bound);

    // Bucket on x-knots in the forward direction, y-knots in the inverse.
    let idx = if invert {
        bucketize(&clamped, &y_knots, k)
    } else {
        bucketize(&clamped, &x_knots, k)
    };

    let w_k = take_bin(&bin_w, &idx);
    let h_k = take_bin(&bin_h, &idx);
    let x_k = take_bin(&x_knots, &idx);
    let y_k = take_bin(&y_knots, &idx);
    let d_k = take_bin(&derivs, &idx);
    let d_k1 = take_bin(&derivs, &(idx + 1));
    let s_k = h_k.clone() / w_k.clone();
    // d_{k+1} + d_k - 2 s_k, shared by both directions.
    let dsum = d_k1.clone() + d_k.clone() - s_k.clone() * 2.0;

    let (mapped, theta) = if invert {
        let dy = clamped - y_k;
        let a = h_k.clone() * (s_k.clone() - d_k.clone()) + dy.clone() * dsum.clone();
        let b = h_k * d_k.clone() - dy.clone() * dsum.clone();
        let c = s_k.clone().neg() * dy;
        let disc = (b.clone().powf_scalar(2.0) - a * c.clone() * 4.0).clamp_min(0.0);
        let theta = c * 2.0 / (b.neg() - disc.sqrt());
        (theta.clone() * w_k + x_k, theta)
    } else {
        let theta = (clamped - x_k) / w_k;
        let tt = theta.clone() * (theta.clone().neg() + 1.0);
        let numerator =
            h_k * (s_k.clone() * theta.clone().powf_scalar(2.0) + d_k.clone() * tt.clone());
        let denominator = s_k.clone() + dsum.clone() * tt;
        (y_k + numerator / denominator, theta)
    };

    // log |dy/dx| at theta; shared between directions, negated for inverse.
    let tt = theta.clone() * (theta.clone().neg() + 1.0);
    let one_minus = theta.clone().neg() + 1.0;
    let denominator = s_k.clone() + dsum * tt.clone();
    let deriv_numerator = s_k.clone().powf_scalar(2.0)
        * (d_k1 * theta.powf_scalar(2.0) + s_k * tt * 2.0 + d_k * one_minus.powf_scalar(2.0));
    let logdet_fwd = deriv_numerator.log() - denominator.log() * 2.0;
    let logdet = if invert { logdet_fwd.neg() } else { logdet_fwd };

    let outputs = mapped.mask_where(outside.clone(), inputs);
    let logdet = logdet.mask_fill(outside, 0.0);
    (outputs, logdet)
}
