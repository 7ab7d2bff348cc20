//! Composite flow network: coordinate transform plus stacked coupling pairs.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinate::{CoordinateTransform, RIGID_BODY_DOF};
use crate::coupling::{alternating_mask, AffineCoupling};
use crate::permutation::Permutation;
use crate::spline::SplineCoupling;
use crate::transform::{Bijection, FlowError};

/// Which coupling parameterization the stack uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingKind {
    /// Per-dimension scale and shift.
    Affine,
    /// Monotonic rational-quadratic spline with linear tails.
    Spline,
}

impl fmt::Display for CouplingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Affine => write!(f, "affine"),
            Self::Spline => write!(f, "spline"),
        }
    }
}

/// A single element of the transform chain.
#[derive(Module, Debug)]
pub enum FlowLayer<B: Backend> {
    Coordinate(CoordinateTransform<B>),
    Permutation(Permutation<B>),
    Affine(AffineCoupling<B>),
    Spline(SplineCoupling<B>),
}

impl<B: Backend> Bijection<B> for FlowLayer<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        match self {
            Self::Coordinate(t) => t.forward(x),
            Self::Permutation(t) => t.forward(x),
            Self::Affine(t) => t.forward(x),
            Self::Spline(t) => t.forward(x),
        }
    }

    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        match self {
            Self::Coordinate(t) => t.inverse(y),
            Self::Permutation(t) => t.inverse(y),
            Self::Affine(t) => t.inverse(y),
            Self::Spline(t) => t.inverse(y),
        }
    }
}

/// Configuration for the standard flow stack.
///
/// The factory builds: one coordinate transform fit from a reference batch,
/// then `coupling_layers` repetitions of (random permutation, even-mask
/// coupling, odd-mask coupling). Each coupling receives its own freshly
/// constructed mask and conditioner.
#[derive(Config, Debug)]
pub struct FlowNetworkConfig {
    /// Full conformation dimension `D = 3 * n_atoms`.
    pub n_dim: usize,
    /// Number of (permutation, coupling, coupling) blocks.
    #[config(default = 4)]
    pub coupling_layers: usize,
    /// Coupling parameterization.
    #[config(default = "CouplingKind::Spline")]
    pub coupling: CouplingKind,
    /// Spline bin count (ignored for affine couplings).
    #[config(default = 8)]
    pub spline_bins: usize,
    /// Spline tail bound (ignored for affine couplings).
    #[config(default = 5.0)]
    pub tail_bound: f64,
    /// Conditioner hidden width.
    #[config(default = 128)]
    pub hidden_features: usize,
    /// Conditioner hidden depth.
    #[config(default = 2)]
    pub hidden_layers: usize,
    /// Conditioner dropout fraction.
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Seed for the layer permutations.
    #[config(default = 42)]
    pub seed: u64,
}

/// Ordered chain of reversible transforms with additive log-determinants.
///
/// `forward` maps conformations to latent vectors applying children in
/// order; `inverse` decodes latent vectors applying children in reverse.
/// Deriving `Module` exposes the union of all children's trainable
/// parameters to the optimizer and records the full parameter state,
/// including the frozen coordinate statistics, through burn recorders.
#[derive(Module, Debug)]
pub struct FlowNetwork<B: Backend> {
    layers: Vec<FlowLayer<B>>,
    dim: usize,
    latent_dim: usize,
}

impl FlowNetworkConfig {
    /// Build the network, fitting the coordinate transform from `reference`.
    pub fn init_with_reference<B: Backend>(
        &self,
        reference: Tensor<B, 2>,
        backbone_atoms: &[usize],
        device: &B::Device,
    ) -> Result<FlowNetwork<B>, FlowError> {
        let [_, dim] = reference.dims();
        if dim != self.n_dim {
            return Err(FlowError::Config(format!(
                "reference batch has {dim} features, config expects {}",
                self.n_dim
            )));
        }
        let latent_dim = self
            .n_dim
            .checked_sub(RIGID_BODY_DOF)
            .filter(|&l| l >= 2)
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "n_dim = {} leaves no splittable latent space",
                    self.n_dim
                ))
            })?;

        let coordinate = CoordinateTransform::fit(reference, backbone_atoms, device)?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut layers = Vec::with_capacity(1 + 3 * self.coupling_layers);
        layers.push(FlowLayer::Coordinate(coordinate));
        for _ in 0..self.coupling_layers {
            layers.push(FlowLayer::Permutation(Permutation::random(
                latent_dim, &mut rng,
            )));
            layers.push(self.coupling_layer(latent_dim, true, device)?);
            layers.push(self.coupling_layer(latent_dim, false, device)?);
        }

        Ok(FlowNetwork {
            layers,
            dim: self.n_dim,
            latent_dim,
        })
    }

    /// Explicit coupling factory: one mask, one conditioner, per call.
    fn coupling_layer<B: Backend>(
        &self,
        features: usize,
        even: bool,
        device: &B::Device,
    ) -> Result<FlowLayer<B>, FlowError> {
        let mask = alternating_mask(features, even);
        match self.coupling {
            CouplingKind::Affine => Ok(FlowLayer::Affine(AffineCoupling::new(
                &mask,
                self.hidden_features,
                self.hidden_layers,
                self.dropout,
                device,
            )?)),
            CouplingKind::Spline => Ok(FlowLayer::Spline(SplineCoupling::new(
                &mask,
                self.spline_bins,
                self.tail_bound,
                self.hidden_features,
                self.hidden_layers,
                self.dropout,
                device,
            )?)),
        }
    }
}

impl<B: Backend> FlowNetwork<B> {
    /// Conformation dimension `D`.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Latent dimension `D - 6`.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Number of chained transforms.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

impl<B: Backend> Bijection<B> for FlowNetwork<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        let [batch, _] = x.dims();
        let device = x.device();
        let mut h = x;
        let mut logdet = Tensor::zeros([batch], &device);
        for layer in &self.layers {
            let (next, ld) = layer.forward(h)?;
            h = next;
            logdet = logdet + ld;
        }
        Ok((h, logdet))
    }

    fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>), FlowError> {
        let [batch, _] = y.dims();
        let device = y.device();
        let mut h = y;
        let mut logdet = Tensor::zeros([batch], &device);
        for layer in self.layers.iter().rev() {
            let (next, ld) = layer.inverse(h)?;
            h = next;
            logdet = logdet + ld;
        }
        Ok((h, logdet))
    }
}
