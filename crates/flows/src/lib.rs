//! Invertible transforms for flow-based generative models of molecular
//! conformations.
//!
//! Every transform is a bijection on batched vectors that reports the log of
//! the absolute Jacobian determinant of the map, per sample, in both
//! directions. Transforms compose into a [`network::FlowNetwork`] whose
//! forward direction maps conformations to latent vectors and whose inverse
//! decodes latent vectors back into conformations.

pub mod conditioner;
pub mod coordinate;
pub mod coupling;
pub mod network;
pub mod permutation;
pub mod spline;
pub mod transform;

pub use conditioner::{Conditioner, ConditionerConfig};
pub use coordinate::CoordinateTransform;
pub use coupling::AffineCoupling;
pub use network::{CouplingKind, FlowLayer, FlowNetwork, FlowNetworkConfig};
pub use permutation::Permutation;
pub use spline::SplineCoupling;
pub use transform::{Bijection, FlowError};
