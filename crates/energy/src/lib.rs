//! Potential-energy evaluation for conformation batches.
//!
//! Oracles report reduced energies `u(x) = U(x) / kT` so downstream losses
//! stay temperature-consistent. The [`regularize`] module caps extreme
//! energies so that high-energy decoded samples cannot dominate gradients.

pub mod harmonic;
pub mod oracle;
pub mod regularize;

pub use harmonic::HarmonicOracle;
pub use oracle::{EnergyOracle, OracleError};
pub use regularize::regularize_energy;
