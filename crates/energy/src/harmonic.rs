use burn::prelude::*;

use crate::oracle::{reject_nan, EnergyOracle, OracleError};

/// Boltzmann constant in kJ/(mol K).
const KB: f64 = 0.008314;

/// Toy molecular potential: harmonic bonds, soft-core nonbonded repulsion,
/// and a weak centering restraint.
///
/// Useful as a stand-in for an external force field in tests and smoke runs.
/// All terms are smooth and bounded below, so energies are finite for any
/// finite coordinates.
#[derive(Debug, Clone)]
pub struct HarmonicOracle {
    n_atoms: usize,
    bonds: Vec<(usize, usize)>,
    /// Equilibrium bond length, nm.
    bond_length: f64,
    /// Bond force constant, kJ/(mol nm^2).
    force_constant: f64,
    /// Length scale of the nonbonded repulsion, nm.
    repulsion_radius: f64,
    /// Height of the repulsion at zero separation, kJ/mol.
    repulsion_strength: f64,
    /// Restraint on the centroid, kJ/(mol nm^2).
    centering_constant: f64,
}

impl HarmonicOracle {
    /// Linear chain of `n_atoms` with bonds between consecutive atoms.
    pub fn chain(n_atoms: usize) -> Self {
        let bonds = (0..n_atoms.saturating_sub(1)).map(|i| (i, i + 1)).collect();
        Self {
            n_atoms,
            bonds,
            bond_length: 0.15,
            force_constant: 1000.0,
            repulsion_radius: 0.1,
            repulsion_strength: 50.0,
            centering_constant: 10.0,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    fn atom<B: Backend>(coords: &Tensor<B, 3>, i: usize) -> Tensor<B, 2> {
        coords.clone().narrow(1, i, 1).squeeze::<2>(1)
    }

    fn squared_distance<B: Backend>(coords: &Tensor<B, 3>, i: usize, j: usize) -> Tensor<B, 1> {
        (Self::atom(coords, i) - Self::atom(coords, j))
            .powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
    }

    fn bonded(&self, i: usize, j: usize) -> bool {
        self.bonds.contains(&(i, j)) || self.bonds.contains(&(j, i))
    }
}

impl<B: Backend> EnergyOracle<B> for HarmonicOracle {
    fn evaluate(
        &self,
        coords: Tensor<B, 2>,
        temperature: f64,
    ) -> Result<Tensor<B, 1>, OracleError> {
        let [batch, dim] = coords.dims();
        if dim != 3 * self.n_atoms {
            return Err(OracleError::Evaluation(format!(
                "expected {} coordinates for {} atoms, got {dim}",
                3 * self.n_atoms,
                self.n_atoms
            )));
        }
        if temperature <= 0.0 {
            return Err(OracleError::Evaluation(format!(
                "temperature must be positive, got {temperature}"
            )));
        }

        let device = coords.device();
        let positions = coords.reshape([batch, self.n_atoms, 3]);
        let mut energy = Tensor::<B, 1>::zeros([batch], &device);

        for &(i, j) in &self.bonds {
            let dist = Self::squared_distance(&positions, i, j).sqrt();
            let stretch = dist.sub_scalar(self.bond_length);
            energy = energy + stretch.powf_scalar(2.0).mul_scalar(0.5 * self.force_constant);
        }

        // Bounded repulsion between nonbonded pairs keeps steric clashes
        // expensive without producing infinities at zero separation.
        let radius_sq = self.repulsion_radius * self.repulsion_radius;
        for i in 0..self.n_atoms {
            for j in (i + 1)..self.n_atoms {
                if self.bonded(i, j) {
                    continue;
                }
                let d2 = Self::squared_distance(&positions, i, j);
                let repulsion = d2.div_scalar(radius_sq).add_scalar(1.0).recip();
                energy = energy + repulsion.mul_scalar(self.repulsion_strength);
            }
        }

        let centroid = positions.mean_dim(1).squeeze::<2>(1);
        let restraint = centroid
            .powf_scalar(2.0)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(0.5 * self.centering_constant);
        energy = energy + restraint;

        reject_nan(energy.div_scalar(KB * temperature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestBackend = NdArray<f32>;
    type AdBackend = Autodiff<TestBackend>;

    /// Chain at the equilibrium bond length, centered at the origin.
    fn relaxed_chain(n_atoms: usize) -> Vec<f32> {
        let half = 0.15 * (n_atoms - 1) as f32 / 2.0;
        let mut coords = Vec::with_capacity(3 * n_atoms);
        for i in 0..n_atoms {
            coords.extend_from_slice(&[0.15 * i as f32 - half, 0.0, 0.0]);
        }
        coords
    }

    fn eval(coords: &[f32], temperature: f64) -> f32 {
        let device = Default::default();
        let n = coords.len() / 3;
        let c = Tensor::<TestBackend, 1>::from_floats(coords, &device)
            .reshape([1, 3 * n]);
        let oracle = HarmonicOracle::chain(n);
        EnergyOracle::<TestBackend>::evaluate(&oracle, c, temperature)
            .unwrap()
            .into_scalar()
            .elem()
    }

    #[test]
    fn test_relaxed_chain_near_minimum() {
        let relaxed = eval(&relaxed_chain(4), 300.0);
        let mut stretched = relaxed_chain(4);
        stretched[9] += 0.1;
        assert!(eval(&stretched, 300.0) > relaxed + 1.0);
    }

    #[test]
    fn test_reduced_energy_scales_with_temperature() {
        let coords = relaxed_chain(4);
        let cold = eval(&coords, 150.0);
        let hot = eval(&coords, 300.0);
        assert!((cold / hot - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_clash_penalized() {
        let spread = relaxed_chain(3);
        let mut folded = spread.clone();
        // Move atom 2 on top of atom 0.
        folded[6] = folded[0];
        folded[7] = folded[1];
        folded[8] = folded[2];
        assert!(eval(&folded, 300.0) > eval(&spread, 300.0));
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let device = Default::default();
        let c = Tensor::<TestBackend, 2>::zeros([1, 10], &device);
        let oracle = HarmonicOracle::chain(4);
        let out = EnergyOracle::<TestBackend>::evaluate(&oracle, c, 300.0);
        assert!(matches!(out, Err(OracleError::Evaluation(_))));
    }

    #[test]
    fn test_gradients_reach_coordinates() {
        let device = Default::default();
        let mut coords = relaxed_chain(4);
        coords[0] -= 0.05;
        let c = Tensor::<AdBackend, 1>::from_floats(coords.as_slice(), &device)
            .reshape([1, 12])
            .require_grad();
        let oracle = HarmonicOracle::chain(4);
        let energy = EnergyOracle::<AdBackend>::evaluate(&oracle, c.clone(), 300.0).unwrap();
        let grads = energy.sum().backward();
        let g: Vec<f32> = c.grad(&grads).unwrap().into_data().to_vec().unwrap();
        assert!(g.iter().any(|v| v.abs() > 1e-6));
    }
}
