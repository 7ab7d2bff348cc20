use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::ConfigError;

/// Conformation frames split into train and validation partitions.
///
/// The split shuffles frame indices with a seeded RNG and slices them, so the
/// same seed always yields the same partition. Both partitions are dense
/// tensors; batches are drawn with replacement.
#[derive(Debug, Clone)]
pub struct SplitDataset<B: Backend> {
    train: Tensor<B, 2>,
    val: Tensor<B, 2>,
}

fn select_rows<B: Backend>(frames: &Tensor<B, 2>, indices: &[usize]) -> Tensor<B, 2> {
    let device = frames.device();
    let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    frames
        .clone()
        .select(0, Tensor::<B, 1, Int>::from_ints(idx.as_slice(), &device))
}

impl<B: Backend> SplitDataset<B> {
    /// Partition `frames` into held-out validation and training sets.
    pub fn split(
        frames: Tensor<B, 2>,
        validation_fraction: f64,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let [n_frames, _] = frames.dims();
        let n_val = ((n_frames as f64) * validation_fraction).round().max(1.0) as usize;
        if n_val >= n_frames {
            return Err(ConfigError::DatasetTooSmall {
                needed: n_val + 1,
                got: n_frames,
            });
        }

        let mut order: Vec<usize> = (0..n_frames).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        Ok(Self {
            val: select_rows(&frames, &order[..n_val]),
            train: select_rows(&frames, &order[n_val..]),
        })
    }

    pub fn n_train(&self) -> usize {
        self.train.dims()[0]
    }

    pub fn n_val(&self) -> usize {
        self.val.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.train.dims()[1]
    }

    /// Uniform batch with replacement from the training partition.
    pub fn sample_train(&self, batch_size: usize, rng: &mut impl Rng) -> Tensor<B, 2> {
        Self::sample(&self.train, batch_size, rng)
    }

    /// Uniform batch with replacement from the validation partition.
    pub fn sample_val(&self, batch_size: usize, rng: &mut impl Rng) -> Tensor<B, 2> {
        Self::sample(&self.val, batch_size, rng)
    }

    fn sample(frames: &Tensor<B, 2>, batch_size: usize, rng: &mut impl Rng) -> Tensor<B, 2> {
        let n = frames.dims()[0];
        let indices: Vec<usize> = (0..batch_size).map(|_| rng.gen_range(0..n)).collect();
        select_rows(frames, &indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;

    type TestBackend = NdArray<f32>;

    fn frames(n: usize) -> Tensor<TestBackend, 2> {
        // Row i is filled with the value i, so rows identify frames.
        let device = Default::default();
        let values: Vec<f32> = (0..n).flat_map(|i| [i as f32; 4]).collect();
        Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([n, 4])
    }

    fn row_ids(t: &Tensor<TestBackend, 2>) -> Vec<i64> {
        let flat: Vec<f32> = t.clone().into_data().to_vec().unwrap();
        flat.chunks(4).map(|row| row[0] as i64).collect()
    }

    #[test]
    fn test_split_is_disjoint_and_exhaustive() {
        let data = SplitDataset::split(frames(20), 0.25, 7).unwrap();
        assert_eq!(data.n_val(), 5);
        assert_eq!(data.n_train(), 15);
        assert_eq!(data.dim(), 4);

        let mut all = row_ids(&data.train);
        all.extend(row_ids(&data.val));
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_deterministic_per_seed() {
        let a = SplitDataset::split(frames(20), 0.25, 7).unwrap();
        let b = SplitDataset::split(frames(20), 0.25, 7).unwrap();
        assert_eq!(row_ids(&a.val), row_ids(&b.val));

        let c = SplitDataset::split(frames(20), 0.25, 8).unwrap();
        assert_ne!(row_ids(&a.val), row_ids(&c.val));
    }

    #[test]
    fn test_sampling_shapes_and_membership() {
        let data = SplitDataset::split(frames(10), 0.2, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let batch = data.sample_train(32, &mut rng);
        assert_eq!(batch.dims(), [32, 4]);

        let train_ids = row_ids(&data.train);
        for id in row_ids(&batch) {
            assert!(train_ids.contains(&id));
        }
    }

    #[test]
    fn test_tiny_dataset_rejected() {
        let out = SplitDataset::split(frames(1), 0.5, 0);
        assert!(matches!(out, Err(ConfigError::DatasetTooSmall { .. })));
    }
}
