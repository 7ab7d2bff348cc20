use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Destination for scalar training metrics.
pub trait MetricSink {
    fn record(&mut self, name: &str, value: f64, epoch: usize);
}

/// Emits metrics as structured log events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, name: &str, value: f64, epoch: usize) {
        tracing::info!(epoch, name, value, "metric");
    }
}

/// Buffers metrics in memory, mainly for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<(String, f64, usize)>,
}

impl MemorySink {
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|&(_, v, _)| v)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, name: &str, value: f64, epoch: usize) {
        self.records.push((name.to_string(), value, epoch));
    }
}

/// Summary of a batch of reduced energies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnergyStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
}

impl EnergyStats {
    /// Host-side reduction. `None` when the batch is empty or the data
    /// cannot be read back as `f32`.
    pub fn from_tensor<B: Backend>(energies: Tensor<B, 1>) -> Option<Self> {
        let mut values: Vec<f32> = energies.into_data().to_vec().ok()?;
        if values.is_empty() {
            return None;
        }
        values.sort_by(f32::total_cmp);
        let n = values.len();
        let median = if n % 2 == 1 {
            values[n / 2] as f64
        } else {
            (values[n / 2 - 1] + values[n / 2]) as f64 / 2.0
        };
        Some(Self {
            mean: values.iter().map(|&v| v as f64).sum::<f64>() / n as f64,
            median,
            min: values[0] as f64,
        })
    }
}

/// One diagnostic checkpoint per logging epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRow {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub val_example_loss: f64,
    pub val_energy_loss: f64,
    pub energy_mean: f64,
    pub energy_median: f64,
    pub energy_min: f64,
}

/// Time series of diagnostics accumulated over a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticTrajectory {
    rows: Vec<DiagnosticRow>,
}

impl DiagnosticTrajectory {
    pub fn with_expected_len(epochs: usize, log_freq: usize) -> Self {
        Self {
            rows: Vec::with_capacity(epochs / log_freq + 1),
        }
    }

    pub fn push(&mut self, row: DiagnosticRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[DiagnosticRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_energy_stats_even_batch() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::from_floats([4.0, 1.0, 3.0, 2.0], &device);
        let stats = EnergyStats::from_tensor(e).unwrap();
        assert!((stats.mean - 2.5).abs() < 1e-9);
        assert!((stats.median - 2.5).abs() < 1e-9);
        assert!((stats.min - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_stats_odd_batch() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::from_floats([5.0, -1.0, 2.0], &device);
        let stats = EnergyStats::from_tensor(e).unwrap();
        assert!((stats.median - 2.0).abs() < 1e-9);
        assert!((stats.min - -1.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_stats_empty_batch() {
        let device = Default::default();
        let e = Tensor::<TestBackend, 1>::empty([0], &device);
        assert!(EnergyStats::from_tensor(e).is_none());
    }

    #[test]
    fn test_memory_sink_filters_by_name() {
        let mut sink = MemorySink::default();
        sink.record("loss", 1.0, 0);
        sink.record("lr", 0.1, 0);
        sink.record("loss", 0.5, 10);
        assert_eq!(sink.values("loss"), vec![1.0, 0.5]);
        assert_eq!(sink.len(), 3);
    }
}
