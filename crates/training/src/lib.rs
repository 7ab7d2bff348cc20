//! Dual-objective training of flow networks against conformation data and
//! an energy oracle.

pub mod artifact;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;
pub mod workspace;

pub use artifact::{load_network, save_network};
pub use config::{ConfigError, Objective, TrainingConfig};
pub use data::SplitDataset;
pub use metrics::{DiagnosticTrajectory, EnergyStats, MemorySink, MetricSink, TracingSink};
pub use trainer::{train, TrainError, TrainOutcome};
pub use workspace::RunWorkspace;
