mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{SampleArgs, TrainArgs};

/// boltzgen: normalizing-flow Boltzmann generator for molecular conformations.
#[derive(Parser)]
#[command(name = "boltzgen", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training a flow and sampling from a trained one.
#[derive(Subcommand)]
enum Command {
    /// Train a flow network on a conformation dataset.
    Train {
        /// CSV of conformations, one frame per row, 3N coordinates per frame.
        #[arg(long)]
        coords: PathBuf,
        /// Directory for run artifacts.
        #[arg(long, default_value = "runs")]
        output_dir: PathBuf,
        /// Run name; artifacts are written as <name>.mpk, <name>.json, ...
        #[arg(long, default_value = "flow")]
        name: String,
        /// Replace artifacts from a previous run of the same name.
        #[arg(long)]
        overwrite: bool,
        /// Continue from a saved network record instead of a fresh one.
        #[arg(long)]
        load_network: Option<PathBuf>,
        /// Comma-separated backbone atom indices for the PCA block.
        /// Default: all atoms.
        #[arg(long, value_delimiter = ',')]
        backbone: Option<Vec<usize>>,
        /// Number of (permutation, coupling, coupling) blocks.
        #[arg(long, default_value_t = 4)]
        coupling_layers: usize,
        /// Coupling parameterization: "affine" or "spline".
        #[arg(long, default_value = "spline")]
        coupling: String,
        /// Spline bin count.
        #[arg(long, default_value_t = 8)]
        spline_bins: usize,
        /// Spline tail bound.
        #[arg(long, default_value_t = 5.0)]
        tail_bound: f64,
        /// Conditioner hidden width.
        #[arg(long, default_value_t = 128)]
        hidden_features: usize,
        /// Conditioner hidden depth.
        #[arg(long, default_value_t = 2)]
        hidden_layers: usize,
        /// Conditioner dropout fraction.
        #[arg(long, default_value_t = 0.5)]
        dropout: f64,
        /// Seed for the layer permutations.
        #[arg(long, default_value_t = 42)]
        network_seed: u64,
        /// Training epochs.
        #[arg(long, default_value_t = 1000)]
        epochs: usize,
        /// Batch size.
        #[arg(long, default_value_t = 1024)]
        batch_size: usize,
        /// Linear warmup epochs.
        #[arg(long, default_value_t = 10)]
        warmup_epochs: usize,
        /// Peak learning rate.
        #[arg(long, default_value_t = 1e-3)]
        init_lr: f64,
        /// Learning rate floor of the cosine decay.
        #[arg(long, default_value_t = 1e-5)]
        final_lr: f64,
        /// AdamW weight decay.
        #[arg(long, default_value_t = 1e-3)]
        weight_decay: f64,
        /// Maximum gradient norm for clipping.
        #[arg(long, default_value_t = 1.0)]
        max_grad_norm: f32,
        /// Fraction of frames held out for validation.
        #[arg(long, default_value_t = 0.1)]
        validation_fraction: f64,
        /// Seed for data split, sampling, and backend RNG.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Validation and diagnostic cadence in epochs.
        #[arg(long, default_value_t = 10)]
        log_freq: usize,
        /// Disable the maximum-likelihood term.
        #[arg(long)]
        no_train_example: bool,
        /// Enable the energy term.
        #[arg(long)]
        train_energy: bool,
        /// Weight on the maximum-likelihood term.
        #[arg(long, default_value_t = 1.0)]
        example_weight: f64,
        /// Weight on the energy term.
        #[arg(long, default_value_t = 1.0)]
        energy_weight: f64,
        /// Oracle temperature in kelvin.
        #[arg(long, default_value_t = 298.0)]
        temperature: f64,
        /// Start of logarithmic energy compression, reduced units.
        #[arg(long, default_value_t = 1e10)]
        energy_high: f64,
        /// Saturation point of the energy regularizer, reduced units.
        #[arg(long, default_value_t = 1e20)]
        energy_max: f64,
    },
    /// Decode prior samples from a trained network record.
    Sample {
        /// Saved network record (.mpk).
        #[arg(long)]
        model: PathBuf,
        /// CSV of reference conformations used when the network was built.
        #[arg(long)]
        coords: PathBuf,
        /// Output CSV: one decoded conformation per row plus a reduced energy
        /// column.
        #[arg(long)]
        output: PathBuf,
        /// Number of samples to decode.
        #[arg(long, default_value_t = 1024)]
        n_samples: usize,
        /// Oracle temperature in kelvin.
        #[arg(long, default_value_t = 298.0)]
        temperature: f64,
        /// Comma-separated backbone atom indices; must match training.
        #[arg(long, value_delimiter = ',')]
        backbone: Option<Vec<usize>>,
        #[arg(long, default_value_t = 4)]
        coupling_layers: usize,
        #[arg(long, default_value = "spline")]
        coupling: String,
        #[arg(long, default_value_t = 8)]
        spline_bins: usize,
        #[arg(long, default_value_t = 5.0)]
        tail_bound: f64,
        #[arg(long, default_value_t = 128)]
        hidden_features: usize,
        #[arg(long, default_value_t = 2)]
        hidden_layers: usize,
        #[arg(long, default_value_t = 42)]
        network_seed: u64,
        /// Seed for the latent draws.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            coords,
            output_dir,
            name,
            overwrite,
            load_network,
            backbone,
            coupling_layers,
            coupling,
            spline_bins,
            tail_bound,
            hidden_features,
            hidden_layers,
            dropout,
            network_seed,
            epochs,
            batch_size,
            warmup_epochs,
            init_lr,
            final_lr,
            weight_decay,
            max_grad_norm,
            validation_fraction,
            seed,
            log_freq,
            no_train_example,
            train_energy,
            example_weight,
            energy_weight,
            temperature,
            energy_high,
            energy_max,
        } => pipeline::run_train(TrainArgs {
            coords,
            output_dir,
            name,
            overwrite,
            load_network,
            backbone,
            coupling_layers,
            coupling,
            spline_bins,
            tail_bound,
            hidden_features,
            hidden_layers,
            dropout,
            network_seed,
            epochs,
            batch_size,
            warmup_epochs,
            init_lr,
            final_lr,
            weight_decay,
            max_grad_norm,
            validation_fraction,
            seed,
            log_freq,
            no_train_example,
            train_energy,
            example_weight,
            energy_weight,
            temperature,
            energy_high,
            energy_max,
        }),
        Command::Sample {
            model,
            coords,
            output,
            n_samples,
            temperature,
            backbone,
            coupling_layers,
            coupling,
            spline_bins,
            tail_bound,
            hidden_features,
            hidden_layers,
            network_seed,
            seed,
        } => pipeline::run_sample(SampleArgs {
            model,
            coords,
            output,
            n_samples,
            temperature,
            backbone,
            coupling_layers,
            coupling,
            spline_bins,
            tail_bound,
            hidden_features,
            hidden_layers,
            network_seed,
            seed,
        }),
    }
}
