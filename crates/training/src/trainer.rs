//! Flow training loop with a single AdamW optimizer over the whole network.
//!
//! Ties together the dataset split, the energy oracle, the two loss terms
//! and the metric sink into one epoch loop using warmup + cosine LR decay.

use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use rand::SeedableRng;
use thiserror::Error;

use energy::oracle::reject_nan;
use energy::{regularize_energy, EnergyOracle, OracleError};
use flows::{Bijection, FlowError, FlowNetwork};

use crate::config::{ConfigError, Objective, TrainingConfig};
use crate::data::SplitDataset;
use crate::loss::{energy_loss, example_loss};
use crate::metrics::{DiagnosticRow, DiagnosticTrajectory, EnergyStats, MetricSink};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Result of a finished run: the trained network, the diagnostic time
/// series, the fixed-latent decode at every logging epoch (one conformation
/// per row, in logging order), and a freshly sampled batch from the final
/// network.
pub struct TrainOutcome<B: AutodiffBackend> {
    pub network: FlowNetwork<B>,
    pub diagnostics: DiagnosticTrajectory,
    pub fixed_decode: Tensor<B::InnerBackend, 2>,
    pub final_train_loss: f64,
    pub samples: Tensor<B::InnerBackend, 2>,
    pub sample_energies: Tensor<B::InnerBackend, 1>,
}

/// Learning rate at a given epoch: linear warmup from 0 to `init_lr`, then
/// cosine decay from `init_lr` down to the `final_lr` floor.
pub fn lr_schedule(
    init_lr: f64,
    final_lr: f64,
    warmup_epochs: usize,
    epochs: usize,
    epoch: usize,
) -> f64 {
    if warmup_epochs > 0 && epoch < warmup_epochs {
        init_lr * (epoch + 1) as f64 / warmup_epochs as f64
    } else {
        let decay_epochs = epochs.saturating_sub(warmup_epochs).max(1);
        let progress = (epoch.saturating_sub(warmup_epochs)) as f64 / decay_epochs as f64;
        let progress = progress.min(1.0);
        final_lr + (init_lr - final_lr) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Forward-KL term: encode a data batch and score it under the latent prior.
fn example_objective<B: Backend>(
    network: &FlowNetwork<B>,
    batch: Tensor<B, 2>,
) -> Result<Tensor<B, 1>, TrainError> {
    let (z, logdet) = network.forward(batch)?;
    Ok(example_loss(z, logdet))
}

/// Reverse-KL term: decode latents and score them with the oracle.
fn energy_objective<B: Backend>(
    network: &FlowNetwork<B>,
    oracle: &impl EnergyOracle<B>,
    latents: Tensor<B, 2>,
    config: &TrainingConfig,
) -> Result<Tensor<B, 1>, TrainError> {
    let (x, logdet) = network.inverse(latents)?;
    let energies = reject_nan(oracle.evaluate(x, config.temperature)?)?;
    let regularized = regularize_energy(energies, config.energy_high, config.energy_max);
    Ok(energy_loss(regularized, logdet))
}

fn prior_batch<B: Backend>(
    batch_size: usize,
    latent_dim: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    Tensor::random(
        [batch_size, latent_dim],
        Distribution::Normal(0.0, 1.0),
        device,
    )
}

/// Run the training loop and return the trained network.
///
/// The objective is assembled per the config switches: maximum likelihood on
/// the dataset, energy of decoded prior samples, or a weighted sum of both.
/// Every `log_freq` epochs (and on the last epoch) the network is evaluated
/// without gradients on held-out data and on a fresh latent batch, a fixed
/// latent batch is decoded for the drift diagnostics, and one diagnostic row
/// is appended. Artifact persistence is the caller's concern.
pub fn train<B, O>(
    config: &TrainingConfig,
    mut network: FlowNetwork<B>,
    dataset: &SplitDataset<B>,
    oracle: &O,
    sink: &mut dyn MetricSink,
    device: &B::Device,
) -> Result<TrainOutcome<B>, TrainError>
where
    B: AutodiffBackend,
    O: EnergyOracle<B> + EnergyOracle<B::InnerBackend>,
{
    config.validate()?;
    let objective = config.objective()?;

    B::seed(config.seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
    let mut optimizer = AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.max_grad_norm)))
        .init();

    // One latent batch held fixed over the run. Its decoded energy and first
    // conformation are logged alongside the fresh-draw validation metrics.
    let n_diag = config.batch_size.min(64);
    let fixed_z: Tensor<B::InnerBackend, 2> =
        prior_batch(n_diag, network.latent_dim(), device);

    let mut diagnostics = DiagnosticTrajectory::with_expected_len(config.epochs, config.log_freq);
    let mut decode_frames: Vec<Tensor<B::InnerBackend, 2>> =
        Vec::with_capacity(config.epochs / config.log_freq + 1);
    let mut final_train_loss = f64::NAN;
    let train_start = Instant::now();

    tracing::info!(
        ?objective,
        epochs = config.epochs,
        batch_size = config.batch_size,
        n_train = dataset.n_train(),
        n_val = dataset.n_val(),
        "Starting flow training"
    );

    for epoch in 0..config.epochs {
        let lr = lr_schedule(
            config.init_lr,
            config.final_lr,
            config.warmup_epochs,
            config.epochs,
            epoch,
        );

        let loss = match objective {
            Objective::ExampleOnly => {
                let batch = dataset.sample_train(config.batch_size, &mut rng);
                example_objective(&network, batch)?.mul_scalar(config.example_weight)
            }
            Objective::EnergyOnly => {
                let z = prior_batch(config.batch_size, network.latent_dim(), device);
                energy_objective(&network, oracle, z, config)?.mul_scalar(config.energy_weight)
            }
            Objective::Both => {
                let batch = dataset.sample_train(config.batch_size, &mut rng);
                let z = prior_batch(config.batch_size, network.latent_dim(), device);
                example_objective(&network, batch)?.mul_scalar(config.example_weight)
                    + energy_objective(&network, oracle, z, config)?
                        .mul_scalar(config.energy_weight)
            }
        };
        let train_loss: f64 = loss.clone().into_scalar().elem();
        final_train_loss = train_loss;

        let grads = GradientsParams::from_grads(loss.backward(), &network);
        network = optimizer.step(lr.into(), network, grads);

        if epoch % config.log_freq == 0 || epoch + 1 == config.epochs {
            let valid_network = network.valid();

            // Validation losses carry the same weights as the training
            // objective so the two series stay on one scale.
            let val_batch = dataset.sample_val(config.batch_size, &mut rng).inner();
            let val_example_loss: f64 = example_objective(&valid_network, val_batch)?
                .mul_scalar(config.example_weight)
                .into_scalar()
                .elem();

            // Fresh prior draws score the reverse-KL objective each time.
            let z_val: Tensor<B::InnerBackend, 2> =
                prior_batch(n_diag, valid_network.latent_dim(), device);
            let (val_decoded, val_logdet) = valid_network.inverse(z_val)?;
            let val_energies = reject_nan(EnergyOracle::<B::InnerBackend>::evaluate(
                oracle,
                val_decoded,
                config.temperature,
            )?)?;
            let val_regularized =
                regularize_energy(val_energies, config.energy_high, config.energy_max);
            let stats = EnergyStats::from_tensor(val_regularized.clone())
                .ok_or_else(|| OracleError::Evaluation("empty energy batch".into()))?;
            let val_energy_loss: f64 = energy_loss(val_regularized, val_logdet)
                .mul_scalar(config.energy_weight)
                .into_scalar()
                .elem();

            // The fixed batch decodes through the current network, so its
            // energy tracks the network rather than sampling noise.
            let (decoded, _) = valid_network.inverse(fixed_z.clone())?;
            let fixed_energies = reject_nan(EnergyOracle::<B::InnerBackend>::evaluate(
                oracle,
                decoded.clone(),
                config.temperature,
            )?)?;
            let fixed_energy: f64 =
                regularize_energy(fixed_energies, config.energy_high, config.energy_max)
                    .mean()
                    .into_scalar()
                    .elem();
            // First conformation of the fixed batch, one row per log epoch.
            decode_frames.push(decoded.narrow(0, 0, 1));

            sink.record("lr", lr, epoch);
            sink.record("train_loss", train_loss, epoch);
            sink.record("val_example_loss", val_example_loss, epoch);
            sink.record("val_energy_loss", val_energy_loss, epoch);
            sink.record("sample_energy_mean", stats.mean, epoch);
            sink.record("fixed_decode_energy", fixed_energy, epoch);

            diagnostics.push(DiagnosticRow {
                epoch,
                lr,
                train_loss,
                val_example_loss,
                val_energy_loss,
                energy_mean: stats.mean,
                energy_median: stats.median,
                energy_min: stats.min,
            });

            tracing::info!(
                epoch,
                lr = format!("{lr:.2e}"),
                train_loss = format!("{train_loss:.4}"),
                val_example = format!("{val_example_loss:.4}"),
                val_energy = format!("{val_energy_loss:.4}"),
                energy_median = format!("{:.2}", stats.median),
                fixed_energy = format!("{fixed_energy:.2}"),
                "epoch"
            );
        }
    }

    // Fresh prior draws through the trained network, for downstream analysis.
    let valid_network = network.valid();
    let fresh_z: Tensor<B::InnerBackend, 2> =
        prior_batch(n_diag, valid_network.latent_dim(), device);
    let (samples, _) = valid_network.inverse(fresh_z)?;
    let sample_energies = reject_nan(EnergyOracle::<B::InnerBackend>::evaluate(
        oracle,
        samples.clone(),
        config.temperature,
    )?)?;
    let fixed_decode = Tensor::cat(decode_frames, 0);

    let stats = EnergyStats::from_tensor(sample_energies.clone())
        .ok_or_else(|| OracleError::Evaluation("empty energy batch".into()))?;
    tracing::info!(
        epochs = config.epochs,
        final_train_loss = format!("{final_train_loss:.4}"),
        sample_energy_mean = format!("{:.2}", stats.mean),
        sample_energy_median = format!("{:.2}", stats.median),
        sample_energy_min = format!("{:.2}", stats.min),
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training finished"
    );

    Ok(TrainOutcome {
        network,
        diagnostics,
        fixed_decode,
        final_train_loss,
        samples,
        sample_energies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lr_schedule() {
        let init = 1e-3;
        let fin = 1e-5;
        let warmup = 100;
        let total = 1000;

        // Warmup phase: step 0 ramps from init/100.
        let lr0 = lr_schedule(init, fin, warmup, total, 0);
        assert!((lr0 - init / 100.0).abs() < 1e-12, "epoch 0: got {lr0}");

        // Peak at the warmup boundary.
        let lr99 = lr_schedule(init, fin, warmup, total, 99);
        assert!((lr99 - init).abs() < 1e-12, "epoch 99: got {lr99}");
        let lr100 = lr_schedule(init, fin, warmup, total, 100);
        assert!((lr100 - init).abs() < 1e-12, "epoch 100: got {lr100}");

        // Cosine midpoint sits halfway between init and the floor.
        let mid = fin + (init - fin) * 0.5;
        let lr550 = lr_schedule(init, fin, warmup, total, 550);
        assert!((lr550 - mid).abs() < 1e-12, "epoch 550: got {lr550}");

        // The floor holds at and beyond the end.
        let lr_end = lr_schedule(init, fin, warmup, total, 1000);
        assert!((lr_end - fin).abs() < 1e-9, "epoch 1000: got {lr_end}");
        let lr_past = lr_schedule(init, fin, warmup, total, 5000);
        assert!((lr_past - fin).abs() < 1e-9, "epoch 5000: got {lr_past}");

        // No warmup: straight cosine from init.
        let lr_nw = lr_schedule(init, fin, 0, total, 0);
        assert!((lr_nw - init).abs() < 1e-12, "no-warmup epoch 0: got {lr_nw}");
    }

    #[test]
    fn test_lr_schedule_monotone_after_warmup() {
        let mut prev = f64::INFINITY;
        for epoch in 10..200 {
            let lr = lr_schedule(1e-3, 1e-5, 10, 200, epoch);
            assert!(lr <= prev + 1e-15, "lr increased at epoch {epoch}");
            assert!(lr >= 1e-5 - 1e-15, "lr fell below floor at epoch {epoch}");
            prev = lr;
        }
    }
}
