//! Wiring between CLI arguments and the training and sampling entry points.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::Module;
use burn::prelude::*;
use burn::tensor::Distribution;

use energy::{EnergyOracle, HarmonicOracle};
use flows::{Bijection, CouplingKind, FlowNetworkConfig};
use training::{
    load_network, save_network, train, DiagnosticTrajectory, RunWorkspace, SplitDataset,
    TracingSink, TrainingConfig,
};

type SampleBackend = NdArray<f32>;
type TrainBackend = Autodiff<SampleBackend>;

pub struct TrainArgs {
    pub coords: PathBuf,
    pub output_dir: PathBuf,
    pub name: String,
    pub overwrite: bool,
    pub load_network: Option<PathBuf>,
    pub backbone: Option<Vec<usize>>,
    pub coupling_layers: usize,
    pub coupling: String,
    pub spline_bins: usize,
    pub tail_bound: f64,
    pub hidden_features: usize,
    pub hidden_layers: usize,
    pub dropout: f64,
    pub network_seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    pub warmup_epochs: usize,
    pub init_lr: f64,
    pub final_lr: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f32,
    pub validation_fraction: f64,
    pub seed: u64,
    pub log_freq: usize,
    pub no_train_example: bool,
    pub train_energy: bool,
    pub example_weight: f64,
    pub energy_weight: f64,
    pub temperature: f64,
    pub energy_high: f64,
    pub energy_max: f64,
}

pub struct SampleArgs {
    pub model: PathBuf,
    pub coords: PathBuf,
    pub output: PathBuf,
    pub n_samples: usize,
    pub temperature: f64,
    pub backbone: Option<Vec<usize>>,
    pub coupling_layers: usize,
    pub coupling: String,
    pub spline_bins: usize,
    pub tail_bound: f64,
    pub hidden_features: usize,
    pub hidden_layers: usize,
    pub network_seed: u64,
    pub seed: u64,
}

fn parse_coupling(name: &str) -> anyhow::Result<CouplingKind> {
    match name {
        "affine" => Ok(CouplingKind::Affine),
        "spline" => Ok(CouplingKind::Spline),
        other => bail!("unknown coupling kind {other:?}; expected \"affine\" or \"spline\""),
    }
}

/// Read a headerless CSV of conformations: one frame per row, 3N floats.
/// Returns the flat values in row-major order with the frame count and
/// per-frame dimension.
fn read_frames(path: &Path) -> anyhow::Result<(Vec<f32>, usize, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut flat = Vec::new();
    let mut dim = 0usize;
    let mut n_frames = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading {} line {line}", path.display()))?;
        if n_frames == 0 {
            dim = record.len();
        } else if record.len() != dim {
            bail!(
                "{} line {line}: expected {dim} values, found {}",
                path.display(),
                record.len()
            );
        }
        for field in record.iter() {
            let value: f32 = field
                .trim()
                .parse()
                .with_context(|| format!("{} line {line}: bad value {field:?}", path.display()))?;
            flat.push(value);
        }
        n_frames += 1;
    }

    if n_frames == 0 {
        bail!("{} contains no frames", path.display());
    }
    if dim == 0 || dim % 3 != 0 {
        bail!(
            "{}: per-frame dimension {dim} is not a multiple of 3",
            path.display()
        );
    }
    Ok((flat, n_frames, dim))
}

fn write_diagnostics(path: &Path, trajectory: &DiagnosticTrajectory) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for row in trajectory.rows() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_frames(path: &Path, frames: Tensor<SampleBackend, 2>) -> anyhow::Result<()> {
    let [n, dim] = frames.dims();
    let values: Vec<f32> = frames
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("reading frame tensor: {e:?}"))?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for i in 0..n {
        let record: Vec<String> = values[i * dim..(i + 1) * dim]
            .iter()
            .map(f32::to_string)
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_samples(
    path: &Path,
    samples: Tensor<SampleBackend, 2>,
    energies: Tensor<SampleBackend, 1>,
) -> anyhow::Result<()> {
    let [n, dim] = samples.dims();
    let coords: Vec<f32> = samples
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("reading sample tensor: {e:?}"))?;
    let energy: Vec<f32> = energies
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("reading energy tensor: {e:?}"))?;

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for i in 0..n {
        let mut record: Vec<String> = coords[i * dim..(i + 1) * dim]
            .iter()
            .map(f32::to_string)
            .collect();
        record.push(energy[i].to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let config = TrainingConfig::new()
        .with_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_warmup_epochs(args.warmup_epochs)
        .with_init_lr(args.init_lr)
        .with_final_lr(args.final_lr)
        .with_weight_decay(args.weight_decay)
        .with_max_grad_norm(args.max_grad_norm)
        .with_validation_fraction(args.validation_fraction)
        .with_train_example(!args.no_train_example)
        .with_train_energy(args.train_energy)
        .with_example_weight(args.example_weight)
        .with_energy_weight(args.energy_weight)
        .with_temperature(args.temperature)
        .with_energy_high(args.energy_high)
        .with_energy_max(args.energy_max)
        .with_log_freq(args.log_freq)
        .with_seed(args.seed);
    config.validate()?;

    let (flat, n_frames, dim) = read_frames(&args.coords)?;
    let n_atoms = dim / 3;
    let backbone: Vec<usize> = args.backbone.unwrap_or_else(|| (0..n_atoms).collect());
    tracing::info!(n_frames, n_atoms, dim, "Loaded conformation dataset");

    let workspace = RunWorkspace::new(&args.output_dir, &args.name);
    workspace.prepare(args.overwrite)?;
    config
        .save(workspace.config_path())
        .context("saving training config")?;

    let device = Default::default();
    TrainBackend::seed(args.seed);
    let frames = Tensor::<TrainBackend, 1>::from_floats(flat.as_slice(), &device)
        .reshape([n_frames, dim]);

    let net_config = FlowNetworkConfig::new(dim)
        .with_coupling_layers(args.coupling_layers)
        .with_coupling(parse_coupling(&args.coupling)?)
        .with_spline_bins(args.spline_bins)
        .with_tail_bound(args.tail_bound)
        .with_hidden_features(args.hidden_features)
        .with_hidden_layers(args.hidden_layers)
        .with_dropout(args.dropout)
        .with_seed(args.network_seed);

    let network = match &args.load_network {
        Some(path) => {
            tracing::info!(path = %path.display(), "Resuming from saved network record");
            load_network(&net_config, frames.clone(), &backbone, path, &device)?
        }
        None => net_config.init_with_reference(frames.clone(), &backbone, &device)?,
    };
    tracing::info!(
        num_params = network.num_params(),
        latent_dim = network.latent_dim(),
        n_layers = network.n_layers(),
        "Network ready"
    );

    let dataset = SplitDataset::split(frames, config.validation_fraction, config.seed)?;
    let oracle = HarmonicOracle::chain(n_atoms);
    let mut sink = TracingSink;

    let outcome = train(&config, network, &dataset, &oracle, &mut sink, &device)?;

    save_network(outcome.network, &workspace.model_path())?;
    write_diagnostics(&workspace.training_trajectory_path(), &outcome.diagnostics)?;
    write_frames(&workspace.decode_trajectory_path(), outcome.fixed_decode)?;
    write_samples(
        &workspace.sample_trajectory_path(),
        outcome.samples,
        outcome.sample_energies,
    )?;

    tracing::info!(
        model = %workspace.model_file().display(),
        diagnostics = %workspace.training_trajectory_path().display(),
        decode_trajectory = %workspace.decode_trajectory_path().display(),
        samples = %workspace.sample_trajectory_path().display(),
        "Run artifacts written"
    );
    Ok(())
}

pub fn run_sample(args: SampleArgs) -> anyhow::Result<()> {
    let (flat, n_frames, dim) = read_frames(&args.coords)?;
    let n_atoms = dim / 3;
    let backbone: Vec<usize> = args.backbone.unwrap_or_else(|| (0..n_atoms).collect());

    let device = Default::default();
    SampleBackend::seed(args.seed);
    let frames = Tensor::<SampleBackend, 1>::from_floats(flat.as_slice(), &device)
        .reshape([n_frames, dim]);

    // Dropout has no recorded parameters, so it can stay disabled here
    // regardless of the rate used in training.
    let net_config = FlowNetworkConfig::new(dim)
        .with_coupling_layers(args.coupling_layers)
        .with_coupling(parse_coupling(&args.coupling)?)
        .with_spline_bins(args.spline_bins)
        .with_tail_bound(args.tail_bound)
        .with_hidden_features(args.hidden_features)
        .with_hidden_layers(args.hidden_layers)
        .with_dropout(0.0)
        .with_seed(args.network_seed);
    let network = load_network(&net_config, frames, &backbone, &args.model, &device)?;

    let z = Tensor::<SampleBackend, 2>::random(
        [args.n_samples, network.latent_dim()],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let (samples, _) = network.inverse(z)?;

    let oracle = HarmonicOracle::chain(n_atoms);
    let energies = oracle.evaluate(samples.clone(), args.temperature)?;
    write_samples(&args.output, samples, energies)?;

    tracing::info!(
        n_samples = args.n_samples,
        output = %args.output.display(),
        "Sample batch written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_frames_happy_path() {
        let file = write_csv("0.0,1.0,2.0,3.0,4.0,5.0\n6.0,7.0,8.0,9.0,10.0,11.0\n");
        let (flat, n_frames, dim) = read_frames(file.path()).unwrap();
        assert_eq!(n_frames, 2);
        assert_eq!(dim, 6);
        assert_eq!(flat[7], 7.0);
    }

    #[test]
    fn test_read_frames_rejects_ragged_rows() {
        let file = write_csv("0.0,1.0,2.0\n3.0,4.0\n");
        assert!(read_frames(file.path()).is_err());
    }

    #[test]
    fn test_read_frames_rejects_non_cartesian_width() {
        let file = write_csv("0.0,1.0,2.0,3.0\n");
        assert!(read_frames(file.path()).is_err());
    }

    #[test]
    fn test_read_frames_rejects_empty_file() {
        let file = write_csv("");
        assert!(read_frames(file.path()).is_err());
    }

    #[test]
    fn test_parse_coupling() {
        assert_eq!(parse_coupling("affine").unwrap(), CouplingKind::Affine);
        assert_eq!(parse_coupling("spline").unwrap(), CouplingKind::Spline);
        assert!(parse_coupling("planar").is_err());
    }
}
