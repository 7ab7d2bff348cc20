use std::path::Path;

use anyhow::Context;
use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use flows::{FlowNetwork, FlowNetworkConfig};

/// Persist the full parameter record, coordinate statistics included.
pub fn save_network<B: Backend>(network: FlowNetwork<B>, path: &Path) -> anyhow::Result<()> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    network
        .save_file(path, &recorder)
        .with_context(|| format!("saving network record to {}", path.display()))?;
    Ok(())
}

/// Rebuild a network from its config and reference batch, then replace every
/// parameter from the record on disk. The reference batch only fixes tensor
/// shapes here; the recorded coordinate statistics overwrite the freshly
/// fitted ones.
pub fn load_network<B: Backend>(
    config: &FlowNetworkConfig,
    reference: Tensor<B, 2>,
    backbone_atoms: &[usize],
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<FlowNetwork<B>> {
    let network = config
        .init_with_reference(reference, backbone_atoms, device)
        .context("rebuilding network from config")?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let network = network
        .load_file(path, &recorder, device)
        .with_context(|| format!("loading network record from {}", path.display()))?;
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;
    use flows::Bijection;

    type TestBackend = NdArray<f32>;

    fn reference() -> Tensor<TestBackend, 2> {
        let device = Default::default();
        Tensor::random([50, 12], Distribution::Normal(0.0, 1.0), &device)
    }

    #[test]
    fn test_save_load_roundtrip_preserves_forward() {
        let device = Default::default();
        let config = FlowNetworkConfig::new(12)
            .with_coupling_layers(1)
            .with_hidden_features(8)
            .with_dropout(0.0);
        let backbone = [0, 1, 2, 3];
        let frames = reference();
        let network = config
            .init_with_reference::<TestBackend>(frames.clone(), &backbone, &device)
            .unwrap();

        let probe =
            Tensor::<TestBackend, 2>::random([4, 12], Distribution::Normal(0.0, 1.0), &device);
        let (z_before, ld_before) = network.forward(probe.clone()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        save_network(network, &path).unwrap();

        // Reload against a different reference batch; the record must win.
        let other = reference();
        let reloaded = load_network(&config, other, &backbone, &path, &device).unwrap();
        let (z_after, ld_after) = reloaded.forward(probe).unwrap();

        let z_err: f32 = (z_after - z_before).abs().max().into_scalar().elem();
        let ld_err: f32 = (ld_after - ld_before).abs().max().into_scalar().elem();
        assert!(z_err < 1e-6, "forward drift after reload: {z_err}");
        assert!(ld_err < 1e-6, "logdet drift after reload: {ld_err}");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let device = Default::default();
        let config = FlowNetworkConfig::new(12)
            .with_coupling_layers(1)
            .with_hidden_features(8)
            .with_dropout(0.0);
        let dir = tempfile::tempdir().unwrap();
        let out = load_network::<TestBackend>(
            &config,
            reference(),
            &[0, 1, 2, 3],
            &dir.path().join("absent"),
            &device,
        );
        assert!(out.is_err());
    }
}
