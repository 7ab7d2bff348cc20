//! Feed-forward conditioner networks for coupling transforms.

use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// Configuration for a coupling-layer conditioner MLP.
///
/// Maps the passive half of a coupling split to the per-dimension transform
/// parameters of the active half:
///
/// ```text
/// (batch, d_passive)
///   → Linear(d_passive → hidden) → SiLU → Dropout
///   → [Linear(hidden → hidden) → SiLU → Dropout] × (hidden_layers - 1)
///   → Linear(hidden → d_out)
///   → (batch, d_out)
/// ```
#[derive(Config, Debug)]
pub struct ConditionerConfig {
    /// Passive-half dimension.
    pub d_input: usize,
    /// Number of transform parameters produced (active dim × params per dim).
    pub d_output: usize,
    /// Hidden layer width.
    #[config(default = 128)]
    pub hidden_features: usize,
    /// Number of hidden layers (at least 1).
    #[config(default = 2)]
    pub hidden_layers: usize,
    /// Dropout probability applied after each SiLU activation.
    #[config(default = 0.0)]
    pub dropout: f64,
}

/// MLP mapping the passive half of a coupling split to transform parameters.
#[derive(Module, Debug)]
pub struct Conditioner<B: Backend> {
    input: Linear<B>,
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    dropout: Dropout,
}

impl ConditionerConfig {
    /// Initialize a conditioner with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conditioner<B> {
        let n_hidden = self.hidden_layers.max(1);
        let hidden = (1..n_hidden)
            .map(|_| LinearConfig::new(self.hidden_features, self.hidden_features).init(device))
            .collect();
        Conditioner {
            input: LinearConfig::new(self.d_input, self.hidden_features).init(device),
            hidden,
            output: LinearConfig::new(self.hidden_features, self.d_output).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> Conditioner<B> {
    /// Forward pass.
    ///
    /// Input shape: `(batch, d_input)`. Output shape: `(batch, d_output)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut h = self.dropout.forward(silu(self.input.forward(x)));
        for layer in &self.hidden {
            h = self.dropout.forward(silu(layer.forward(h)));
        }
        self.output.forward(h)
    }
}
