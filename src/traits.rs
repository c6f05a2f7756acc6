//! Core traits shared by adapters and backbone modules.

use candle_core::Tensor;

use crate::Result;

/// Configuration trait for validated hyperparameter sections.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Core adapter trait for parameter-efficient fine-tuning.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass applying the adapter transformation.
    ///
    /// # Arguments
    /// * `input` - Input tensor
    /// * `base_output` - Optional output from the base layer (for residual adapters)
    /// * `train` - Whether dropout is active
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>, train: bool)
        -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// A named parameter as seen by freezing, logging and optimizer grouping.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    /// Dotted parameter name, e.g. `encoder.block.0.layer.0.SelfAttention.q.weight`.
    pub name: String,
    /// The parameter tensor. Trainable parameters are candle variables.
    pub tensor: Tensor,
    /// Whether the parameter belongs to an injected adapter.
    pub is_delta: bool,
}

impl NamedParameter {
    /// Whether gradients flow into this parameter.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.tensor.is_variable()
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.tensor.elem_count()
    }
}

/// Modules that own parameters and can enumerate or freeze them.
pub trait ParameterTree {
    /// Append every parameter of this module to `out`, in declaration order.
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>);

    /// Detach every parameter whose name is not selected by `exclude`.
    ///
    /// The key `deltas` selects all injected adapter parameters; any other key
    /// selects parameters whose name contains it.
    fn freeze_except(&mut self, exclude: &[String]);

    /// All parameters of this module.
    #[must_use]
    fn named_parameters(&self) -> Vec<NamedParameter> {
        let mut out = Vec::new();
        self.collect_parameters(&mut out);
        out
    }
}

/// Whether a parameter survives `freeze_except(exclude)`.
#[must_use]
pub fn is_excluded_from_freeze(name: &str, is_delta: bool, exclude: &[String]) -> bool {
    exclude.iter().any(|key| {
        if key == "deltas" {
            is_delta
        } else {
            name.contains(key.as_str())
        }
    })
}

/// Detach `tensor` unless the parameter is excluded from freezing.
pub(crate) fn freeze_tensor(tensor: &mut Tensor, name: &str, is_delta: bool, exclude: &[String]) {
    if !is_excluded_from_freeze(name, is_delta, exclude) {
        *tensor = tensor.detach();
    }
}
