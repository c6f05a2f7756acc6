//! LoRA (Low-Rank Adaptation) implementation.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use candle_core::{Module, Tensor};
use candle_nn::{init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{PromptError, Result};
use crate::traits::{freeze_tensor, Adapter, AdapterConfig, NamedParameter, ParameterTree};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the update is scaled by `alpha / r`.
    pub alpha: usize,

    /// Dropout probability applied to the adapter input.
    #[serde(default)]
    pub dropout: f64,

    /// Dotted module keys to inject into (matched as name suffixes).
    #[serde(default = "default_modified_modules")]
    pub modified_modules: Vec<String>,

    /// Parameter keys that stay trainable after freezing.
    #[serde(default = "default_freeze_exclude")]
    pub freeze_exclude: Vec<String>,
}

fn default_modified_modules() -> Vec<String> {
    vec!["SelfAttention.q".into(), "SelfAttention.v".into()]
}

fn default_freeze_exclude() -> Vec<String> {
    vec!["deltas".into()]
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            dropout: 0.0,
            modified_modules: default_modified_modules(),
            freeze_exclude: default_freeze_exclude(),
        }
    }
}

impl LoraConfig {
    /// Scaling factor applied to the low-rank update.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PromptError::InvalidConfig("rank must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(PromptError::InvalidConfig("alpha must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(PromptError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// LoRA layer implementing low-rank adaptation.
///
/// Computes: `output = base_output + (dropout(x) @ A^T @ B^T) * scaling`
pub struct LoraLayer {
    /// Down projection: `in_features` → r
    lora_a: Linear,
    /// Up projection: r → `out_features`
    lora_b: Linear,
    scaling: f64,
    config: LoraConfig,
    in_features: usize,
    out_features: usize,
    /// Dotted name of the module this layer is attached to
    name: String,
}

impl LoraLayer {
    /// Create a new LoRA layer whose weights are variables of `vb`.
    ///
    /// A is drawn from `N(0, 1/in_features)` and B starts at zero, so a fresh
    /// layer leaves the wrapped projection unchanged.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or weight initialization fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: LoraConfig,
        name: impl Into<String>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;

        let scaling = config.scaling();
        let std = (1.0 / in_features as f64).sqrt();

        let a_weight = vb.pp("lora_a").get_with_hints(
            (config.r, in_features),
            "weight",
            init::Init::Randn { mean: 0.0, stdev: std },
        )?;
        let b_weight = vb
            .pp("lora_b")
            .get_with_hints((out_features, config.r), "weight", init::ZERO)?;

        Ok(Self {
            lora_a: Linear::new(a_weight, None),
            lora_b: Linear::new(b_weight, None),
            scaling,
            config,
            in_features,
            out_features,
            name: name.into(),
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// The dotted name this layer is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Adapter for LoraLayer {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let input = if train && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(input, self.config.dropout as f32)?
        } else {
            input.clone()
        };
        let lora_out = self.lora_a.forward(&input)?;
        let lora_out = self.lora_b.forward(&lora_out)?;
        let lora_out = (lora_out * self.scaling)?;

        match base_output {
            Some(base) => Ok(base.broadcast_add(&lora_out)?),
            None => Ok(lora_out),
        }
    }

    fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl ParameterTree for LoraLayer {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: format!("{}.lora_a.weight", self.name),
            tensor: self.lora_a.weight().clone(),
            is_delta: true,
        });
        out.push(NamedParameter {
            name: format!("{}.lora_b.weight", self.name),
            tensor: self.lora_b.weight().clone(),
            is_delta: true,
        });
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        let mut a = self.lora_a.weight().clone();
        let mut b = self.lora_b.weight().clone();
        freeze_tensor(&mut a, &format!("{}.lora_a.weight", self.name), true, exclude);
        freeze_tensor(&mut b, &format!("{}.lora_b.weight", self.name), true, exclude);
        self.lora_a = Linear::new(a, None);
        self.lora_b = Linear::new(b, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 8);
        assert_eq!(config.alpha, 16);
        assert_eq!(config.modified_modules, vec!["SelfAttention.q", "SelfAttention.v"]);
        assert!((config.scaling() - 2.0).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_invalid_rank() {
        let config = LoraConfig {
            r: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lora_config_invalid_dropout() {
        let config = LoraConfig {
            dropout: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fresh_layer_is_identity_on_base() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let layer = LoraLayer::new(16, 16, LoraConfig::default(), "m.lora", vb)?;

        let input = Tensor::randn(0f32, 1f32, (2, 5, 16), &device)?;
        let base = Tensor::randn(0f32, 1f32, (2, 5, 16), &device)?;
        let output = layer.forward(&input, Some(&base), false)?;

        let diff = (output - &base)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_varmap_layer_is_trainable() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let layer = LoraLayer::new(32, 24, LoraConfig::default(), "enc.q.lora", vb.pp("enc.q.lora"))?;

        let params = layer.named_parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "enc.q.lora.lora_a.weight");
        assert!(params.iter().all(|p| p.is_trainable() && p.is_delta));
        assert_eq!(var_map.all_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn test_freeze_without_deltas_key_detaches() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let mut layer = LoraLayer::new(8, 8, LoraConfig::default(), "m.lora", vb.pp("m.lora"))?;

        layer.freeze_except(&["deltas".to_string()]);
        assert!(layer.named_parameters().iter().all(NamedParameter::is_trainable));

        layer.freeze_except(&[]);
        assert!(layer.named_parameters().iter().all(|p| !p.is_trainable()));
        Ok(())
    }

    #[test]
    fn test_lora_num_parameters() -> anyhow::Result<()> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let layer = LoraLayer::new(768, 768, LoraConfig::default(), "m.lora", vb)?;

        // r * (in + out) = 8 * (768 + 768) = 12288
        assert_eq!(layer.num_parameters(), 12288);
        Ok(())
    }
}
