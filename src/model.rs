//! Model integration for LoRA deltas.
//!
//! This module provides functionality for:
//! - Pattern matching for dotted module names (e.g. `SelfAttention.q`, `*.attention`)
//! - Injectable linear projections ([`DeltaLinear`])
//! - Injecting adapters into a backbone, freezing it, and reporting parameter statistics

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{init, Linear, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::adapters::lora::{LoraConfig, LoraLayer};
use crate::error::Result;
use crate::traits::{freeze_tensor, Adapter, AdapterConfig, NamedParameter, ParameterTree};
use crate::training::format_parameter_count;

/// Pattern for matching module names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePattern {
    /// Match exact module name
    Exact(String),
    /// Match modules whose trailing dotted segments equal the suffix
    Suffix(String),
    /// Match modules starting with prefix (e.g., `layer.*`)
    Prefix(String),
    /// Match all modules
    All,
}

impl ModulePattern {
    /// Parse a pattern string into a `ModulePattern`.
    ///
    /// # Examples
    /// - `"*"` -> `All`
    /// - `"*.attention"` -> `Suffix`
    /// - `"layer.*"` -> `Prefix`
    /// - `"encoder.layer.0"` -> `Exact`
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" => Self::All,
            s if s.starts_with("*.") => Self::Suffix(s[2..].to_string()),
            s if s.ends_with(".*") => Self::Prefix(s[..s.len() - 2].to_string()),
            s => Self::Exact(s.to_string()),
        }
    }

    /// Parse a modified-module key.
    ///
    /// Keys without wildcards match as dotted suffixes, so `SelfAttention.q`
    /// selects every `*.SelfAttention.q` projection.
    #[must_use]
    pub fn from_module_key(key: &str) -> Self {
        match Self::parse(key) {
            Self::Exact(name) => Self::Suffix(name),
            other => other,
        }
    }

    /// Check if a module name matches this pattern.
    #[must_use]
    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            Self::Exact(name) => module_name == name,
            Self::Suffix(suffix) => {
                module_name == suffix
                    || module_name
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            Self::Prefix(prefix) => module_name
                .strip_prefix(prefix.as_str())
                .is_some_and(|tail| tail.is_empty() || tail.starts_with('.')),
            Self::All => true,
        }
    }
}

/// A bias-free linear projection that can carry an injected LoRA delta.
///
/// The base weight is never modified; the delta adds `scaling · B(A(x))` on top.
pub struct DeltaLinear {
    base: Linear,
    delta: Option<LoraLayer>,
    name: String,
    in_features: usize,
    out_features: usize,
}

impl DeltaLinear {
    /// Load a `[out_features, in_features]` weight from `vb` under `weight`.
    ///
    /// # Errors
    /// Returns an error if the variable cannot be created.
    pub fn new(
        in_features: usize,
        out_features: usize,
        name: impl Into<String>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight =
            vb.get_with_hints((out_features, in_features), "weight", init::DEFAULT_KAIMING_NORMAL)?;
        Ok(Self {
            base: Linear::new(weight, None),
            delta: None,
            name: name.into(),
            in_features,
            out_features,
        })
    }

    /// Dotted module name, e.g. `encoder.block.0.layer.0.SelfAttention.q`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// The frozen base weight.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.base.weight()
    }

    /// The injected delta, if any.
    #[must_use]
    pub fn delta(&self) -> Option<&LoraLayer> {
        self.delta.as_ref()
    }

    /// Attach a LoRA delta, replacing any previous one.
    pub fn attach(&mut self, delta: LoraLayer) {
        self.delta = Some(delta);
    }

    /// Apply the projection, adding the delta path when present.
    ///
    /// # Errors
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let base = self.base.forward(xs)?;
        match &self.delta {
            Some(delta) => delta.forward(xs, Some(&base), train),
            None => Ok(base),
        }
    }
}

impl ParameterTree for DeltaLinear {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: format!("{}.weight", self.name),
            tensor: self.base.weight().clone(),
            is_delta: false,
        });
        if let Some(delta) = &self.delta {
            delta.collect_parameters(out);
        }
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        let mut weight = self.base.weight().clone();
        freeze_tensor(&mut weight, &format!("{}.weight", self.name), false, exclude);
        self.base = Linear::new(weight, None);
        if let Some(delta) = &mut self.delta {
            delta.freeze_except(exclude);
        }
    }
}

/// A backbone whose linear projections can receive deltas.
pub trait DeltaBackbone: ParameterTree {
    /// Every injectable projection, in declaration order.
    fn linear_modules_mut(&mut self) -> Vec<&mut DeltaLinear>;

    /// Device the backbone lives on.
    fn device(&self) -> &Device;

    /// Parameter dtype of the backbone.
    fn dtype(&self) -> DType;
}

/// Parameter statistics reported after injection and freezing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    /// All parameters, frozen or not
    pub total: usize,
    /// Parameters that receive gradients
    pub trainable: usize,
    /// Parameters belonging to injected deltas
    pub delta: usize,
}

impl ParameterSummary {
    /// Summarize a parameter list.
    #[must_use]
    pub fn from_parameters(params: &[NamedParameter]) -> Self {
        params.iter().fold(
            Self {
                total: 0,
                trainable: 0,
                delta: 0,
            },
            |mut acc, p| {
                acc.total += p.numel();
                if p.is_trainable() {
                    acc.trainable += p.numel();
                }
                if p.is_delta {
                    acc.delta += p.numel();
                }
                acc
            },
        )
    }

    /// Trainable share of all parameters, in percent.
    #[must_use]
    pub fn trainable_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

/// LoRA delta manager for a backbone.
///
/// Owns the variables of every injected layer and records which modules were
/// modified. Injection mutates the backbone in place for its whole lifetime.
pub struct DeltaModel {
    config: LoraConfig,
    delta_vars: VarMap,
    modified_modules: Vec<String>,
}

impl DeltaModel {
    /// Inject LoRA layers into every projection of `backbone` matching
    /// `config.modified_modules`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a layer cannot be created.
    pub fn inject<B: DeltaBackbone>(backbone: &mut B, config: LoraConfig) -> Result<Self> {
        config.validate()?;

        let delta_vars = VarMap::new();
        let device = backbone.device().clone();
        let vb = VarBuilder::from_varmap(&delta_vars, backbone.dtype(), &device);
        let patterns: Vec<ModulePattern> = config
            .modified_modules
            .iter()
            .map(|key| ModulePattern::from_module_key(key))
            .collect();

        let mut modified_modules = Vec::new();
        for linear in backbone.linear_modules_mut() {
            if !patterns.iter().any(|p| p.matches(linear.name())) {
                continue;
            }
            let name = format!("{}.lora", linear.name());
            let layer = LoraLayer::new(
                linear.in_features(),
                linear.out_features(),
                config.clone(),
                name.clone(),
                vb.pp(name.as_str()),
            )?;
            debug!(module = linear.name(), rank = config.r, "injected lora delta");
            modified_modules.push(linear.name().to_string());
            linear.attach(layer);
        }

        if modified_modules.is_empty() {
            warn!(keys = ?config.modified_modules, "no module matched; backbone left unmodified");
        } else {
            info!(count = modified_modules.len(), "injected lora deltas");
        }

        Ok(Self {
            config,
            delta_vars,
            modified_modules,
        })
    }

    /// Freeze every backbone parameter not selected by `exclude`.
    pub fn freeze_module<B: ParameterTree>(&self, backbone: &mut B, exclude: &[String]) {
        backbone.freeze_except(exclude);
        debug!(?exclude, "froze backbone parameters");
    }

    /// Freeze with the configured exclusion keys.
    pub fn freeze<B: ParameterTree>(&self, backbone: &mut B) {
        self.freeze_module(backbone, &self.config.freeze_exclude);
    }

    /// Log and return parameter statistics of `backbone`.
    pub fn log<B: ParameterTree>(&self, backbone: &B) -> ParameterSummary {
        let summary = ParameterSummary::from_parameters(&backbone.named_parameters());
        info!(
            total = %format_parameter_count(summary.total),
            trainable = %format_parameter_count(summary.trainable),
            delta = %format_parameter_count(summary.delta),
            ratio = format!("{:.4}%", summary.trainable_ratio()),
            modified = self.modified_modules.len(),
            "delta model parameters"
        );
        summary
    }

    /// Names of the modules that received a delta.
    #[must_use]
    pub fn modified_modules(&self) -> &[String] {
        &self.modified_modules
    }

    /// Variables of every injected layer.
    #[must_use]
    pub fn delta_vars(&self) -> &VarMap {
        &self.delta_vars
    }

    /// The LoRA configuration used for injection.
    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plm::t5::T5ForConditionalGeneration;
    use crate::test_utils::tiny_t5_config;

    #[test]
    fn test_module_pattern_exact() {
        let pattern = ModulePattern::parse("encoder.layer.0");
        assert!(pattern.matches("encoder.layer.0"));
        assert!(!pattern.matches("encoder.layer.1"));
        assert!(!pattern.matches("decoder.layer.0"));
    }

    #[test]
    fn test_module_pattern_suffix() {
        let pattern = ModulePattern::parse("*.attention");
        assert!(pattern.matches("layer.0.attention"));
        assert!(pattern.matches("encoder.layer.0.attention"));
        assert!(!pattern.matches("attention.output"));
        assert!(!pattern.matches("layer.0.crossattention"));
    }

    #[test]
    fn test_module_pattern_prefix() {
        let pattern = ModulePattern::parse("encoder.*");
        assert!(pattern.matches("encoder.layer.0"));
        assert!(pattern.matches("encoder.attention"));
        assert!(!pattern.matches("decoder.layer.0"));
        assert!(!pattern.matches("encoders.layer.0"));
    }

    #[test]
    fn test_module_pattern_all() {
        let pattern = ModulePattern::parse("*");
        assert!(pattern.matches("anything"));
        assert!(pattern.matches(""));
    }

    #[test]
    fn test_module_key_is_dotted_suffix() {
        let pattern = ModulePattern::from_module_key("SelfAttention.q");
        assert!(pattern.matches("encoder.block.3.layer.0.SelfAttention.q"));
        assert!(pattern.matches("decoder.block.0.layer.0.SelfAttention.q"));
        assert!(!pattern.matches("decoder.block.0.layer.1.EncDecAttention.q"));
        assert!(!pattern.matches("encoder.block.3.layer.0.SelfAttention.qk"));
    }

    fn tiny_backbone() -> anyhow::Result<(T5ForConditionalGeneration, VarMap)> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = T5ForConditionalGeneration::new(&tiny_t5_config(), vb)?;
        Ok((model, var_map))
    }

    #[test]
    fn test_inject_self_attention_q_v() -> anyhow::Result<()> {
        let (mut backbone, _vars) = tiny_backbone()?;
        let delta = DeltaModel::inject(&mut backbone, LoraConfig::default())?;

        // 2 encoder + 2 decoder blocks, q and v each
        assert_eq!(delta.modified_modules().len(), 8);
        assert!(delta
            .modified_modules()
            .iter()
            .all(|m| m.ends_with("SelfAttention.q") || m.ends_with("SelfAttention.v")));
        assert_eq!(delta.delta_vars().all_vars().len(), 16);
        Ok(())
    }

    #[test]
    fn test_empty_module_list_injects_nothing() -> anyhow::Result<()> {
        let (mut backbone, _vars) = tiny_backbone()?;
        let config = LoraConfig {
            modified_modules: Vec::new(),
            ..Default::default()
        };
        let delta = DeltaModel::inject(&mut backbone, config)?;
        assert!(delta.modified_modules().is_empty());
        Ok(())
    }

    #[test]
    fn test_freeze_leaves_only_deltas_trainable() -> anyhow::Result<()> {
        let (mut backbone, _vars) = tiny_backbone()?;
        let before = ParameterSummary::from_parameters(&backbone.named_parameters());
        assert_eq!(before.trainable, before.total);

        let delta = DeltaModel::inject(&mut backbone, LoraConfig::default())?;
        delta.freeze(&mut backbone);

        let params = backbone.named_parameters();
        for p in &params {
            assert_eq!(p.is_trainable(), p.is_delta, "{}", p.name);
        }
        let summary = delta.log(&backbone);
        assert_eq!(summary.trainable, summary.delta);
        assert!(summary.trainable > 0);
        assert!(summary.trainable_ratio() < 100.0);
        Ok(())
    }
}
