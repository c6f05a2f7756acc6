//! Pipeline configuration and device selection.

use std::path::PathBuf;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::adapters::lora::LoraConfig;
use crate::data::loader::LoaderConfig;
use crate::data::superglue::DatasetConfig;
use crate::error::{PromptError, Result};
use crate::plm::tokenizer::TokenizerConfig;
use crate::plm::PlmConfig;
use crate::prompts::template::TemplateConfig;
use crate::prompts::verbalizer::VerbalizerConfig;
use crate::training::TrainingConfig;
use crate::traits::AdapterConfig;

/// Everything a run needs. Missing sections take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset source and task.
    pub dataset: DatasetConfig,
    /// Backbone to load.
    pub plm: PlmConfig,
    /// Template text.
    pub template: TemplateConfig,
    /// Wrapper lengths and truncation.
    pub tokenizer: TokenizerConfig,
    /// Batching.
    pub loader: LoaderConfig,
    /// Injected deltas.
    pub lora: LoraConfig,
    /// Label words.
    pub verbalizer: VerbalizerConfig,
    /// Optimizer and epochs.
    pub training: TrainingConfig,
    /// `cpu`, `cuda[:N]` or `metal[:N]`.
    pub device: String,
    /// Where trained deltas are written; nothing is saved when unset.
    pub output_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            plm: PlmConfig::default(),
            template: TemplateConfig::default(),
            tokenizer: TokenizerConfig::default(),
            loader: LoaderConfig::default(),
            lora: LoraConfig::default(),
            verbalizer: VerbalizerConfig::default(),
            training: TrainingConfig::default(),
            device: "cuda:0".into(),
            output_dir: None,
        }
    }
}

impl AdapterConfig for PipelineConfig {
    fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.plm.validate()?;
        self.template.validate()?;
        self.tokenizer.validate()?;
        self.loader.validate()?;
        self.lora.validate()?;
        self.verbalizer.validate()?;
        self.training.validate()?;
        if self.verbalizer.num_classes != self.dataset.task.num_classes() {
            return Err(PromptError::InvalidConfig(format!(
                "verbalizer has {} classes but {:?} has {}",
                self.verbalizer.num_classes,
                self.dataset.task,
                self.dataset.task.num_classes()
            )));
        }
        parse_device(&self.device)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

fn parse_device(spec: &str) -> Result<DeviceSpec> {
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, n)) => {
            let n = n
                .parse::<usize>()
                .map_err(|_| PromptError::InvalidConfig(format!("bad device ordinal in '{spec}'")))?;
            (kind, n)
        }
        None => (spec, 0),
    };
    match kind {
        "cpu" if !spec.contains(':') => Ok(DeviceSpec::Cpu),
        "cuda" => Ok(DeviceSpec::Cuda(ordinal)),
        "metal" => Ok(DeviceSpec::Metal(ordinal)),
        _ => Err(PromptError::InvalidConfig(format!(
            "unknown device '{spec}', expected cpu, cuda[:N] or metal[:N]"
        ))),
    }
}

/// Open the device named by `spec`.
///
/// Accelerators are never silently replaced by the CPU.
///
/// # Errors
/// Returns `InvalidConfig` for an unparsable spec and `Device` when the
/// accelerator is not compiled in or not present.
pub fn select_device(spec: &str) -> Result<Device> {
    match parse_device(spec)? {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Cuda(n) => {
            if !candle_core::utils::cuda_is_available() {
                return Err(PromptError::Device(format!(
                    "'{spec}' requested but this build has no CUDA support"
                )));
            }
            Device::new_cuda(n).map_err(|e| PromptError::Device(format!("{spec}: {e}")))
        }
        DeviceSpec::Metal(n) => {
            if !candle_core::utils::metal_is_available() {
                return Err(PromptError::Device(format!(
                    "'{spec}' requested but this build has no Metal support"
                )));
            }
            Device::new_metal(n).map_err(|e| PromptError::Device(format!("{spec}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() -> anyhow::Result<()> {
        let config = PipelineConfig::default();
        config.validate()?;
        assert_eq!(config.device, "cuda:0");
        assert_eq!(config.training.num_epochs, 30);
        assert!(config.output_dir.is_none());
        Ok(())
    }

    #[test]
    fn test_partial_json_fills_defaults() -> anyhow::Result<()> {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"device": "cpu", "loader": {"max_seq_length": 64, "batch_size": 2}}"#)?;
        assert_eq!(config.device, "cpu");
        assert_eq!(config.loader.batch_size, 2);
        assert!(config.loader.shuffle_train);
        assert_eq!(config.lora, PipelineConfig::default().lora);
        Ok(())
    }

    #[test]
    fn test_parse_device() -> anyhow::Result<()> {
        assert_eq!(parse_device("cpu")?, DeviceSpec::Cpu);
        assert_eq!(parse_device("cuda")?, DeviceSpec::Cuda(0));
        assert_eq!(parse_device("cuda:1")?, DeviceSpec::Cuda(1));
        assert_eq!(parse_device("metal:0")?, DeviceSpec::Metal(0));
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
        assert!(parse_device("cpu:1").is_err());
        Ok(())
    }

    #[test]
    fn test_cpu_always_selectable() -> anyhow::Result<()> {
        assert!(matches!(select_device("cpu")?, Device::Cpu));
        Ok(())
    }

    #[test]
    fn test_class_count_must_match_task() {
        let mut config = PipelineConfig::default();
        config.verbalizer.num_classes = 2;
        config.verbalizer.label_words.pop();
        assert!(matches!(
            config.validate(),
            Err(PromptError::InvalidConfig(_))
        ));
    }
}
