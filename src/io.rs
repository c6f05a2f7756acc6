//! I/O utilities for saving and loading trained deltas and configurations.
//!
//! This module provides functionality for:
//! - Saving trainable parameters to safetensors format
//! - Loading them back into a model with the same layout
//! - Saving and loading the pipeline configuration as JSON

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::classifier::PromptForClassification;
use crate::config::PipelineConfig;
use crate::error::{PromptError, Result};
use crate::traits::ParameterTree;

/// Default filename for the trained parameters.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Default filename for the run configuration.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Trait for models whose trained state can be saved and restored.
pub trait SaveLoad {
    /// Get all saved tensors as a map of name -> tensor.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be read.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Overwrite parameters from a state dict.
    ///
    /// # Errors
    /// Returns an error if a name is missing or a shape differs.
    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()>;
}

impl SaveLoad for PromptForClassification {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .named_parameters()
            .into_iter()
            .filter(|p| p.is_trainable())
            .map(|p| (p.name, p.tensor))
            .collect())
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        for p in self.named_parameters().into_iter().filter(|p| p.is_trainable()) {
            let loaded = state_dict
                .remove(&p.name)
                .ok_or_else(|| PromptError::Io(format!("state dict has no tensor '{}'", p.name)))?;
            if loaded.dims() != p.tensor.dims() {
                return Err(PromptError::ShapeMismatch {
                    expected: p.tensor.dims().to_vec(),
                    actual: loaded.dims().to_vec(),
                });
            }
            let loaded = loaded
                .to_device(p.tensor.device())?
                .to_dtype(p.tensor.dtype())?;
            Var::from_tensor(&p.tensor)?.set(&loaded)?;
        }
        if let Some(extra) = state_dict.keys().next() {
            return Err(PromptError::Io(format!(
                "state dict has unexpected tensor '{extra}'"
            )));
        }
        Ok(())
    }
}

/// Save trained weights to a safetensors file.
///
/// # Errors
/// Returns an error if:
/// - Failed to get the state dict
/// - Failed to serialize tensors to safetensors format
/// - Failed to write file to disk
pub fn save_adapter_weights<P: AsRef<Path>>(model: &dyn SaveLoad, path: P) -> Result<()> {
    let state_dict = model.state_dict()?;
    let tensors: Vec<(&str, Tensor)> = state_dict
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();

    safetensors::tensor::serialize_to_file(tensors, &None, path.as_ref())
        .map_err(|e| PromptError::Io(format!("Failed to save safetensors: {e}")))?;

    Ok(())
}

/// Load trained weights from a safetensors file.
///
/// # Errors
/// Returns an error if:
/// - Failed to read file from disk
/// - Failed to parse safetensors format
/// - The file does not match the model's trainable parameters
pub fn load_adapter_weights<P: AsRef<Path>>(
    model: &mut dyn SaveLoad,
    path: P,
    device: &Device,
) -> Result<()> {
    let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
    model.load_state_dict(tensors)
}

/// Save a configuration to a JSON file.
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| PromptError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json).map_err(|e| PromptError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load a configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| PromptError::Io(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&json)
        .map_err(|e| PromptError::Io(format!("Failed to parse config: {e}")))?;

    Ok(config)
}

/// Write the trained weights and the run configuration into `dir`.
///
/// # Errors
/// Returns an error if the directory cannot be created or a write fails.
pub fn save_pretrained<P: AsRef<Path>>(
    model: &dyn SaveLoad,
    config: &PipelineConfig,
    dir: P,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|e| PromptError::Io(format!("Failed to create {}: {e}", dir.display())))?;
    save_adapter_weights(model, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
    save_config(config, dir.join(ADAPTER_CONFIG_FILENAME))?;
    info!(dir = %dir.display(), "saved trained parameters");
    Ok(())
}

/// Restore weights saved by [`save_pretrained`] and return the saved config.
///
/// # Errors
/// Returns an error if either file is missing or does not match the model.
pub fn load_pretrained<P: AsRef<Path>>(
    model: &mut dyn SaveLoad,
    dir: P,
    device: &Device,
) -> Result<PipelineConfig> {
    let dir = dir.as_ref();
    let config = load_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
    load_adapter_weights(model, dir.join(ADAPTER_WEIGHTS_FILENAME), device)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tiny_classifier;
    use tempfile::TempDir;

    fn max_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_state_dict_holds_only_trainable() -> anyhow::Result<()> {
        let model = tiny_classifier(true)?;
        let state = model.state_dict()?;
        assert!(state.contains_key("template.soft_embedding.weight"));
        assert!(!state.contains_key("plm.shared.weight"));
        assert!(state.keys().all(|k| k.starts_with("template.") || k.contains(".lora.")));
        Ok(())
    }

    #[test]
    fn test_save_load_pretrained() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let source = tiny_classifier(true)?;
        let mut config = PipelineConfig::default();
        config.device = "cpu".into();

        save_pretrained(&source, &config, temp_dir.path())?;
        assert!(temp_dir.path().join(ADAPTER_WEIGHTS_FILENAME).exists());
        assert!(temp_dir.path().join(ADAPTER_CONFIG_FILENAME).exists());

        let mut target = tiny_classifier(true)?;
        let loaded_config = load_pretrained(&mut target, temp_dir.path(), &device)?;
        assert_eq!(loaded_config, config);

        let expected = source.state_dict()?;
        let actual = target.state_dict()?;
        assert_eq!(expected.len(), actual.len());
        for (name, tensor) in &expected {
            assert!(max_diff(tensor, &actual[name])? < 1e-7, "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_load_rejects_other_layout() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("weights.safetensors");
        save_adapter_weights(&tiny_classifier(true)?, &path)?;

        let mut plain = tiny_classifier(false)?;
        assert!(load_adapter_weights(&mut plain, &path, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.json");

        let mut config = PipelineConfig::default();
        config.training.num_epochs = 3;
        save_config(&config, &config_path)?;

        let loaded: PipelineConfig = load_config(&config_path)?;
        assert_eq!(config, loaded);
        Ok(())
    }
}
