//! Pretrained language model loading.
//!
//! A backbone is named by a model family (`t5`) and a path that is either a
//! local directory or a HuggingFace hub model id. The directory (or repo) must
//! hold `config.json`, `tokenizer.json` and `model.safetensors` (or a sharded
//! `model.safetensors.index.json`).

pub mod t5;
pub mod tokenizer;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PromptError, Result};
use crate::traits::AdapterConfig;
use t5::{T5Config, T5ForConditionalGeneration};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Which backbone to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlmConfig {
    /// Model family; only `t5` is supported.
    pub model_name: String,
    /// Local directory or hub model id.
    pub model_path: String,
    /// Hub revision, `main` when unset.
    #[serde(default)]
    pub revision: Option<String>,
}

impl Default for PlmConfig {
    fn default() -> Self {
        Self {
            model_name: "t5".into(),
            model_path: "t5-base".into(),
            revision: None,
        }
    }
}

impl AdapterConfig for PlmConfig {
    fn validate(&self) -> Result<()> {
        if self.model_name != "t5" {
            return Err(PromptError::InvalidConfig(format!(
                "unsupported model family '{}', only 't5' is available",
                self.model_name
            )));
        }
        if self.model_path.is_empty() {
            return Err(PromptError::InvalidConfig("model_path cannot be empty".into()));
        }
        Ok(())
    }
}

/// A loaded backbone with its tokenizer. The parsed `config.json` is
/// available as [`T5ForConditionalGeneration::config`].
pub struct Plm {
    /// The encoder-decoder.
    pub model: T5ForConditionalGeneration,
    /// Matching tokenizer.
    pub tokenizer: tokenizers::Tokenizer,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

fn model_load_err(context: &str) -> impl Fn(std::io::Error) -> PromptError + '_ {
    move |e| PromptError::ModelLoad(format!("{context}: {e}"))
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct WeightIndex {
        weight_map: HashMap<String, String>,
    }

    let json = fs::read_to_string(index_path).map_err(model_load_err("failed to read weight index"))?;
    let index: WeightIndex = serde_json::from_str(&json)
        .map_err(|e| PromptError::ModelLoad(format!("invalid weight index: {e}")))?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

fn local_files(dir: &Path) -> Result<ModelFiles> {
    let require = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(PromptError::ModelLoad(format!("missing {}", path.display())))
        }
    };
    let weights = if dir.join(WEIGHTS_FILE).is_file() {
        vec![dir.join(WEIGHTS_FILE)]
    } else {
        shard_names(&require(WEIGHTS_INDEX_FILE)?)?
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect()
    };
    Ok(ModelFiles {
        config: require(CONFIG_FILE)?,
        tokenizer: require(TOKENIZER_FILE)?,
        weights,
    })
}

fn hub_files(model_id: &str, revision: Option<&str>) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| PromptError::ModelLoad(format!("hub client: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.unwrap_or("main").to_string(),
    ));
    let get = |name: &str| -> Result<PathBuf> {
        repo.get(name)
            .map_err(|e| PromptError::ModelLoad(format!("failed to fetch {model_id}/{name}: {e}")))
    };

    let weights = match get(WEIGHTS_FILE) {
        Ok(path) => vec![path],
        Err(_) => shard_names(&get(WEIGHTS_INDEX_FILE)?)?
            .iter()
            .map(|shard| get(shard.as_str()))
            .collect::<Result<Vec<_>>>()?,
    };
    Ok(ModelFiles {
        config: get(CONFIG_FILE)?,
        tokenizer: get(TOKENIZER_FILE)?,
        weights,
    })
}

/// Copy checkpoint tensors into every variable of `var_map`.
///
/// `shared.weight` falls back to `encoder.embed_tokens.weight` for
/// checkpoints that only store the tied copy.
fn load_into_varmap(var_map: &VarMap, weights: &[PathBuf], device: &Device) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for path in weights {
        debug!(path = %path.display(), "reading weights");
        tensors.extend(candle_core::safetensors::load(path, device)?);
    }

    let vars = var_map
        .data()
        .lock()
        .map_err(|_| PromptError::ModelLoad("variable map lock poisoned".into()))?;
    for (name, var) in vars.iter() {
        let tensor = tensors
            .get(name)
            .or_else(|| {
                (name == "shared.weight")
                    .then(|| tensors.get("encoder.embed_tokens.weight"))
                    .flatten()
            })
            .ok_or_else(|| PromptError::ModelLoad(format!("checkpoint has no tensor '{name}'")))?;
        if tensor.dims() != var.dims() {
            return Err(PromptError::ShapeMismatch {
                expected: var.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Load a backbone, its tokenizer and its config.
///
/// # Errors
/// Returns `InvalidConfig` for unsupported families and `ModelLoad` when a
/// file is missing, unparsable, or lacks a weight the model needs.
pub fn load_plm(config: &PlmConfig, device: &Device) -> Result<Plm> {
    config.validate()?;

    let local = Path::new(&config.model_path);
    let files = if local.is_dir() {
        local_files(local)?
    } else {
        hub_files(&config.model_path, config.revision.as_deref())?
    };

    let json = fs::read_to_string(&files.config).map_err(model_load_err("failed to read config.json"))?;
    let t5_config: T5Config = serde_json::from_str(&json)
        .map_err(|e| PromptError::ModelLoad(format!("invalid config.json: {e}")))?;
    let tokenizer = tokenizers::Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| PromptError::ModelLoad(format!("invalid tokenizer.json: {e}")))?;

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    let model = T5ForConditionalGeneration::new(&t5_config, vb)?;
    load_into_varmap(&var_map, &files.weights, device)?;

    info!(
        model = %config.model_path,
        d_model = t5_config.d_model,
        layers = t5_config.num_layers,
        vocab = t5_config.vocab_size,
        "loaded pretrained backbone"
    );

    Ok(Plm { model, tokenizer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plm::tokenizer::{TextEncoder, PAD_TOKEN};
    use crate::test_utils::{tiny_t5_config, WORD_LEVEL_TOKENIZER_JSON};
    use crate::traits::ParameterTree;
    use candle_core::IndexOp;
    use tempfile::TempDir;

    #[test]
    fn test_only_t5_family_accepted() {
        let config = PlmConfig {
            model_name: "bert".into(),
            ..Default::default()
        };
        assert!(matches!(
            load_plm(&config, &Device::Cpu),
            Err(PromptError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_local_dir_missing_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = PlmConfig {
            model_path: dir.path().display().to_string(),
            ..Default::default()
        };
        assert!(matches!(
            load_plm(&config, &Device::Cpu),
            Err(PromptError::ModelLoad(_))
        ));
        Ok(())
    }

    #[test]
    fn test_weights_copied_into_variables() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = TempDir::new()?;
        let cfg = tiny_t5_config();

        // Write a checkpoint from one randomly initialized model.
        let source_vars = VarMap::new();
        let source = T5ForConditionalGeneration::new(
            &cfg,
            VarBuilder::from_varmap(&source_vars, DType::F32, &device),
        )?;
        let path = dir.path().join(WEIGHTS_FILE);
        source_vars.save(&path)?;

        // Load it into a second one.
        let target_vars = VarMap::new();
        let target = T5ForConditionalGeneration::new(
            &cfg,
            VarBuilder::from_varmap(&target_vars, DType::F32, &device),
        )?;
        load_into_varmap(&target_vars, &[path], &device)?;

        let a = source.shared_embedding().i(5)?;
        let b = target.shared_embedding().i(5)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-7);
        assert!(target.named_parameters().iter().all(|p| p.is_trainable()));
        Ok(())
    }

    #[test]
    fn test_missing_tensor_is_an_error() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = TempDir::new()?;
        let path = dir.path().join(WEIGHTS_FILE);
        let partial = VarMap::new();
        partial
            .get((4, 4), "unrelated.weight", candle_nn::init::ZERO, DType::F32, &device)?;
        partial.save(&path)?;

        let vars = VarMap::new();
        let _model = T5ForConditionalGeneration::new(
            &tiny_t5_config(),
            VarBuilder::from_varmap(&vars, DType::F32, &device),
        )?;
        assert!(matches!(
            load_into_varmap(&vars, &[path], &device),
            Err(PromptError::ModelLoad(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_plm_from_local_dir() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = TempDir::new()?;
        let cfg = tiny_t5_config();
        fs::write(dir.path().join(CONFIG_FILE), serde_json::to_string(&cfg)?)?;
        fs::write(dir.path().join(TOKENIZER_FILE), WORD_LEVEL_TOKENIZER_JSON)?;
        let vars = VarMap::new();
        let _source = T5ForConditionalGeneration::new(&cfg, VarBuilder::from_varmap(&vars, DType::F32, &device))?;
        vars.save(dir.path().join(WEIGHTS_FILE))?;

        let config = PlmConfig {
            model_path: dir.path().display().to_string(),
            ..Default::default()
        };
        let plm = load_plm(&config, &device)?;
        assert_eq!(plm.model.config().d_model, cfg.d_model);
        assert_eq!(plm.tokenizer.token_to_id(PAD_TOKEN), Some(0));
        assert_eq!(TextEncoder::encode(&plm.tokenizer, "yes no")?, vec![3, 4]);
        Ok(())
    }
}
