//! Batching of tokenized examples.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::example::InputExample;
use crate::error::{PromptError, Result};
use crate::plm::tokenizer::{T5TokenizerWrapper, TokenizedFeature};
use crate::prompts::template::MixedTemplate;
use crate::traits::AdapterConfig;

/// Loader section of the pipeline config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Encoder length used for training and evaluation batches.
    pub max_seq_length: usize,
    /// Examples per batch.
    pub batch_size: usize,
    /// Shuffle the training loader every epoch.
    #[serde(default = "default_shuffle")]
    pub shuffle_train: bool,
    /// Seed for shuffling; drawn from entropy when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_shuffle() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 256,
            batch_size: 4,
            shuffle_train: true,
            seed: None,
        }
    }
}

impl AdapterConfig for LoaderConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PromptError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.max_seq_length < 2 {
            return Err(PromptError::InvalidConfig(
                "max_seq_length must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// Stack one field of every feature into a `[B, len]` tensor.
fn stack(
    features: &[&TokenizedFeature],
    len: usize,
    device: &Device,
    pick: fn(&TokenizedFeature) -> &Vec<u32>,
) -> Result<Tensor> {
    let mut flat = Vec::with_capacity(features.len() * len);
    for feature in features {
        let row = pick(feature);
        if row.len() != len {
            return Err(PromptError::ShapeMismatch {
                expected: vec![len],
                actual: vec![row.len()],
            });
        }
        flat.extend_from_slice(row);
    }
    Ok(Tensor::from_vec(flat, (features.len(), len), device)?)
}

/// Stacked model input for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, L]` encoder ids.
    pub input_ids: Tensor,
    /// `[B, L]` encoder mask.
    pub attention_mask: Tensor,
    /// `[B, L]` soft rows, 0 for ordinary tokens.
    pub soft_token_ids: Tensor,
    /// `[B, D]` decoder ids.
    pub decoder_input_ids: Tensor,
    /// `[B, D]` loss position markers.
    pub loss_ids: Tensor,
    /// Label per example, -1 when unknown.
    pub labels: Vec<i64>,
    /// Row id per example.
    pub guids: Vec<i64>,
}

impl Batch {
    /// Stack `features` into tensors on `device`.
    ///
    /// # Errors
    /// Returns a `ShapeMismatch` error if the features differ in length.
    pub fn from_features(features: &[&TokenizedFeature], device: &Device) -> Result<Self> {
        let first = features
            .first()
            .ok_or_else(|| PromptError::InvalidConfig("cannot build an empty batch".into()))?;
        let enc_len = first.input_ids.len();
        let dec_len = first.decoder_input_ids.len();

        Ok(Self {
            input_ids: stack(features, enc_len, device, |f| &f.input_ids)?,
            attention_mask: stack(features, enc_len, device, |f| &f.attention_mask)?,
            soft_token_ids: stack(features, enc_len, device, |f| &f.soft_token_ids)?,
            decoder_input_ids: stack(features, dec_len, device, |f| &f.decoder_input_ids)?,
            loss_ids: stack(features, dec_len, device, |f| &f.loss_ids)?,
            labels: features.iter().map(|f| f.label).collect(),
            guids: features.iter().map(|f| f.guid).collect(),
        })
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch holds no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels as a `[B]` `u32` tensor for the loss.
    ///
    /// # Errors
    /// Returns a `Dataset` error if any example is unlabeled.
    pub fn label_tensor(&self) -> Result<Tensor> {
        let labels = self
            .labels
            .iter()
            .zip(&self.guids)
            .map(|(&label, guid)| {
                u32::try_from(label)
                    .map_err(|_| PromptError::Dataset(format!("example {guid} has no label")))
            })
            .collect::<Result<Vec<u32>>>()?;
        let n = labels.len();
        Ok(Tensor::from_vec(labels, n, self.input_ids.device())?)
    }
}

/// Wraps, tokenizes and batches a split.
///
/// Every example is tokenized once at construction; [`iter`](Self::iter)
/// reshuffles the order on every call when shuffling is on.
pub struct PromptDataLoader {
    features: Vec<TokenizedFeature>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    device: Device,
}

impl PromptDataLoader {
    /// Build a loader over `examples`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or an example fails to
    /// wrap or tokenize.
    pub fn new(
        examples: &[InputExample],
        template: &MixedTemplate,
        wrapper: &T5TokenizerWrapper<'_>,
        config: &LoaderConfig,
        shuffle: bool,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let wrapper = wrapper.with_max_seq_length(config.max_seq_length)?;
        let features = examples
            .iter()
            .map(|example| wrapper.tokenize_one_example(&template.wrap_one_example(example)?))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            examples = features.len(),
            batch_size = config.batch_size,
            shuffle,
            "built prompt data loader"
        );
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            features,
            batch_size: config.batch_size,
            shuffle,
            rng,
            device: device.clone(),
        })
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the loader holds no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Number of batches per pass, counting a trailing partial batch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.features.len().div_ceil(self.batch_size)
    }

    /// Tokenized examples in dataset order.
    #[must_use]
    pub fn features(&self) -> &[TokenizedFeature] {
        &self.features
    }

    /// One pass over the data.
    pub fn iter(&mut self) -> impl Iterator<Item = Result<Batch>> + '_ {
        let mut order: Vec<usize> = (0..self.features.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let features = &self.features;
        let device = &self.device;
        let batch_size = self.batch_size;
        (0..order.len()).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(order.len());
            let rows: Vec<&TokenizedFeature> = order[start..end].iter().map(|&i| &features[i]).collect();
            Batch::from_features(&rows, device)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plm::tokenizer::{TokenizerConfig, WordVocab};
    use crate::prompts::template::DEFAULT_TEMPLATE;
    use crate::test_utils::{sample_examples, sample_vocab};
    use candle_core::DType;

    fn loader(examples: &[InputExample], shuffle: bool, seed: u64) -> anyhow::Result<PromptDataLoader> {
        let vocab: WordVocab = sample_vocab();
        let embeddings = Tensor::randn(0f32, 1f32, (vocab.len(), 8), &Device::Cpu)?;
        let template = MixedTemplate::new(DEFAULT_TEMPLATE, &vocab, &embeddings)?;
        let wrapper = T5TokenizerWrapper::new(&vocab, TokenizerConfig::default())?;
        let config = LoaderConfig {
            max_seq_length: 32,
            batch_size: 4,
            shuffle_train: shuffle,
            seed: Some(seed),
        };
        Ok(PromptDataLoader::new(examples, &template, &wrapper, &config, shuffle, &Device::Cpu)?)
    }

    #[test]
    fn test_batches_keep_partial_tail() -> anyhow::Result<()> {
        let examples = sample_examples();
        assert_eq!(examples.len(), 6);
        let mut loader = loader(&examples, false, 0)?;
        assert_eq!(loader.num_batches(), 2);

        let batches = loader.iter().collect::<Result<Vec<_>>>()?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].input_ids.dims(), &[4, 32]);
        assert_eq!(batches[1].input_ids.dims(), &[2, 32]);
        assert_eq!(batches[0].decoder_input_ids.dims(), &[4, 3]);
        assert_eq!(batches[0].guids, vec![0, 1, 2, 3]);
        assert_eq!(batches[0].label_tensor()?.dtype(), DType::U32);
        Ok(())
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible_and_reshuffles() -> anyhow::Result<()> {
        let examples = sample_examples();
        let order = |loader: &mut PromptDataLoader| -> anyhow::Result<Vec<i64>> {
            let mut guids = Vec::new();
            for batch in loader.iter() {
                guids.extend(batch?.guids);
            }
            Ok(guids)
        };

        let mut a = loader(&examples, true, 7)?;
        let mut b = loader(&examples, true, 7)?;
        let first = order(&mut a)?;
        assert_eq!(first, order(&mut b)?);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_unlabeled_batch_cannot_feed_the_loss() -> anyhow::Result<()> {
        let mut examples = sample_examples();
        examples[1].label = -1;
        let mut loader = loader(&examples, false, 0)?;
        let batch = loader.iter().next().ok_or_else(|| anyhow::anyhow!("no batch"))??;
        assert!(matches!(batch.label_tensor(), Err(PromptError::Dataset(_))));
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = LoaderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
