//! Label-word verbalizer.

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PromptError, Result};
use crate::plm::tokenizer::{TextEncoder, UNK_TOKEN};
use crate::traits::AdapterConfig;

/// Label words per class, in label-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbalizerConfig {
    /// Number of classes.
    pub num_classes: usize,
    /// One group of words per class.
    pub label_words: Vec<Vec<String>>,
    /// Prepended to each word before tokenizing.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    " ".into()
}

impl Default for VerbalizerConfig {
    fn default() -> Self {
        Self {
            num_classes: 3,
            label_words: vec![vec!["yes".into()], vec!["no".into()], vec!["maybe".into()]],
            prefix: default_prefix(),
        }
    }
}

impl AdapterConfig for VerbalizerConfig {
    fn validate(&self) -> Result<()> {
        if self.label_words.len() != self.num_classes {
            return Err(PromptError::Verbalizer(format!(
                "{} label-word groups for {} classes",
                self.label_words.len(),
                self.num_classes
            )));
        }
        if let Some(class) = self.label_words.iter().position(Vec::is_empty) {
            return Err(PromptError::Verbalizer(format!("class {class} has no label words")));
        }
        Ok(())
    }
}

/// Maps mask-position vocabulary logits to class scores.
///
/// Every label word is reduced to its first sub-token. Scores are the mean,
/// per class, of `ln(p + 1e-15)` where `p` is the softmax over all label
/// words of all classes.
pub struct ManualVerbalizer {
    config: VerbalizerConfig,
    label_words_ids: Vec<Vec<u32>>,
    flat_ids: Tensor,
    /// `[num_words, num_classes]` averaging matrix.
    aggregate: Tensor,
}

impl ManualVerbalizer {
    /// Tokenize the label words.
    ///
    /// # Errors
    /// Returns a `Verbalizer` error if the groups do not match the class
    /// count or a word encodes to nothing or to `<unk>`.
    pub fn new(config: VerbalizerConfig, tokenizer: &dyn TextEncoder, device: &Device) -> Result<Self> {
        config.validate()?;
        let unk = tokenizer.token_to_id(UNK_TOKEN);

        let mut label_words_ids = Vec::with_capacity(config.num_classes);
        for words in &config.label_words {
            let mut ids = Vec::with_capacity(words.len());
            for word in words {
                let encoded = tokenizer.encode(&format!("{}{word}", config.prefix))?;
                let first = *encoded.first().ok_or_else(|| {
                    PromptError::Verbalizer(format!("label word {word:?} encodes to no tokens"))
                })?;
                if Some(first) == unk {
                    return Err(PromptError::Verbalizer(format!(
                        "label word {word:?} is not in the vocabulary"
                    )));
                }
                if encoded.len() > 1 {
                    debug!(word = %word, pieces = encoded.len(), "multi-token label word, using first piece");
                }
                ids.push(first);
            }
            label_words_ids.push(ids);
        }

        let flat: Vec<u32> = label_words_ids.iter().flatten().copied().collect();
        let mut weights = vec![0f32; flat.len() * config.num_classes];
        let mut row = 0;
        for (class, ids) in label_words_ids.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let share = 1.0 / ids.len() as f32;
            for _ in ids {
                weights[row * config.num_classes + class] = share;
                row += 1;
            }
        }
        let aggregate = Tensor::from_vec(weights, (flat.len(), config.num_classes), device)?;
        let flat_ids = Tensor::from_vec(flat, row, device)?;

        Ok(Self {
            config,
            label_words_ids,
            flat_ids,
            aggregate,
        })
    }

    /// First sub-token id of every label word, grouped by class.
    #[must_use]
    pub fn label_words_ids(&self) -> &[Vec<u32>] {
        &self.label_words_ids
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// `[B, vocab]` logits to `[B, num_classes]` class scores.
    ///
    /// # Errors
    /// Returns an error if `logits` is not two-dimensional or an id is out of range.
    pub fn process_logits(&self, logits: &Tensor) -> Result<Tensor> {
        let word_logits = logits.index_select(&self.flat_ids, 1)?;
        let probs = candle_nn::ops::softmax(&word_logits.to_dtype(DType::F32)?, D::Minus1)?;
        let log_probs = (probs + 1e-15)?.log()?;
        Ok(log_probs.matmul(&self.aggregate)?)
    }
}
