//! Turning wrapped examples into fixed-shape T5 model input.

use std::collections::HashMap;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::data::example::WrappedExample;
use crate::error::{PromptError, Result};
use crate::traits::AdapterConfig;

/// T5 padding token.
pub const PAD_TOKEN: &str = "<pad>";
/// T5 end-of-sequence token.
pub const EOS_TOKEN: &str = "</s>";
/// T5 unknown token.
pub const UNK_TOKEN: &str = "<unk>";

/// Sentinel token for the `index`-th mask.
#[must_use]
pub fn sentinel_token(index: usize) -> String {
    format!("<extra_id_{index}>")
}

/// Minimal tokenizer surface the pipeline needs.
pub trait TextEncoder: Send + Sync {
    /// Encode `text` without adding special tokens.
    ///
    /// # Errors
    /// Returns an error if the underlying tokenizer fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Id of a token string, if it is in the vocabulary.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Token string of an id, if it is in the vocabulary.
    fn id_to_token(&self, id: u32) -> Option<String>;

    /// Id of a special token that must exist.
    ///
    /// # Errors
    /// Returns a `Tokenization` error if the token is missing.
    fn special_id(&self, token: &str) -> Result<u32> {
        self.token_to_id(token)
            .ok_or_else(|| PromptError::Tokenization(format!("vocabulary has no '{token}' token")))
    }

    /// Map ids back to token strings, `"<?>"` for ids outside the vocabulary.
    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.id_to_token(id).unwrap_or_else(|| "<?>".into()))
            .collect()
    }
}

impl TextEncoder for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .deref()
            .encode(text, false)
            .map_err(|e| PromptError::Tokenization(format!("failed to encode {text:?}: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.deref().token_to_id(token)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.deref().id_to_token(id)
    }
}

/// Whitespace-and-punctuation word vocabulary.
///
/// Ids: `<pad>` = 0, `</s>` = 1, `<unk>` = 2, then the words in insertion
/// order, then the sentinel tokens. Unknown words encode to `<unk>`.
#[derive(Debug, Clone)]
pub struct WordVocab {
    ids: HashMap<String, u32>,
    tokens: Vec<String>,
}

impl WordVocab {
    /// Build a vocabulary from `words` plus `num_sentinels` `<extra_id_k>` tokens.
    #[must_use]
    pub fn new<S: AsRef<str>>(words: &[S], num_sentinels: usize) -> Self {
        let mut vocab = Self {
            ids: HashMap::new(),
            tokens: Vec::new(),
        };
        for special in [PAD_TOKEN, EOS_TOKEN, UNK_TOKEN] {
            vocab.insert(special);
        }
        for word in words {
            vocab.insert(word.as_ref());
        }
        for k in 0..num_sentinels {
            vocab.insert(&sentinel_token(k));
        }
        vocab
    }

    /// Build a vocabulary holding every word of `texts`.
    #[must_use]
    pub fn from_corpus<S: AsRef<str>>(texts: &[S], num_sentinels: usize) -> Self {
        let words: Vec<String> = texts
            .iter()
            .flat_map(|t| split_words(t.as_ref()))
            .map(str::to_string)
            .collect();
        Self::new(&words, num_sentinels)
    }

    fn insert(&mut self, token: &str) {
        if !self.ids.contains_key(token) {
            let id = u32::try_from(self.tokens.len()).unwrap_or(u32::MAX);
            self.ids.insert(token.to_string(), id);
            self.tokens.push(token.to_string());
        }
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the vocabulary is empty (never true once constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn split_words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace().flat_map(|word| {
        let mut parts = Vec::new();
        let mut start = 0;
        for (i, c) in word.char_indices() {
            if c.is_ascii_punctuation() {
                if start < i {
                    parts.push(&word[start..i]);
                }
                parts.push(&word[i..i + c.len_utf8()]);
                start = i + c.len_utf8();
            }
        }
        if start < word.len() {
            parts.push(&word[start..]);
        }
        parts
    })
}

impl TextEncoder for WordVocab {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let unk = self.special_id(UNK_TOKEN)?;
        Ok(split_words(text)
            .map(|w| self.ids.get(w).copied().unwrap_or(unk))
            .collect())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokens.get(id as usize).cloned()
    }
}

/// Which side of the shortenable text loses tokens when input is too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateMethod {
    /// Remove from the start of the first shortenable slot onwards.
    #[default]
    Head,
    /// Remove from the end of the last shortenable slot backwards.
    Tail,
    /// Spread the removal evenly over all shortenable slots.
    Balanced,
}

/// Length settings of the tokenizer wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Encoder length after truncation and padding.
    pub max_seq_length: usize,
    /// Decoder length after padding.
    pub decoder_max_length: usize,
    /// Truncation side.
    #[serde(default)]
    pub truncate_method: TruncateMethod,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 128,
            decoder_max_length: 3,
            truncate_method: TruncateMethod::Head,
        }
    }
}

impl AdapterConfig for TokenizerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_seq_length < 2 {
            return Err(PromptError::InvalidConfig(
                "max_seq_length must be at least 2".into(),
            ));
        }
        if self.decoder_max_length < 2 {
            return Err(PromptError::InvalidConfig(
                "decoder_max_length must be at least 2 to hold the loss position".into(),
            ));
        }
        Ok(())
    }
}

/// Model input for one example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedFeature {
    /// Encoder ids, length `max_seq_length`.
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<u32>,
    /// Soft row per encoder position, 0 where the id is used as is.
    pub soft_token_ids: Vec<u32>,
    /// Decoder ids, length `decoder_max_length`.
    pub decoder_input_ids: Vec<u32>,
    /// 1 at the decoder position whose logits are scored.
    pub loss_ids: Vec<u32>,
    /// Label index, or -1.
    pub label: i64,
    /// Row id.
    pub guid: i64,
}

impl TokenizedFeature {
    /// Decoder position scored by the verbalizer.
    #[must_use]
    pub fn loss_position(&self) -> Option<usize> {
        self.loss_ids.iter().position(|&l| l == 1)
    }
}

struct EncodedPiece {
    ids: Vec<u32>,
    soft_ids: Vec<u32>,
    shortenable: bool,
}

/// Encodes wrapped examples into T5 encoder/decoder ids.
///
/// Soft slots become one `<pad>` id with their soft row recorded, the `k`-th
/// mask becomes `<extra_id_k>`, and one `</s>` closes the encoder input. The
/// decoder always reads `<pad> <extra_id_0>` and is scored at position 1.
pub struct T5TokenizerWrapper<'a> {
    tokenizer: &'a dyn TextEncoder,
    config: TokenizerConfig,
    pad_id: u32,
    eos_id: u32,
}

impl<'a> T5TokenizerWrapper<'a> {
    /// Create a wrapper over `tokenizer`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the tokenizer lacks
    /// `<pad>` or `</s>`.
    pub fn new(tokenizer: &'a dyn TextEncoder, config: TokenizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pad_id: tokenizer.special_id(PAD_TOKEN)?,
            eos_id: tokenizer.special_id(EOS_TOKEN)?,
            tokenizer,
            config,
        })
    }

    /// The same wrapper with a different encoder length.
    ///
    /// # Errors
    /// Returns an error if the new length is invalid.
    pub fn with_max_seq_length(&self, max_seq_length: usize) -> Result<Self> {
        Self::new(
            self.tokenizer,
            TokenizerConfig {
                max_seq_length,
                ..self.config.clone()
            },
        )
    }

    /// Length settings.
    #[must_use]
    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    /// The wrapped tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> &dyn TextEncoder {
        self.tokenizer
    }

    /// Tokenize one wrapped example.
    ///
    /// # Errors
    /// Returns a `Tokenization` error if a sentinel token is missing or the
    /// shortenable text cannot absorb the truncation.
    pub fn tokenize_one_example(&self, wrapped: &WrappedExample) -> Result<TokenizedFeature> {
        let mut pieces = Vec::with_capacity(wrapped.pieces.len());
        let mut mask_index = 0;
        for piece in &wrapped.pieces {
            let encoded = if piece.is_mask {
                let id = self.tokenizer.special_id(&sentinel_token(mask_index))?;
                mask_index += 1;
                EncodedPiece {
                    ids: vec![id],
                    soft_ids: vec![0],
                    shortenable: false,
                }
            } else if piece.is_soft() {
                EncodedPiece {
                    ids: vec![self.pad_id],
                    soft_ids: vec![piece.soft_token_id],
                    shortenable: false,
                }
            } else {
                let ids = self.tokenizer.encode(&piece.text)?;
                EncodedPiece {
                    soft_ids: vec![0; ids.len()],
                    ids,
                    shortenable: piece.shortenable,
                }
            };
            pieces.push(encoded);
        }

        let total: usize = pieces.iter().map(|p| p.ids.len()).sum();
        let budget = (total + 1).saturating_sub(self.config.max_seq_length);
        if budget > 0 {
            trace!(guid = wrapped.guid, total, budget, "truncating example");
            truncate(&mut pieces, budget, self.config.truncate_method)?;
        }

        let max_len = self.config.max_seq_length;
        let mut input_ids: Vec<u32> = Vec::with_capacity(max_len);
        let mut soft_token_ids: Vec<u32> = Vec::with_capacity(max_len);
        for piece in &pieces {
            input_ids.extend(&piece.ids);
            soft_token_ids.extend(&piece.soft_ids);
        }
        input_ids.push(self.eos_id);
        soft_token_ids.push(0);

        let used = input_ids.len();
        let mut attention_mask = vec![1u32; used];
        input_ids.resize(max_len, self.pad_id);
        soft_token_ids.resize(max_len, 0);
        attention_mask.resize(max_len, 0);

        let dec_len = self.config.decoder_max_length;
        let mut decoder_input_ids = vec![self.pad_id, self.tokenizer.special_id(&sentinel_token(0))?];
        let mut loss_ids = vec![0u32, 1];
        decoder_input_ids.resize(dec_len, self.pad_id);
        loss_ids.resize(dec_len, 0);

        Ok(TokenizedFeature {
            input_ids,
            attention_mask,
            soft_token_ids,
            decoder_input_ids,
            loss_ids,
            label: wrapped.label,
            guid: wrapped.guid,
        })
    }
}

fn truncate(pieces: &mut [EncodedPiece], budget: usize, method: TruncateMethod) -> Result<()> {
    let available: usize = pieces
        .iter()
        .filter(|p| p.shortenable)
        .map(|p| p.ids.len())
        .sum();
    if available < budget {
        return Err(PromptError::Tokenization(format!(
            "need to remove {budget} tokens but only {available} are shortenable"
        )));
    }

    match method {
        TruncateMethod::Head => {
            let mut left = budget;
            for piece in pieces.iter_mut().filter(|p| p.shortenable) {
                left -= cut_front(piece, left);
                if left == 0 {
                    break;
                }
            }
        }
        TruncateMethod::Tail => {
            let mut left = budget;
            for piece in pieces.iter_mut().rev().filter(|p| p.shortenable) {
                left -= cut_back(piece, left);
                if left == 0 {
                    break;
                }
            }
        }
        TruncateMethod::Balanced => {
            let count = pieces.iter().filter(|p| p.shortenable).count();
            let mut left = budget;
            for (i, piece) in pieces.iter_mut().filter(|p| p.shortenable).enumerate() {
                let share = budget / count + usize::from(i < budget % count);
                left -= cut_back(piece, share);
            }
            // Short slots could not take their share; take the rest from the tail.
            for piece in pieces.iter_mut().rev().filter(|p| p.shortenable) {
                if left == 0 {
                    break;
                }
                left -= cut_back(piece, left);
            }
        }
    }
    Ok(())
}

fn cut_front(piece: &mut EncodedPiece, n: usize) -> usize {
    let n = n.min(piece.ids.len());
    piece.ids.drain(..n);
    piece.soft_ids.drain(..n);
    n
}

fn cut_back(piece: &mut EncodedPiece, n: usize) -> usize {
    let n = n.min(piece.ids.len());
    let keep = piece.ids.len() - n;
    piece.ids.truncate(keep);
    piece.soft_ids.truncate(keep);
    n
}
