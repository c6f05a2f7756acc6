//! Mixed hard/soft prompt templates.
//!
//! A template is literal text interleaved with `{...}` blocks:
//!
//! - `{"placeholder": "text_a"}` / `{"placeholder": "text_b"}` insert the
//!   example's texts; these are the only slots truncation may shorten.
//! - `{"soft"}` inserts one trainable embedding; `{"soft": "some words"}`
//!   inserts one per sub-token of the words, initialized from their
//!   embeddings.
//! - `{"mask"}` marks the prediction position.
//! - `{"text": "..."}` inserts literal text.
//!
//! Whitespace right before a block becomes that block's leading space.

use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::data::example::{InputExample, WrappedExample, WrappedPiece};
use crate::error::{PromptError, Result};
use crate::plm::tokenizer::TextEncoder;
use crate::traits::{freeze_tensor, AdapterConfig, NamedParameter, ParameterTree};

/// The CB template: premise, three soft tokens, hypothesis, `?`, three soft
/// tokens, the mask, `.`.
pub const DEFAULT_TEMPLATE: &str = r#"{"placeholder":"text_a"} {"soft"} {"soft"} {"soft"} {"placeholder":"text_b"}? {"soft"} {"soft"} {"soft"} {"mask"}."#;

/// Template section of the pipeline config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template text.
    pub text: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEMPLATE.into(),
        }
    }
}

impl AdapterConfig for TemplateConfig {
    fn validate(&self) -> Result<()> {
        parse_template(&self.text).map(|_| ())
    }
}

/// Which example text a placeholder binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The premise.
    TextA,
    /// The hypothesis.
    TextB,
}

impl Field {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "text_a" => Ok(Self::TextA),
            "text_b" => Ok(Self::TextB),
            other => Err(PromptError::Template(format!("unknown placeholder '{other}'"))),
        }
    }

    fn get(self, example: &InputExample) -> &str {
        match self {
            Self::TextA => &example.text_a,
            Self::TextB => &example.text_b,
        }
    }
}

/// One parsed template element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePiece {
    /// Literal text.
    Text {
        /// The text, without its leading space.
        text: String,
        /// Whether a space precedes it.
        prefix_space: bool,
    },
    /// Example text.
    Placeholder {
        /// Bound field.
        field: Field,
        /// Whether a space precedes it.
        prefix_space: bool,
    },
    /// Trainable embedding row `index` (1-based).
    Soft {
        /// Row of the soft embedding table.
        index: u32,
    },
    /// Prediction position.
    Mask {
        /// Whether a space precedes it.
        prefix_space: bool,
    },
}

/// A soft block before it is numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawPiece {
    Piece(TemplatePiece),
    Soft { init: Option<String> },
}

fn parse_block(body: &str) -> Result<Map<String, Value>> {
    let inner = format!("{{{body}}}");
    if let Ok(map) = serde_json::from_str::<Map<String, Value>>(&inner) {
        return Ok(map);
    }
    // `{"soft"}` and `{"mask"}` are keys without values.
    let keys: Vec<String> = serde_json::from_str(&format!("[{body}]"))
        .map_err(|e| PromptError::Template(format!("invalid block {inner}: {e}")))?;
    Ok(keys.into_iter().map(|k| (k, Value::Null)).collect())
}

fn block_to_piece(block: &Map<String, Value>, prefix_space: bool) -> Result<RawPiece> {
    if block.len() != 1 {
        return Err(PromptError::Template(format!(
            "block must have exactly one key, got {}",
            Value::Object(block.clone())
        )));
    }
    let Some((key, value)) = block.iter().next() else {
        return Err(PromptError::Template("empty block".into()));
    };
    let piece = match key.as_str() {
        "placeholder" => RawPiece::Piece(TemplatePiece::Placeholder {
            field: Field::parse(string_value(key, value)?)?,
            prefix_space,
        }),
        "text" => RawPiece::Piece(TemplatePiece::Text {
            text: string_value(key, value)?.to_string(),
            prefix_space,
        }),
        "mask" => RawPiece::Piece(TemplatePiece::Mask { prefix_space }),
        "soft" => match value {
            Value::Null => RawPiece::Soft { init: None },
            Value::String(s) if s.trim().is_empty() => RawPiece::Soft { init: None },
            Value::String(s) => RawPiece::Soft {
                init: Some(s.clone()),
            },
            other => {
                return Err(PromptError::Template(format!(
                    "'soft' expects nothing or a string, got {other}"
                )))
            }
        },
        "meta" => {
            return Err(PromptError::Template(
                "meta placeholders are not supported".into(),
            ))
        }
        other => return Err(PromptError::Template(format!("unknown block key '{other}'"))),
    };
    Ok(piece)
}

fn string_value<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| PromptError::Template(format!("'{key}' expects a string, got {value}")))
}

fn push_text(out: &mut Vec<RawPiece>, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let trimmed = text.trim_start();
    out.push(RawPiece::Piece(TemplatePiece::Text {
        text: trimmed.to_string(),
        prefix_space: trimmed.len() != text.len(),
    }));
}

/// Split template text into literal text and blocks.
fn parse_template(text: &str) -> Result<Vec<RawPiece>> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let before = &rest[..open];
        if before.contains('}') {
            return Err(PromptError::Template("unbalanced '}'".into()));
        }
        let after = &rest[open + 1..];

        let mut depth = 1usize;
        let mut close = None;
        for (i, c) in after.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| {
            PromptError::Template(format!("unbalanced '{{' at byte {}", text.len() - rest.len() + open))
        })?;

        let prefix_space = before.ends_with(char::is_whitespace);
        push_text(&mut out, before.trim_end());
        out.push(block_to_piece(&parse_block(&after[..close])?, prefix_space)?);
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(PromptError::Template("unbalanced '}'".into()));
    }
    push_text(&mut out, rest);

    let masks = out
        .iter()
        .filter(|p| matches!(p, RawPiece::Piece(TemplatePiece::Mask { .. })))
        .count();
    if masks != 1 {
        return Err(PromptError::Template(format!(
            "template must contain exactly one mask, found {masks}"
        )));
    }
    Ok(out)
}

/// A parsed template owning its soft-token embedding table.
pub struct MixedTemplate {
    text: String,
    pieces: Vec<TemplatePiece>,
    /// `[num_soft + 1, d_model]`; row 0 is never read.
    soft_embedding: Tensor,
    num_soft: usize,
}

impl MixedTemplate {
    /// Parse `text` and create its soft embedding table.
    ///
    /// `word_embeddings` is the backbone's `[vocab, d_model]` token embedding,
    /// used to initialize soft blocks that carry words.
    ///
    /// # Errors
    /// Returns a `Template` error for malformed text, and a `Tokenization`
    /// error if the words of a soft block encode to nothing.
    pub fn new(text: &str, tokenizer: &dyn TextEncoder, word_embeddings: &Tensor) -> Result<Self> {
        let (_, d_model) = word_embeddings.dims2()?;
        let device = word_embeddings.device();
        let dtype = word_embeddings.dtype();

        let mut rows = vec![Tensor::zeros(d_model, dtype, device)?];
        let mut pieces = Vec::new();
        for raw in parse_template(text)? {
            match raw {
                RawPiece::Piece(piece) => pieces.push(piece),
                RawPiece::Soft { init: None } => {
                    rows.push(random_row(d_model, dtype, device)?);
                    pieces.push(TemplatePiece::Soft {
                        index: soft_index(rows.len() - 1)?,
                    });
                }
                RawPiece::Soft { init: Some(words) } => {
                    let ids = tokenizer.encode(&format!(" {words}"))?;
                    if ids.is_empty() {
                        return Err(PromptError::Tokenization(format!(
                            "soft block {words:?} encodes to no tokens"
                        )));
                    }
                    for id in ids {
                        rows.push(word_embeddings.i(id as usize)?.detach());
                        pieces.push(TemplatePiece::Soft {
                            index: soft_index(rows.len() - 1)?,
                        });
                    }
                }
            }
        }

        let num_soft = rows.len() - 1;
        let table = Tensor::stack(&rows, 0)?;
        let soft_embedding = Var::from_tensor(&table)?.as_tensor().clone();
        debug!(num_soft, d_model, "built template soft embedding");

        Ok(Self {
            text: text.to_string(),
            pieces,
            soft_embedding,
            num_soft,
        })
    }

    /// Template text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parsed pieces in declaration order.
    #[must_use]
    pub fn pieces(&self) -> &[TemplatePiece] {
        &self.pieces
    }

    /// Number of soft slots.
    #[must_use]
    pub fn num_soft_tokens(&self) -> usize {
        self.num_soft
    }

    /// The soft embedding table.
    #[must_use]
    pub fn soft_embedding(&self) -> &Tensor {
        &self.soft_embedding
    }

    /// Bind an example to the template.
    ///
    /// # Errors
    /// Currently infallible for parsed templates; kept fallible for
    /// templates whose placeholders cannot be resolved.
    pub fn wrap_one_example(&self, example: &InputExample) -> Result<WrappedExample> {
        let with_space = |text: &str, prefix_space: bool| {
            if prefix_space {
                format!(" {text}")
            } else {
                text.to_string()
            }
        };
        let pieces = self
            .pieces
            .iter()
            .map(|piece| match piece {
                TemplatePiece::Text { text, prefix_space } => {
                    WrappedPiece::text(with_space(text, *prefix_space), false)
                }
                TemplatePiece::Placeholder {
                    field,
                    prefix_space,
                } => WrappedPiece::text(with_space(field.get(example), *prefix_space), true),
                TemplatePiece::Soft { index } => WrappedPiece::soft(*index),
                TemplatePiece::Mask { .. } => WrappedPiece::mask(),
            })
            .collect();
        Ok(WrappedExample {
            pieces,
            label: example.label,
            guid: example.guid,
        })
    }

    /// Merge soft rows into the raw token embeddings.
    ///
    /// `raw_embeds` is `[B, L, d_model]`, `soft_token_ids` is `[B, L]`; positions
    /// with a non-zero soft id take that row of the soft table.
    ///
    /// # Errors
    /// Returns an error on shape mismatch or out-of-range soft ids.
    pub fn process_batch(&self, raw_embeds: &Tensor, soft_token_ids: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, d_model) = raw_embeds.dims3()?;
        if soft_token_ids.dims() != [b_sz, seq_len] {
            return Err(PromptError::ShapeMismatch {
                expected: vec![b_sz, seq_len],
                actual: soft_token_ids.dims().to_vec(),
            });
        }
        let soft = self
            .soft_embedding
            .index_select(&soft_token_ids.flatten_all()?, 0)?
            .reshape((b_sz, seq_len, d_model))?;
        let is_soft = soft_token_ids
            .gt(&soft_token_ids.zeros_like()?)?
            .unsqueeze(D::Minus1)?
            .broadcast_as((b_sz, seq_len, d_model))?;
        Ok(is_soft.where_cond(&soft, raw_embeds)?)
    }
}

fn random_row(d_model: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1f32, d_model, device)?.to_dtype(dtype)?)
}

fn soft_index(row: usize) -> Result<u32> {
    u32::try_from(row).map_err(|_| PromptError::Template("too many soft tokens".into()))
}

impl ParameterTree for MixedTemplate {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: "soft_embedding.weight".into(),
            tensor: self.soft_embedding.clone(),
            is_delta: false,
        });
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        freeze_tensor(&mut self.soft_embedding, "soft_embedding.weight", false, exclude);
    }
}
