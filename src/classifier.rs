//! Prompt-based classification: template, backbone and verbalizer composed.

use candle_core::{IndexOp, Tensor};

use crate::data::loader::Batch;
use crate::error::{PromptError, Result};
use crate::plm::t5::T5ForConditionalGeneration;
use crate::prompts::template::MixedTemplate;
use crate::prompts::verbalizer::ManualVerbalizer;
use crate::traits::{NamedParameter, ParameterTree};

/// Scores a batch of prompted examples against the verbalizer's classes.
pub struct PromptForClassification {
    plm: T5ForConditionalGeneration,
    template: MixedTemplate,
    verbalizer: ManualVerbalizer,
}

impl PromptForClassification {
    /// Compose the three parts.
    #[must_use]
    pub fn new(
        plm: T5ForConditionalGeneration,
        template: MixedTemplate,
        verbalizer: ManualVerbalizer,
    ) -> Self {
        Self {
            plm,
            template,
            verbalizer,
        }
    }

    /// The backbone.
    #[must_use]
    pub fn plm(&self) -> &T5ForConditionalGeneration {
        &self.plm
    }

    /// The template.
    #[must_use]
    pub fn template(&self) -> &MixedTemplate {
        &self.template
    }

    /// The verbalizer.
    #[must_use]
    pub fn verbalizer(&self) -> &ManualVerbalizer {
        &self.verbalizer
    }

    /// Class scores `[B, num_classes]` for `batch`.
    ///
    /// # Errors
    /// Returns an error on shape mismatch or if a row has no loss position.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let raw = self.plm.embed_tokens(&batch.input_ids)?;
        let embeds = self.template.process_batch(&raw, &batch.soft_token_ids)?;
        let logits = self
            .plm
            .forward(&embeds, &batch.attention_mask, &batch.decoder_input_ids, train)?;
        let mask_logits = extract_at_loss_position(&logits, &batch.loss_ids)?;
        self.verbalizer.process_logits(&mask_logits)
    }
}

/// Pick, per row, the `[vocab]` logits where `loss_ids == 1`.
fn extract_at_loss_position(logits: &Tensor, loss_ids: &Tensor) -> Result<Tensor> {
    let rows = loss_ids
        .to_vec2::<u32>()?
        .iter()
        .enumerate()
        .map(|(b, ids)| {
            let mut positions = ids.iter().enumerate().filter(|(_, l)| **l == 1).map(|(i, _)| i);
            match (positions.next(), positions.next()) {
                (Some(pos), None) => Ok(logits.i((b, pos))?),
                _ => Err(PromptError::Tokenization(format!(
                    "row {b} must have exactly one loss position"
                ))),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

fn prefixed(prefix: &str, tree: &dyn ParameterTree, out: &mut Vec<NamedParameter>) {
    out.extend(tree.named_parameters().into_iter().map(|p| NamedParameter {
        name: format!("{prefix}.{}", p.name),
        ..p
    }));
}

impl ParameterTree for PromptForClassification {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        prefixed("plm", &self.plm, out);
        prefixed("template", &self.template, out);
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        self.plm.freeze_except(exclude);
        self.template.freeze_except(exclude);
    }
}
