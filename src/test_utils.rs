//! Shared fixtures for unit tests.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::adapters::lora::LoraConfig;
use crate::classifier::PromptForClassification;
use crate::data::example::InputExample;
use crate::data::loader::{Batch, LoaderConfig, PromptDataLoader};
use crate::model::DeltaModel;
use crate::plm::t5::{T5Config, T5ForConditionalGeneration};
use crate::plm::tokenizer::{T5TokenizerWrapper, TokenizerConfig, WordVocab};
use crate::prompts::template::{MixedTemplate, DEFAULT_TEMPLATE};
use crate::prompts::verbalizer::{ManualVerbalizer, VerbalizerConfig};

/// A word-level `tokenizer.json` with the T5 special tokens and `<extra_id_0>`.
pub(crate) const WORD_LEVEL_TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"<pad>": 0, "</s>": 1, "<unk>": 2, "yes": 3, "no": 4, "<extra_id_0>": 5},
        "unk_token": "<unk>"
    }
}"#;

/// A two-layer T5 small enough for CPU tests.
pub(crate) fn tiny_t5_config() -> T5Config {
    T5Config {
        vocab_size: 128,
        d_model: 16,
        d_kv: 4,
        d_ff: 32,
        num_layers: 2,
        num_decoder_layers: None,
        num_heads: 4,
        relative_attention_num_buckets: 8,
        relative_attention_max_distance: 16,
        dropout_rate: 0.1,
        layer_norm_epsilon: 1e-6,
        feed_forward_proj: "relu".into(),
        tie_word_embeddings: true,
        pad_token_id: 0,
        eos_token_id: 1,
        decoder_start_token_id: 0,
    }
}

/// Six labeled CB-style examples with guids 0..6.
pub(crate) fn sample_examples() -> Vec<InputExample> {
    [
        ("it was raining all day", "the street was wet", 0),
        ("he left the party early", "he stayed until the end", 1),
        ("she said she might come", "she will come", 2),
        ("the shop closes at noon", "the shop is closed at night", 0),
        ("nobody answered the door", "someone answered the door", 1),
        ("they may have won the game", "they won the game", 2),
    ]
    .into_iter()
    .zip(0i64..)
    .map(|((a, b, label), guid)| InputExample::new(a, b, label, guid))
    .collect()
}

/// Vocabulary covering the sample examples, label words and punctuation.
pub(crate) fn sample_vocab() -> WordVocab {
    let mut texts: Vec<String> = sample_examples()
        .into_iter()
        .flat_map(|e| [e.text_a, e.text_b])
        .collect();
    texts.push("yes no maybe ? .".into());
    WordVocab::from_corpus(&texts, 4)
}

fn tiny_parts(vocab: &WordVocab) -> anyhow::Result<(T5ForConditionalGeneration, MixedTemplate)> {
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
    let plm = T5ForConditionalGeneration::new(&tiny_t5_config(), vb)?;
    let template = MixedTemplate::new(DEFAULT_TEMPLATE, vocab, plm.shared_embedding())?;
    Ok((plm, template))
}

/// A randomly initialized classifier, optionally with LoRA injected and the
/// backbone frozen.
pub(crate) fn tiny_classifier(with_lora: bool) -> anyhow::Result<PromptForClassification> {
    let vocab = sample_vocab();
    let (mut plm, template) = tiny_parts(&vocab)?;
    if with_lora {
        let delta = DeltaModel::inject(&mut plm, LoraConfig::default())?;
        delta.freeze(&mut plm);
    }
    let verbalizer = ManualVerbalizer::new(VerbalizerConfig::default(), &vocab, &Device::Cpu)?;
    Ok(PromptForClassification::new(plm, template, verbalizer))
}

/// A loader over the sample examples with 32-token encoder input.
pub(crate) fn tiny_loader(template: &MixedTemplate, shuffle: bool) -> anyhow::Result<PromptDataLoader> {
    let vocab = sample_vocab();
    let wrapper = T5TokenizerWrapper::new(&vocab, TokenizerConfig::default())?;
    let config = LoaderConfig {
        max_seq_length: 32,
        batch_size: 4,
        shuffle_train: shuffle,
        seed: Some(0),
    };
    Ok(PromptDataLoader::new(
        &sample_examples(),
        template,
        &wrapper,
        &config,
        shuffle,
        &Device::Cpu,
    )?)
}

/// The first batch of the sample examples.
pub(crate) fn tiny_batch() -> anyhow::Result<Batch> {
    let vocab = sample_vocab();
    let (_, template) = tiny_parts(&vocab)?;
    let mut loader = tiny_loader(&template, false)?;
    let batch = loader
        .iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty loader"))?
        .map_err(Into::into);
    batch
}
