//! # prompt-peft
//!
//! Prompt-based learning with parameter-efficient fine-tuning, on top of
//! [`candle`](https://github.com/huggingface/candle).
//!
//! A premise/hypothesis pair is wrapped in a cloze template with trainable
//! soft tokens, fed to a T5 encoder-decoder, and the decoder logits at the
//! mask position are mapped to classes through label words. Only the soft
//! tokens and low-rank (**`LoRA`**) deltas injected into the self-attention
//! projections are trained.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prompt_peft::{run, PipelineConfig};
//!
//! let mut config = PipelineConfig::default();
//! config.device = "cpu".into();
//! config.training.num_epochs = 1;
//! let report = run(&config)?;
//! println!("{}", report.accuracy);
//! ```
//!
//! ## Architecture
//!
//! - [`data`]: dataset rows, SuperGLUE loading and batching
//! - [`prompts`]: [`MixedTemplate`] and [`ManualVerbalizer`]
//! - [`plm`]: the T5 backbone, its loader and the tokenizer wrapper
//! - [`model`]: injection of [`LoraLayer`] deltas and backbone freezing
//! - [`classifier`]: the composed [`PromptForClassification`]
//! - [`training`]: the `AdamW` loop and accuracy evaluation
//! - [`pipeline`]: the end-to-end run driven by a [`PipelineConfig`]

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod classifier;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod plm;
pub mod prompts;
pub mod training;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_utils;

pub use adapters::lora::{LoraConfig, LoraLayer};
pub use classifier::PromptForClassification;
pub use config::{select_device, PipelineConfig};
pub use data::{InputExample, PromptDataLoader, WrappedExample};
pub use error::{PromptError, Result};
pub use io::{
    load_adapter_weights, load_config, load_pretrained, save_adapter_weights, save_config,
    save_pretrained, SaveLoad, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use model::{DeltaModel, ModulePattern};
pub use pipeline::{run, run_with, tokenize_splits};
pub use plm::t5::{T5Config, T5ForConditionalGeneration};
pub use plm::tokenizer::{T5TokenizerWrapper, TextEncoder, WordVocab};
pub use plm::{load_plm, Plm, PlmConfig};
pub use prompts::{ManualVerbalizer, MixedTemplate};
pub use training::{accuracy, evaluate, format_parameter_count, EvalReport, LrSchedule, Trainer, TrainingConfig};
pub use traits::{Adapter, AdapterConfig, NamedParameter, ParameterTree};
