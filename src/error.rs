//! Error types for prompt-peft.

use thiserror::Error;

/// Result type alias for prompt-peft operations.
pub type Result<T> = std::result::Result<T, PromptError>;

/// Errors that can occur anywhere in the prompt-learning pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PromptError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Template text could not be parsed or bound.
    #[error("template error: {0}")]
    Template(String),

    /// A wrapped example could not be turned into model input.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// A label word is not representable in the tokenizer vocabulary.
    #[error("verbalizer error: {0}")]
    Verbalizer(String),

    /// Dataset split could not be read or parsed.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Pretrained model files could not be fetched or loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Requested device is not available.
    #[error("device unavailable: {0}")]
    Device(String),

    /// Evaluation loader produced no examples.
    #[error("cannot compute accuracy over an empty evaluation set")]
    EmptyEvaluation,

    /// File system or serialization failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
