//! Prompt templates and verbalizers.

pub mod template;
pub mod verbalizer;

pub use template::{MixedTemplate, TemplateConfig, TemplatePiece, DEFAULT_TEMPLATE};
pub use verbalizer::{ManualVerbalizer, VerbalizerConfig};
