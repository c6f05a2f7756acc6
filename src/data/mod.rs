//! Examples, dataset splits and batching.

pub mod example;
pub mod loader;
pub mod superglue;

pub use example::{InputExample, WrappedExample, WrappedPiece, NO_LABEL};
pub use loader::{Batch, LoaderConfig, PromptDataLoader};
pub use superglue::{load_dataset, DatasetConfig, DatasetSource, DatasetSplits, Split, Task};
