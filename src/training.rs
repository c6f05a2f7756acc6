//! Training and evaluation of a prompt classifier.
//!
//! This module provides functionality for:
//! - Learning rate schedules
//! - Optimizer parameter groups with and without weight decay
//! - The epoch loop and the accuracy evaluation pass

// Allow usize to f64 casts for learning rate calculations - this is standard in ML code
#![allow(clippy::cast_precision_loss)]

use candle_core::{DType, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::PromptForClassification;
use crate::data::loader::{Batch, PromptDataLoader};
use crate::error::{PromptError, Result};
use crate::traits::{AdapterConfig, NamedParameter};

/// Learning rate schedule strategies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Constant learning rate
    #[default]
    Constant,
    /// Linear warmup from 0 to max LR
    LinearWarmup {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Cosine annealing from max LR to min LR
    CosineAnnealing {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
    /// Linear decay from max LR to min LR
    LinearDecay {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
    /// Linear warmup to max LR, then linear decay to 0
    LinearWarmupDecay {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of steps
        total_steps: usize,
    },
}

impl LrSchedule {
    /// Compute the learning rate for the given step.
    ///
    /// # Arguments
    /// * `step` - Current training step (0-indexed)
    /// * `base_lr` - Base learning rate
    ///
    /// # Returns
    /// The learning rate for this step
    #[must_use]
    pub fn get_lr(&self, step: usize, base_lr: f64) -> f64 {
        match self {
            Self::Constant => base_lr,
            Self::LinearWarmup { warmup_steps } => {
                if *warmup_steps == 0 || step >= *warmup_steps {
                    base_lr
                } else {
                    base_lr * (step as f64 / *warmup_steps as f64)
                }
            }
            Self::CosineAnnealing {
                total_steps,
                min_lr,
            } => {
                if *total_steps == 0 || step >= *total_steps {
                    *min_lr
                } else {
                    let progress = step as f64 / *total_steps as f64;
                    let cosine_decay = (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0;
                    min_lr + (base_lr - min_lr) * cosine_decay
                }
            }
            Self::LinearDecay {
                total_steps,
                min_lr,
            } => {
                if *total_steps == 0 || step >= *total_steps {
                    *min_lr
                } else {
                    let progress = step as f64 / *total_steps as f64;
                    base_lr - (base_lr - min_lr) * progress
                }
            }
            Self::LinearWarmupDecay {
                warmup_steps,
                total_steps,
            } => {
                if step < *warmup_steps {
                    base_lr * (step as f64 / *warmup_steps as f64)
                } else if step >= *total_steps || total_steps <= warmup_steps {
                    0.0
                } else {
                    let remaining = (*total_steps - step) as f64;
                    base_lr * remaining / (*total_steps - *warmup_steps) as f64
                }
            }
        }
    }
}

/// Optimizer and loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Passes over the training loader.
    pub num_epochs: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Learning rate schedule
    #[serde(default)]
    pub lr_schedule: LrSchedule,
    /// Decoupled weight decay of the decaying group
    pub weight_decay: f64,
    /// Name fragments whose parameters are never decayed
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
    /// Adam first-moment decay
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Adam second-moment decay
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Adam epsilon
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Running loss is logged when `step % log_every == 1 % log_every`.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

fn default_no_decay() -> Vec<String> {
    vec!["bias".into(), "LayerNorm.weight".into()]
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-6
}

fn default_log_every() -> usize {
    100
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            learning_rate: 1e-4,
            lr_schedule: LrSchedule::Constant,
            weight_decay: 0.01,
            no_decay: default_no_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            log_every: default_log_every(),
        }
    }
}

impl AdapterConfig for TrainingConfig {
    fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(PromptError::InvalidConfig("learning_rate must be > 0".into()));
        }
        if self.weight_decay < 0.0 {
            return Err(PromptError::InvalidConfig("weight_decay must be >= 0".into()));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(PromptError::InvalidConfig("betas must be in [0, 1)".into()));
        }
        if self.log_every == 0 {
            return Err(PromptError::InvalidConfig("log_every must be > 0".into()));
        }
        Ok(())
    }
}

/// Progress of a training run.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Current global step
    pub global_step: usize,
    /// Current epoch
    pub epoch: usize,
    /// Steps within current epoch
    pub steps_in_epoch: usize,
    /// Summed loss within current epoch
    pub epoch_loss: f64,
    /// Training configuration
    config: TrainingConfig,
}

impl TrainingState {
    /// Create new training state with the given configuration.
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            steps_in_epoch: 0,
            epoch_loss: 0.0,
            config,
        }
    }

    /// Get the current learning rate based on schedule.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.config
            .lr_schedule
            .get_lr(self.global_step, self.config.learning_rate)
    }

    /// Record one optimizer step and its loss.
    pub fn step(&mut self, loss: f64) {
        self.global_step += 1;
        self.steps_in_epoch += 1;
        self.epoch_loss += loss;
    }

    /// Mean loss of the current epoch so far.
    #[must_use]
    pub fn average_loss(&self) -> f64 {
        if self.steps_in_epoch == 0 {
            0.0
        } else {
            self.epoch_loss / self.steps_in_epoch as f64
        }
    }

    /// Start a new epoch.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
        self.steps_in_epoch = 0;
        self.epoch_loss = 0.0;
    }
}

/// Trainable parameters split by weight decay.
#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    /// Names of parameters that are decayed.
    pub decay: Vec<String>,
    /// Names of parameters that are not decayed.
    pub no_decay: Vec<String>,
}

/// Runs epochs of forward, cross-entropy, backward and `AdamW` steps.
///
/// Two `AdamW` optimizers share one gradient store: one for decayed
/// parameters, one for `no_decay` parameters.
pub struct Trainer {
    decay: AdamW,
    no_decay: AdamW,
    groups: ParamGroups,
    state: TrainingState,
}

impl Trainer {
    /// Build the optimizers over the trainable subset of `parameters`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or no parameter is trainable.
    pub fn new(parameters: &[NamedParameter], config: TrainingConfig) -> Result<Self> {
        config.validate()?;

        let mut decay_vars = Vec::new();
        let mut no_decay_vars = Vec::new();
        let mut groups = ParamGroups::default();
        for p in parameters.iter().filter(|p| p.is_trainable()) {
            let var = Var::from_tensor(&p.tensor)?;
            if config.no_decay.iter().any(|nd| p.name.contains(nd.as_str())) {
                no_decay_vars.push(var);
                groups.no_decay.push(p.name.clone());
            } else {
                decay_vars.push(var);
                groups.decay.push(p.name.clone());
            }
        }
        if groups.decay.is_empty() && groups.no_decay.is_empty() {
            return Err(PromptError::InvalidConfig("no trainable parameters".into()));
        }
        debug!(
            decay = groups.decay.len(),
            no_decay = groups.no_decay.len(),
            "built optimizer parameter groups"
        );

        let params = |weight_decay| ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay,
        };
        Ok(Self {
            decay: AdamW::new(decay_vars, params(config.weight_decay))?,
            no_decay: AdamW::new(no_decay_vars, params(0.0))?,
            groups,
            state: TrainingState::new(config),
        })
    }

    /// Parameter names per group.
    #[must_use]
    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// Progress so far.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// One optimizer step on `batch`, returning its loss.
    ///
    /// # Errors
    /// Returns an error if the batch is unlabeled or a tensor operation fails.
    pub fn train_step(&mut self, model: &PromptForClassification, batch: &Batch) -> Result<f64> {
        let lr = self.state.current_lr();
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);

        let logits = model.forward(batch, true)?;
        let labels = batch.label_tensor()?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        let grads = loss.backward()?;
        self.decay.step(&grads)?;
        self.no_decay.step(&grads)?;

        let loss = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
        self.state.step(loss);
        debug!(step = self.state.global_step, loss, lr, "train step");
        Ok(loss)
    }

    /// One pass over `loader`, returning the mean loss.
    ///
    /// # Errors
    /// Returns the first error of any step.
    pub fn train_epoch(
        &mut self,
        model: &PromptForClassification,
        loader: &mut PromptDataLoader,
    ) -> Result<f64> {
        let epoch = self.state.epoch;
        let log_every = self.state.config.log_every;
        for (step, batch) in loader.iter().enumerate() {
            self.train_step(model, &batch?)?;
            if logs_at(step, log_every) {
                info!("Epoch {epoch}, average loss: {}", self.state.average_loss());
            }
        }
        let average = self.state.average_loss();
        self.state.new_epoch();
        Ok(average)
    }

    /// Run every configured epoch, returning the mean loss of each.
    ///
    /// # Errors
    /// Returns the first error of any step.
    pub fn train(
        &mut self,
        model: &PromptForClassification,
        loader: &mut PromptDataLoader,
    ) -> Result<Vec<f64>> {
        let num_epochs = self.state.config.num_epochs;
        info!(num_epochs, batches = loader.num_batches(), "starting training");
        (0..num_epochs)
            .map(|_| self.train_epoch(model, loader))
            .collect()
    }
}

/// Whether the running loss is logged after in-epoch `step`: the second
/// step of every `log_every` window, or every step when `log_every` is 1.
fn logs_at(step: usize, log_every: usize) -> bool {
    step % log_every == 1 % log_every
}

/// Outcome of an evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    /// Share of predictions equal to their label, in `[0, 1]`.
    pub accuracy: f64,
    /// Argmax class per example, in loader order.
    pub predictions: Vec<i64>,
    /// Label per example, in loader order.
    pub labels: Vec<i64>,
}

/// Fraction of positions where `predictions` and `labels` agree.
///
/// # Errors
/// Returns `EmptyEvaluation` when there is nothing to score, and
/// `ShapeMismatch` when the lengths differ.
pub fn accuracy(predictions: &[i64], labels: &[i64]) -> Result<f64> {
    if predictions.len() != labels.len() {
        return Err(PromptError::ShapeMismatch {
            expected: vec![labels.len()],
            actual: vec![predictions.len()],
        });
    }
    if predictions.is_empty() {
        return Err(PromptError::EmptyEvaluation);
    }
    let correct = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
    Ok(correct as f64 / predictions.len() as f64)
}

/// Forward-only pass over `loader` with dropout disabled.
///
/// # Errors
/// Returns `EmptyEvaluation` for an empty loader, or the first forward error.
pub fn evaluate(model: &PromptForClassification, loader: &mut PromptDataLoader) -> Result<EvalReport> {
    let mut predictions = Vec::with_capacity(loader.len());
    let mut labels = Vec::with_capacity(loader.len());
    for batch in loader.iter() {
        let batch = batch?;
        let logits = model.forward(&batch, false)?;
        predictions.extend(
            logits
                .argmax(D::Minus1)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(i64::from),
        );
        labels.extend_from_slice(&batch.labels);
    }
    let accuracy = accuracy(&predictions, &labels)?;
    info!(accuracy, examples = predictions.len(), "evaluation finished");
    Ok(EvalReport {
        accuracy,
        predictions,
        labels,
    })
}

/// Format parameter count with appropriate units.
///
/// # Arguments
/// * `count` - Number of parameters
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
