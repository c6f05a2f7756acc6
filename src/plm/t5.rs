//! T5 encoder-decoder backbone.
//!
//! Key architectural features:
//! - Relative position bias computed by the first block of each stack and shared
//! - Pre-norm RMS layer norm (scale only, no bias, no mean subtraction)
//! - Bidirectional encoder, causal decoder with cross-attention
//! - ReLU FFN (T5 v1.0) or gated FFN (T5 v1.1+)
//! - No bias in any linear projection, no `1/sqrt(d_k)` attention scaling
//!
//! Every projection is a [`DeltaLinear`], so LoRA deltas can be injected by
//! dotted module name after the pretrained weights are loaded. The encoder
//! takes input embeddings rather than ids so prompt templates can splice in
//! soft tokens.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{init, ops, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{PromptError, Result};
use crate::model::{DeltaBackbone, DeltaLinear};
use crate::traits::{freeze_tensor, NamedParameter, ParameterTree};

/// Additive value used to mask out attention positions.
const MASK_VALUE: f64 = -1e9;

/// T5 hyperparameters as found in a HuggingFace `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct T5Config {
    /// Vocabulary size of the shared embedding.
    pub vocab_size: usize,
    /// Hidden size.
    pub d_model: usize,
    /// Per-head key/value size.
    pub d_kv: usize,
    /// Feed-forward inner size.
    pub d_ff: usize,
    /// Number of encoder blocks.
    pub num_layers: usize,
    /// Number of decoder blocks (defaults to `num_layers`).
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of relative position buckets.
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    /// Distance beyond which all relative positions share a bucket.
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    /// Dropout probability used while training.
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f64,
    /// RMS norm epsilon.
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Feed-forward variant, e.g. `relu` or `gated-gelu`.
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    /// Whether the LM head reuses the shared embedding.
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: u32,
    /// End-of-sequence token id.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    /// First decoder input token id.
    #[serde(default)]
    pub decoder_start_token_id: u32,
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_dropout_rate() -> f64 {
    0.1
}

fn default_layer_norm_epsilon() -> f64 {
    1e-6
}

fn default_feed_forward_proj() -> String {
    "relu".into()
}

fn default_tie_word_embeddings() -> bool {
    true
}

fn default_eos_token_id() -> u32 {
    1
}

impl T5Config {
    /// Number of decoder blocks.
    #[must_use]
    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }
}

/// Feed-forward activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Relu,
    /// Tanh approximation, `gelu_new` in HuggingFace.
    GeluNew,
    Gelu,
    Silu,
}

impl Activation {
    fn parse(proj: &str) -> Result<(Self, bool)> {
        let (gated, act) = match proj.strip_prefix("gated-") {
            Some(act) => (true, act),
            None => (false, proj),
        };
        let activation = match act {
            "relu" => Self::Relu,
            "gelu" if gated => Self::GeluNew,
            "gelu" => Self::Gelu,
            "gelu_new" => Self::GeluNew,
            "silu" | "swish" => Self::Silu,
            other => {
                return Err(PromptError::InvalidConfig(format!(
                    "unsupported feed_forward_proj activation '{other}'"
                )))
            }
        };
        Ok((activation, gated))
    }

    fn apply(self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Relu => xs.relu()?,
            Self::GeluNew => xs.gelu()?,
            Self::Gelu => xs.gelu_erf()?,
            Self::Silu => ops::silu(xs)?,
        })
    }
}

fn dropout(xs: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(ops::dropout(xs, p as f32)?)
    } else {
        Ok(xs.clone())
    }
}

// ─── Layer norm ────────────────────────────────────────────────────────────

struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
    name: String,
}

impl T5LayerNorm {
    fn new(hidden_size: usize, eps: f64, name: String, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", init::ONE)?;
        Ok(Self { weight, eps, name })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        let variance = xs_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let xs_normed = xs_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(xs_normed.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

impl ParameterTree for T5LayerNorm {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: format!("{}.weight", self.name),
            tensor: self.weight.clone(),
            is_delta: false,
        });
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        freeze_tensor(&mut self.weight, &format!("{}.weight", self.name), false, exclude);
    }
}

// ─── Relative position bias ────────────────────────────────────────────────

/// Learned relative position bias with logarithmic bucketing.
struct RelativePositionBias {
    weight: Tensor,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
    name: String,
}

impl RelativePositionBias {
    fn new(cfg: &T5Config, bidirectional: bool, name: String, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (cfg.relative_attention_num_buckets, cfg.num_heads),
            "weight",
            init::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            weight,
            num_buckets: cfg.relative_attention_num_buckets,
            max_distance: cfg.relative_attention_max_distance,
            bidirectional,
            name,
        })
    }

    /// Bucket for `memory_position - query_position`.
    ///
    /// Half the buckets hold exact small distances, the rest are spaced
    /// logarithmically up to `max_distance`.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn bucket(&self, relative_position: i64) -> u32 {
        let mut num_buckets = self.num_buckets as i64;
        let mut bucket = 0i64;
        let distance = if self.bidirectional {
            num_buckets /= 2;
            if relative_position > 0 {
                bucket += num_buckets;
            }
            relative_position.abs()
        } else {
            (-relative_position).max(0)
        };

        let max_exact = num_buckets / 2;
        if distance < max_exact {
            return (bucket + distance) as u32;
        }

        let scaled = (distance as f64 / max_exact as f64).ln()
            / (self.max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64;
        let large = max_exact + scaled as i64;
        (bucket + large.min(num_buckets - 1)) as u32
    }

    /// Returns `[1, num_heads, query_len, key_len]`.
    #[allow(clippy::cast_possible_wrap)]
    fn compute_bias(&self, query_len: usize, key_len: usize, device: &Device) -> Result<Tensor> {
        let mut buckets = Vec::with_capacity(query_len * key_len);
        for q in 0..query_len {
            for k in 0..key_len {
                buckets.push(self.bucket(k as i64 - q as i64));
            }
        }
        let indices = Tensor::from_vec(buckets, query_len * key_len, device)?;
        let num_heads = self.weight.dim(1)?;
        let bias = self
            .weight
            .index_select(&indices, 0)?
            .reshape((query_len, key_len, num_heads))?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;
        Ok(bias)
    }
}

impl ParameterTree for RelativePositionBias {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: format!("{}.weight", self.name),
            tensor: self.weight.clone(),
            is_delta: false,
        });
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        freeze_tensor(&mut self.weight, &format!("{}.weight", self.name), false, exclude);
    }
}

// ─── Attention ─────────────────────────────────────────────────────────────

/// Multi-head attention used for self-attention and cross-attention.
struct T5Attention {
    q: DeltaLinear,
    k: DeltaLinear,
    v: DeltaLinear,
    o: DeltaLinear,
    num_heads: usize,
    d_kv: usize,
    dropout: f64,
    relative_bias: Option<RelativePositionBias>,
}

impl T5Attention {
    fn new(
        cfg: &T5Config,
        has_relative_bias: bool,
        bidirectional: bool,
        name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner = cfg.inner_dim();
        let relative_bias = if has_relative_bias {
            Some(RelativePositionBias::new(
                cfg,
                bidirectional,
                format!("{name}.relative_attention_bias"),
                vb.pp("relative_attention_bias"),
            )?)
        } else {
            None
        };
        Ok(Self {
            q: DeltaLinear::new(cfg.d_model, inner, format!("{name}.q"), vb.pp("q"))?,
            k: DeltaLinear::new(cfg.d_model, inner, format!("{name}.k"), vb.pp("k"))?,
            v: DeltaLinear::new(cfg.d_model, inner, format!("{name}.v"), vb.pp("v"))?,
            o: DeltaLinear::new(inner, cfg.d_model, format!("{name}.o"), vb.pp("o"))?,
            num_heads: cfg.num_heads,
            d_kv: cfg.d_kv,
            dropout: cfg.dropout_rate,
            relative_bias,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((b_sz, seq_len, self.num_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Attend from `xs` to `key_value_states` (or to `xs` itself).
    ///
    /// Returns the output and the bias that was applied, which already
    /// includes `mask`, so later blocks can reuse it unchanged.
    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (b_sz, query_len, _) = xs.dims3()?;
        let source = key_value_states.unwrap_or(xs);
        let key_len = source.dim(1)?;

        let q = self.split_heads(&self.q.forward(xs, train)?)?;
        let k = self.split_heads(&self.k.forward(source, train)?)?;
        let v = self.split_heads(&self.v.forward(source, train)?)?;

        let mut scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        let bias = match position_bias {
            Some(bias) => Some(bias.clone()),
            None => {
                let relative = match &self.relative_bias {
                    Some(rb) => Some(
                        rb.compute_bias(query_len, key_len, xs.device())?
                            .to_dtype(scores.dtype())?,
                    ),
                    None => None,
                };
                match (relative, mask) {
                    (Some(r), Some(m)) => Some(r.broadcast_add(m)?),
                    (Some(r), None) => Some(r),
                    (None, Some(m)) => Some(m.clone()),
                    (None, None) => None,
                }
            }
        };
        if let Some(bias) = &bias {
            scores = scores.broadcast_add(bias)?;
        }

        let weights = ops::softmax(&scores, D::Minus1)?;
        let weights = dropout(&weights, self.dropout, train)?;
        let attn = weights.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((
            b_sz,
            query_len,
            self.num_heads * self.d_kv,
        ))?;

        Ok((self.o.forward(&attn, train)?, bias))
    }

    fn linears_mut(&mut self) -> [&mut DeltaLinear; 4] {
        [&mut self.q, &mut self.k, &mut self.v, &mut self.o]
    }
}

impl ParameterTree for T5Attention {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        for linear in [&self.q, &self.k, &self.v, &self.o] {
            linear.collect_parameters(out);
        }
        if let Some(rb) = &self.relative_bias {
            rb.collect_parameters(out);
        }
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        for linear in self.linears_mut() {
            linear.freeze_except(exclude);
        }
        if let Some(rb) = &mut self.relative_bias {
            rb.freeze_except(exclude);
        }
    }
}

// ─── Feed-forward ──────────────────────────────────────────────────────────

enum DenseActDense {
    Plain { wi: DeltaLinear, wo: DeltaLinear },
    Gated { wi_0: DeltaLinear, wi_1: DeltaLinear, wo: DeltaLinear },
}

/// Pre-norm feed-forward sublayer with residual.
struct T5LayerFf {
    dense: DenseActDense,
    activation: Activation,
    layer_norm: T5LayerNorm,
    dropout: f64,
}

impl T5LayerFf {
    fn new(cfg: &T5Config, name: &str, vb: VarBuilder) -> Result<Self> {
        let (activation, gated) = Activation::parse(&cfg.feed_forward_proj)?;
        let dense_name = format!("{name}.DenseReluDense");
        let dvb = vb.pp("DenseReluDense");
        let dense = if gated {
            DenseActDense::Gated {
                wi_0: DeltaLinear::new(cfg.d_model, cfg.d_ff, format!("{dense_name}.wi_0"), dvb.pp("wi_0"))?,
                wi_1: DeltaLinear::new(cfg.d_model, cfg.d_ff, format!("{dense_name}.wi_1"), dvb.pp("wi_1"))?,
                wo: DeltaLinear::new(cfg.d_ff, cfg.d_model, format!("{dense_name}.wo"), dvb.pp("wo"))?,
            }
        } else {
            DenseActDense::Plain {
                wi: DeltaLinear::new(cfg.d_model, cfg.d_ff, format!("{dense_name}.wi"), dvb.pp("wi"))?,
                wo: DeltaLinear::new(cfg.d_ff, cfg.d_model, format!("{dense_name}.wo"), dvb.pp("wo"))?,
            }
        };
        let layer_norm = T5LayerNorm::new(
            cfg.d_model,
            cfg.layer_norm_epsilon,
            format!("{name}.layer_norm"),
            vb.pp("layer_norm"),
        )?;
        Ok(Self {
            dense,
            activation,
            layer_norm,
            dropout: cfg.dropout_rate,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.layer_norm.forward(xs)?;
        let hidden = match &self.dense {
            DenseActDense::Plain { wi, wo } => {
                let h = self.activation.apply(&wi.forward(&normed, train)?)?;
                wo.forward(&dropout(&h, self.dropout, train)?, train)?
            }
            DenseActDense::Gated { wi_0, wi_1, wo } => {
                let gate = self.activation.apply(&wi_0.forward(&normed, train)?)?;
                let h = (gate * wi_1.forward(&normed, train)?)?;
                wo.forward(&dropout(&h, self.dropout, train)?, train)?
            }
        };
        Ok((xs + dropout(&hidden, self.dropout, train)?)?)
    }

    fn linears_mut(&mut self) -> Vec<&mut DeltaLinear> {
        match &mut self.dense {
            DenseActDense::Plain { wi, wo } => vec![wi, wo],
            DenseActDense::Gated { wi_0, wi_1, wo } => vec![wi_0, wi_1, wo],
        }
    }
}

impl ParameterTree for T5LayerFf {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        match &self.dense {
            DenseActDense::Plain { wi, wo } => {
                wi.collect_parameters(out);
                wo.collect_parameters(out);
            }
            DenseActDense::Gated { wi_0, wi_1, wo } => {
                wi_0.collect_parameters(out);
                wi_1.collect_parameters(out);
                wo.collect_parameters(out);
            }
        }
        self.layer_norm.collect_parameters(out);
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        for linear in self.linears_mut() {
            linear.freeze_except(exclude);
        }
        self.layer_norm.freeze_except(exclude);
    }
}

// ─── Blocks and stacks ─────────────────────────────────────────────────────

/// Pre-norm attention sublayer with residual.
struct T5LayerAttention {
    attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout: f64,
}

impl T5LayerAttention {
    fn new(
        cfg: &T5Config,
        kind: &str,
        has_relative_bias: bool,
        bidirectional: bool,
        name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attention: T5Attention::new(
                cfg,
                has_relative_bias,
                bidirectional,
                &format!("{name}.{kind}"),
                vb.pp(kind),
            )?,
            layer_norm: T5LayerNorm::new(
                cfg.d_model,
                cfg.layer_norm_epsilon,
                format!("{name}.layer_norm"),
                vb.pp("layer_norm"),
            )?,
            dropout: cfg.dropout_rate,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let normed = self.layer_norm.forward(xs)?;
        let (out, bias) =
            self.attention
                .forward(&normed, key_value_states, mask, position_bias, train)?;
        Ok(((xs + dropout(&out, self.dropout, train)?)?, bias))
    }
}

impl ParameterTree for T5LayerAttention {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        self.attention.collect_parameters(out);
        self.layer_norm.collect_parameters(out);
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        self.attention.freeze_except(exclude);
        self.layer_norm.freeze_except(exclude);
    }
}

struct T5Block {
    self_attention: T5LayerAttention,
    cross_attention: Option<T5LayerAttention>,
    ff: T5LayerFf,
}

impl T5Block {
    fn new(cfg: &T5Config, is_decoder: bool, index: usize, name: &str, vb: VarBuilder) -> Result<Self> {
        let lvb = vb.pp("layer");
        let self_attention = T5LayerAttention::new(
            cfg,
            "SelfAttention",
            index == 0,
            !is_decoder,
            &format!("{name}.layer.0"),
            lvb.pp("0"),
        )?;
        let (cross_attention, ff_index) = if is_decoder {
            let cross = T5LayerAttention::new(
                cfg,
                "EncDecAttention",
                false,
                true,
                &format!("{name}.layer.1"),
                lvb.pp("1"),
            )?;
            (Some(cross), 2)
        } else {
            (None, 1)
        };
        let ff = T5LayerFf::new(cfg, &format!("{name}.layer.{ff_index}"), lvb.pp(ff_index.to_string()))?;
        Ok(Self {
            self_attention,
            cross_attention,
            ff,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        encoder: Option<(&Tensor, Option<&Tensor>)>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (mut xs, bias) = self.self_attention.forward(xs, None, mask, position_bias, train)?;
        if let (Some(cross), Some((encoder_hidden, encoder_mask))) = (&self.cross_attention, encoder) {
            xs = cross
                .forward(&xs, Some(encoder_hidden), encoder_mask, None, train)?
                .0;
        }
        Ok((self.ff.forward(&xs, train)?, bias))
    }

    fn linears_mut(&mut self) -> Vec<&mut DeltaLinear> {
        let mut out: Vec<&mut DeltaLinear> = self.self_attention.attention.linears_mut().into();
        if let Some(cross) = &mut self.cross_attention {
            out.extend(cross.attention.linears_mut());
        }
        out.extend(self.ff.linears_mut());
        out
    }
}

impl ParameterTree for T5Block {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        self.self_attention.collect_parameters(out);
        if let Some(cross) = &self.cross_attention {
            cross.collect_parameters(out);
        }
        self.ff.collect_parameters(out);
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        self.self_attention.freeze_except(exclude);
        if let Some(cross) = &mut self.cross_attention {
            cross.freeze_except(exclude);
        }
        self.ff.freeze_except(exclude);
    }
}

struct T5Stack {
    blocks: Vec<T5Block>,
    final_layer_norm: T5LayerNorm,
    dropout: f64,
}

impl T5Stack {
    fn new(cfg: &T5Config, is_decoder: bool, name: &str, vb: VarBuilder) -> Result<Self> {
        let num_blocks = if is_decoder {
            cfg.decoder_layers()
        } else {
            cfg.num_layers
        };
        let blocks = (0..num_blocks)
            .map(|i| {
                T5Block::new(
                    cfg,
                    is_decoder,
                    i,
                    &format!("{name}.block.{i}"),
                    vb.pp("block").pp(i.to_string()),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm = T5LayerNorm::new(
            cfg.d_model,
            cfg.layer_norm_epsilon,
            format!("{name}.final_layer_norm"),
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self {
            blocks,
            final_layer_norm,
            dropout: cfg.dropout_rate,
        })
    }

    fn forward(
        &self,
        embeds: &Tensor,
        mask: Option<&Tensor>,
        encoder: Option<(&Tensor, Option<&Tensor>)>,
        train: bool,
    ) -> Result<Tensor> {
        let mut hidden = dropout(embeds, self.dropout, train)?;
        let mut position_bias: Option<Tensor> = None;
        for block in &self.blocks {
            let (h, bias) = block.forward(&hidden, mask, position_bias.as_ref(), encoder, train)?;
            hidden = h;
            if position_bias.is_none() {
                position_bias = bias;
            }
        }
        let hidden = self.final_layer_norm.forward(&hidden)?;
        dropout(&hidden, self.dropout, train)
    }
}

impl ParameterTree for T5Stack {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        for block in &self.blocks {
            block.collect_parameters(out);
        }
        self.final_layer_norm.collect_parameters(out);
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        for block in &mut self.blocks {
            block.freeze_except(exclude);
        }
        self.final_layer_norm.freeze_except(exclude);
    }
}

// ─── Full model ────────────────────────────────────────────────────────────

/// T5 encoder-decoder with an LM head.
pub struct T5ForConditionalGeneration {
    shared: Tensor,
    encoder: T5Stack,
    decoder: T5Stack,
    lm_head: Option<Tensor>,
    config: T5Config,
    device: Device,
    dtype: DType,
}

impl T5ForConditionalGeneration {
    /// Build the model, creating or fetching every weight through `vb`.
    ///
    /// # Errors
    /// Returns an error if the configuration is unsupported or a weight is missing.
    pub fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let shared = vb.pp("shared").get_with_hints(
            (cfg.vocab_size, cfg.d_model),
            "weight",
            init::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let encoder = T5Stack::new(cfg, false, "encoder", vb.pp("encoder"))?;
        let decoder = T5Stack::new(cfg, true, "decoder", vb.pp("decoder"))?;
        let lm_head = if cfg.tie_word_embeddings {
            None
        } else {
            Some(vb.pp("lm_head").get_with_hints(
                (cfg.vocab_size, cfg.d_model),
                "weight",
                init::DEFAULT_KAIMING_NORMAL,
            )?)
        };
        Ok(Self {
            shared,
            encoder,
            decoder,
            lm_head,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Model hyperparameters.
    #[must_use]
    pub fn config(&self) -> &T5Config {
        &self.config
    }

    /// The shared token embedding, `[vocab_size, d_model]`.
    #[must_use]
    pub fn shared_embedding(&self) -> &Tensor {
        &self.shared
    }

    /// Look up token embeddings for `[batch, seq]` ids.
    ///
    /// # Errors
    /// Returns an error if an id is out of range.
    pub fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len) = input_ids.dims2()?;
        let flat = input_ids.flatten_all()?;
        Ok(self
            .shared
            .index_select(&flat, 0)?
            .reshape((b_sz, seq_len, self.config.d_model))?)
    }

    /// Turn a `[batch, seq]` 0/1 mask into an additive `[batch, 1, 1, seq]` mask.
    fn extended_attention_mask(&self, attention_mask: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len) = attention_mask.dims2()?;
        Ok(attention_mask
            .to_dtype(self.dtype)?
            .affine(-MASK_VALUE, MASK_VALUE)?
            .reshape((b_sz, 1, 1, seq_len))?)
    }

    fn causal_mask(&self, len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..len)
            .flat_map(|i| (0..len).map(move |j| if j > i { MASK_VALUE as f32 } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(mask, (1, 1, len, len), &self.device)?.to_dtype(self.dtype)?)
    }

    /// Run the encoder over input embeddings.
    ///
    /// # Errors
    /// Returns an error on shape mismatch.
    pub fn encode(&self, inputs_embeds: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mask = self.extended_attention_mask(attention_mask)?;
        self.encoder.forward(inputs_embeds, Some(&mask), None, train)
    }

    /// Run the decoder and LM head, returning `[batch, dec_len, vocab]` logits.
    ///
    /// # Errors
    /// Returns an error on shape mismatch.
    pub fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_hidden: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (_, dec_len) = decoder_input_ids.dims2()?;
        let embeds = self.embed_tokens(decoder_input_ids)?;
        let causal = self.causal_mask(dec_len)?;
        let encoder_mask = self.extended_attention_mask(attention_mask)?;
        let hidden = self.decoder.forward(
            &embeds,
            Some(&causal),
            Some((encoder_hidden, Some(&encoder_mask))),
            train,
        )?;

        let (hidden, head) = match &self.lm_head {
            Some(head) => (hidden, head),
            None => ((hidden * (self.config.d_model as f64).powf(-0.5))?, &self.shared),
        };
        Ok(hidden.broadcast_matmul(&head.t()?)?)
    }

    /// Full forward pass from encoder embeddings to decoder logits.
    ///
    /// # Errors
    /// Returns an error on shape mismatch.
    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let encoder_hidden = self.encode(inputs_embeds, attention_mask, train)?;
        self.decode(decoder_input_ids, &encoder_hidden, attention_mask, train)
    }
}

impl ParameterTree for T5ForConditionalGeneration {
    fn collect_parameters(&self, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter {
            name: "shared.weight".into(),
            tensor: self.shared.clone(),
            is_delta: false,
        });
        self.encoder.collect_parameters(out);
        self.decoder.collect_parameters(out);
        if let Some(head) = &self.lm_head {
            out.push(NamedParameter {
                name: "lm_head.weight".into(),
                tensor: head.clone(),
                is_delta: false,
            });
        }
    }

    fn freeze_except(&mut self, exclude: &[String]) {
        freeze_tensor(&mut self.shared, "shared.weight", false, exclude);
        self.encoder.freeze_except(exclude);
        self.decoder.freeze_except(exclude);
        if let Some(head) = &mut self.lm_head {
            freeze_tensor(head, "lm_head.weight", false, exclude);
        }
    }
}

impl DeltaBackbone for T5ForConditionalGeneration {
    fn linear_modules_mut(&mut self) -> Vec<&mut DeltaLinear> {
        self.encoder
            .blocks
            .iter_mut()
            .chain(self.decoder.blocks.iter_mut())
            .flat_map(T5Block::linears_mut)
            .collect()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::LoraConfig;
    use crate::model::DeltaModel;
    use crate::test_utils::tiny_t5_config;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn tiny_model() -> anyhow::Result<T5ForConditionalGeneration> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        Ok(T5ForConditionalGeneration::new(&tiny_t5_config(), vb)?)
    }

    fn bias(bidirectional: bool) -> anyhow::Result<RelativePositionBias> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let cfg = T5Config {
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            ..tiny_t5_config()
        };
        Ok(RelativePositionBias::new(&cfg, bidirectional, "rb".into(), vb)?)
    }

    #[test]
    fn test_bidirectional_buckets() -> anyhow::Result<()> {
        let rb = bias(true)?;
        assert_eq!(rb.bucket(0), 0);
        assert_eq!(rb.bucket(-1), 1);
        assert_eq!(rb.bucket(1), 17);
        assert_eq!(rb.bucket(-7), 7);
        // Far distances saturate at the last bucket of each half.
        assert_eq!(rb.bucket(-1000), 15);
        assert_eq!(rb.bucket(1000), 31);
        Ok(())
    }

    #[test]
    fn test_causal_buckets_ignore_future() -> anyhow::Result<()> {
        let rb = bias(false)?;
        assert_eq!(rb.bucket(5), 0);
        assert_eq!(rb.bucket(-3), 3);
        assert_eq!(rb.bucket(-1000), 31);
        Ok(())
    }

    #[test]
    fn test_forward_shapes() -> anyhow::Result<()> {
        let model = tiny_model()?;
        let cfg = model.config().clone();
        let ids = Tensor::new(&[[5u32, 6, 7, 1, 0, 0], [8, 9, 10, 11, 12, 1]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 0, 0], [1, 1, 1, 1, 1, 1]], &Device::Cpu)?;
        let dec = Tensor::new(&[[0u32, 30, 0], [0, 30, 0]], &Device::Cpu)?;

        let embeds = model.embed_tokens(&ids)?;
        assert_eq!(embeds.dims(), &[2, 6, cfg.d_model]);

        let logits = model.forward(&embeds, &mask, &dec, false)?;
        assert_eq!(logits.dims(), &[2, 3, cfg.vocab_size]);
        Ok(())
    }

    #[test]
    fn test_padding_does_not_leak_into_encoder() -> anyhow::Result<()> {
        let model = tiny_model()?;
        let device = Device::Cpu;
        let short = Tensor::new(&[[5u32, 6, 1, 0]], &device)?;
        let other_pad = Tensor::new(&[[5u32, 6, 1, 9]], &device)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 0]], &device)?;

        let a = model.encode(&model.embed_tokens(&short)?, &mask, false)?;
        let b = model.encode(&model.embed_tokens(&other_pad)?, &mask, false)?;
        let diff = (a.i((.., 0..3, ..))? - b.i((.., 0..3, ..))?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_fresh_lora_preserves_outputs() -> anyhow::Result<()> {
        let mut model = tiny_model()?;
        let ids = Tensor::new(&[[5u32, 6, 7, 1]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1]], &Device::Cpu)?;
        let dec = Tensor::new(&[[0u32, 30, 0]], &Device::Cpu)?;

        let before = model.forward(&model.embed_tokens(&ids)?, &mask, &dec, false)?;
        let _delta = DeltaModel::inject(&mut model, LoraConfig::default())?;
        let after = model.forward(&model.embed_tokens(&ids)?, &mask, &dec, false)?;

        let diff = (before - after)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_gradients_reach_only_deltas_after_freeze() -> anyhow::Result<()> {
        let mut model = tiny_model()?;
        let delta = DeltaModel::inject(&mut model, LoraConfig::default())?;
        delta.freeze(&mut model);

        let ids = Tensor::new(&[[5u32, 6, 7, 1]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1]], &Device::Cpu)?;
        let dec = Tensor::new(&[[0u32, 30, 0]], &Device::Cpu)?;
        let logits = model.forward(&model.embed_tokens(&ids)?, &mask, &dec, true)?;
        let grads = logits.sum_all()?.backward()?;

        for p in model.named_parameters() {
            if p.is_delta {
                assert!(p.is_trainable(), "{}", p.name);
            } else {
                assert!(grads.get(&p.tensor).is_none(), "{}", p.name);
            }
        }
        let lora_a = model
            .named_parameters()
            .into_iter()
            .find(|p| p.name.ends_with("encoder.block.0.layer.0.SelfAttention.q.lora.lora_a.weight"))
            .ok_or_else(|| anyhow::anyhow!("missing lora_a"))?;
        assert!(lora_a.is_trainable());
        Ok(())
    }

    #[test]
    fn test_parameter_names_follow_checkpoint_layout() -> anyhow::Result<()> {
        let model = tiny_model()?;
        let names: Vec<String> = model.named_parameters().into_iter().map(|p| p.name).collect();
        for expected in [
            "shared.weight",
            "encoder.block.0.layer.0.SelfAttention.q.weight",
            "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
            "encoder.block.1.layer.1.DenseReluDense.wi.weight",
            "decoder.block.0.layer.1.EncDecAttention.k.weight",
            "decoder.block.1.layer.2.layer_norm.weight",
            "decoder.final_layer_norm.weight",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        assert!(!names.iter().any(|n| n == "encoder.block.1.layer.0.SelfAttention.relative_attention_bias.weight"));
        Ok(())
    }

    #[test]
    fn test_unknown_activation_rejected() {
        assert!(Activation::parse("gated-tanh").is_err());
        assert_eq!(Activation::parse("gated-gelu").ok(), Some((Activation::GeluNew, true)));
        assert_eq!(Activation::parse("relu").ok(), Some((Activation::Relu, false)));
    }
}
